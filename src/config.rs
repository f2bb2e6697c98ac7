//! Worker configuration: a YAML file, overridden by CLI flags and environment.
//!
//! Every tunable has a default, so a config file only needs the feeds and
//! the database location. A minimal file:
//!
//! ```yaml
//! feeds:
//!   - id: a-daily
//!     url: https://a.test/rss.xml
//! search:
//!   query: "nepal OR kathmandu"
//! database:
//!   url: https://db.example.co/rest/v1
//! ```

use crate::cli::Cli;
use crate::errors::ConfigError;
use crate::pipeline::HorizonPolicy;
use crate::policy::CallPolicy;
use crate::sources::{RssClient, SearchApiClient, Source};
use itertools::Itertools;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FeedConfig {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub id: String,
    pub endpoint: String,
    pub query: String,
    pub language: String,
    pub page_size: usize,
    pub api_key: Option<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            id: "news-search".to_string(),
            endpoint: "https://newsapi.org/v2/everything".to_string(),
            query: String::new(),
            language: "en".to_string(),
            page_size: 20,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub api_base: String,
    pub model: String,
    pub temperature: f32,
    pub api_key: Option<String>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub table: String,
    pub service_key: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            table: "articles".to_string(),
            service_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub source_timeout_secs: u64,
    pub source_retries: usize,
    pub source_concurrency: usize,
    pub max_items_per_source: usize,
    pub enrich_timeout_secs: u64,
    pub enrich_retries: usize,
    pub enrich_concurrency: usize,
    pub persist_timeout_secs: u64,
    pub persist_retries: usize,
    pub run_timeout_secs: u64,
    pub horizon_hours: i64,
    pub horizon_max_entries: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_timeout_secs: 15,
            source_retries: 1,
            source_concurrency: 4,
            max_items_per_source: 20,
            enrich_timeout_secs: 20,
            enrich_retries: 1,
            enrich_concurrency: 3,
            persist_timeout_secs: 10,
            persist_retries: 2,
            run_timeout_secs: 240,
            horizon_hours: 72,
            horizon_max_entries: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    pub listen: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub feeds: Vec<FeedConfig>,
    pub search: Option<SearchConfig>,
    pub ai: AiConfig,
    pub database: DatabaseConfig,
    pub pipeline: PipelineConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.to_string(),
            error,
        })?;
        let config = Self::from_yaml(&yaml)?;
        info!(path, feeds = config.feeds.len(), search = config.search.is_some(), "Loaded configuration");
        Ok(config)
    }

    /// Apply CLI flags and environment values on top of the file.
    pub fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(listen) = &cli.listen {
            self.scheduler.listen = listen.clone();
        }
        if let Some(secs) = cli.interval_secs {
            self.scheduler.interval_secs = secs;
        }
        if let Some(key) = &cli.search_api_key {
            match self.search.as_mut() {
                Some(search) => search.api_key = Some(key.clone()),
                None => warn!("Search API key given but no search section is configured; ignoring it"),
            }
        }
        if let Some(key) = &cli.ai_api_key {
            self.ai.api_key = Some(key.clone());
        }
        if let Some(url) = &cli.database_url {
            self.database.url = Some(url.clone());
        }
        if let Some(key) = &cli.database_service_key {
            self.database.service_key = Some(key.clone());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.feeds.is_empty() && self.search.is_none() {
            return invalid("no sources configured: add feeds or a search section".into());
        }
        for feed in &self.feeds {
            match Url::parse(&feed.url) {
                Ok(u) if matches!(u.scheme(), "http" | "https") => {}
                _ => return invalid(format!("feed {} has no absolute http(s) url: {:?}", feed.id, feed.url)),
            }
        }
        if let Some(id) = self.feeds.iter().map(|f| f.id.as_str()).duplicates().next() {
            return invalid(format!("feed id {id} is used more than once"));
        }
        if let Some(search) = &self.search {
            if search.query.trim().is_empty() {
                return invalid("search.query must not be empty".into());
            }
        }

        let p = &self.pipeline;
        for (name, value) in [
            ("pipeline.source_concurrency", p.source_concurrency),
            ("pipeline.enrich_concurrency", p.enrich_concurrency),
            ("pipeline.max_items_per_source", p.max_items_per_source),
            ("pipeline.horizon_max_entries", p.horizon_max_entries),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be greater than zero"));
            }
        }
        for (name, value) in [
            ("pipeline.source_timeout_secs", p.source_timeout_secs),
            ("pipeline.enrich_timeout_secs", p.enrich_timeout_secs),
            ("pipeline.persist_timeout_secs", p.persist_timeout_secs),
            ("pipeline.run_timeout_secs", p.run_timeout_secs),
            ("scheduler.interval_secs", self.scheduler.interval_secs),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be greater than zero"));
            }
        }
        if p.horizon_hours <= 0 {
            return invalid("pipeline.horizon_hours must be greater than zero".into());
        }

        match self.database.url.as_deref().map(str::trim) {
            None | Some("") => invalid("database.url is required (or set DATABASE_URL)".into()),
            Some(_) => Ok(()),
        }
    }

    pub fn source_policy(&self) -> CallPolicy {
        CallPolicy::new(Duration::from_secs(self.pipeline.source_timeout_secs), self.pipeline.source_retries)
    }

    pub fn enrich_policy(&self) -> CallPolicy {
        CallPolicy::new(Duration::from_secs(self.pipeline.enrich_timeout_secs), self.pipeline.enrich_retries)
    }

    pub fn persist_policy(&self) -> CallPolicy {
        CallPolicy::new(Duration::from_secs(self.pipeline.persist_timeout_secs), self.pipeline.persist_retries)
            .with_base_delay(Duration::from_millis(500))
    }

    pub fn horizon_policy(&self) -> HorizonPolicy {
        HorizonPolicy {
            window: chrono::Duration::hours(self.pipeline.horizon_hours),
            max_entries: self.pipeline.horizon_max_entries,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.interval_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.run_timeout_secs)
    }

    /// One client per configured feed, plus the search source if configured.
    pub fn build_sources(&self, http: &reqwest::Client) -> Vec<Source> {
        let max_items = self.pipeline.max_items_per_source;
        let mut sources: Vec<Source> = self
            .feeds
            .iter()
            .map(|f| Source::Rss(RssClient::new(&f.id, &f.url, max_items, http.clone())))
            .collect();

        if let Some(s) = &self.search {
            let client = SearchApiClient::new(
                &s.id,
                &s.endpoint,
                &s.query,
                &s.language,
                s.page_size.min(max_items),
                s.api_key.clone(),
                http.clone(),
            );
            if !client.is_enabled() {
                warn!(source_id = %s.id, "No search API key; the search source will contribute nothing");
            }
            sources.push(Source::Search(client));
        }
        sources
    }
}
