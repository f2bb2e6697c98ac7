//! Data models flowing through the ingestion pipeline.
//!
//! - [`CandidateArticle`]: an upstream item as normalized by a source client
//! - [`EnrichedArticle`]: a candidate after AI categorization and summarization
//! - [`StoredArticle`]: the row handed to the article store
//! - [`RunStats`] and [`RunState`]: per-run counters and the durable record
//!   the next run and the health endpoint read
//!
//! Field names serialize in snake_case; the persisted row and the run-state
//! file are the only external JSON shapes.

use crate::dedup::{ArticleIdentity, DedupHorizon};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which kind of upstream a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Rss,
    SearchApi,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Rss => f.write_str("rss"),
            SourceKind::SearchApi => f.write_str("search_api"),
        }
    }
}

/// An unprocessed upstream item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateArticle {
    pub title: String,
    /// Absolute URL of the story.
    pub link: String,
    pub published_at: DateTime<Utc>,
    pub summary_raw: Option<String>,
    pub source_kind: SourceKind,
    pub source_id: String,
}

impl CandidateArticle {
    pub fn identity(&self) -> ArticleIdentity {
        ArticleIdentity::of(&self.title, &self.link)
    }

    /// Length of the raw summary, zero when absent or blank.
    pub fn summary_len(&self) -> usize {
        self.summary_raw
            .as_deref()
            .map(|s| s.trim().chars().count())
            .unwrap_or(0)
    }
}

/// The closed set of categories the site files stories under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Politics,
    Business,
    Technology,
    Sports,
    Entertainment,
    Health,
    Science,
    World,
    Uncategorized,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::Politics,
        Category::Business,
        Category::Technology,
        Category::Sports,
        Category::Entertainment,
        Category::Health,
        Category::Science,
        Category::World,
        Category::Uncategorized,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Politics => "Politics",
            Category::Business => "Business",
            Category::Technology => "Technology",
            Category::Sports => "Sports",
            Category::Entertainment => "Entertainment",
            Category::Health => "Health",
            Category::Science => "Science",
            Category::World => "World",
            Category::Uncategorized => "Uncategorized",
        }
    }

    /// Case-insensitive lookup that also accepts the labels models tend to
    /// produce instead of the canonical ones.
    pub fn parse_label(label: &str) -> Option<Category> {
        let l = label.trim().to_lowercase();
        let c = match l.as_str() {
            "politics" | "politics & governance" | "government" => Category::Politics,
            "business" | "economy" | "business & economy" | "finance" => Category::Business,
            "technology" | "tech" | "science & technology" => Category::Technology,
            "sports" | "sport" => Category::Sports,
            "entertainment" | "culture" | "arts & entertainment" => Category::Entertainment,
            "health" | "health & medicine" => Category::Health,
            "science" | "environment" => Category::Science,
            "world" | "international" | "world news" => Category::World,
            "uncategorized" | "other" | "general" => Category::Uncategorized,
            _ => return None,
        };
        Some(c)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate after enrichment, before a slug is assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedArticle {
    pub candidate: CandidateArticle,
    pub identity: ArticleIdentity,
    pub category: Category,
    pub ai_summary: String,
    /// False when the fallback summary was used.
    pub enriched_by_ai: bool,
}

/// The row written to the article store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredArticle {
    pub slug: String,
    pub title: String,
    pub link: String,
    pub summary: String,
    pub category: Category,
    pub published_at: DateTime<Utc>,
    pub source_kind: SourceKind,
    pub source_id: String,
}

impl StoredArticle {
    pub fn from_enriched(article: &EnrichedArticle, slug: String) -> Self {
        Self {
            slug,
            title: article.candidate.title.clone(),
            link: article.candidate.link.clone(),
            summary: article.ai_summary.clone(),
            category: article.category,
            published_at: article.candidate.published_at,
            source_kind: article.candidate.source_kind,
            source_id: article.candidate.source_id.clone(),
        }
    }
}

/// Pre-dedup candidate counts per source kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCounts {
    pub rss: usize,
    pub search_api: usize,
}

impl SourceCounts {
    pub fn add(&mut self, kind: SourceKind, n: usize) {
        match kind {
            SourceKind::Rss => self.rss += n,
            SourceKind::SearchApi => self.search_api += n,
        }
    }

    pub fn total(&self) -> usize {
        self.rss + self.search_api
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Timer,
    Manual,
}

/// Counters for one pipeline execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub source_articles: SourceCounts,
    pub unique_articles: usize,
    pub ai_processed: usize,
    pub saved_articles: usize,
    pub skipped_articles: usize,
    pub errors: usize,
    pub execution_time_ms: u64,
}

impl RunStats {
    pub fn new(trigger: Trigger, started_at: DateTime<Utc>) -> Self {
        Self {
            trigger,
            started_at,
            source_articles: SourceCounts::default(),
            unique_articles: 0,
            ai_processed: 0,
            saved_articles: 0,
            skipped_articles: 0,
            errors: 0,
            execution_time_ms: 0,
        }
    }
}

/// Cumulative counters across every completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub runs: u64,
    pub saved_articles: u64,
    pub errors: u64,
}

/// The durable record shared between consecutive runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Incremented by every completed run.
    pub version: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_stats: Option<RunStats>,
    #[serde(default)]
    pub totals: Totals,
    #[serde(default)]
    pub horizon: DedupHorizon,
}

impl RunState {
    /// Build the successor state for a finished run. `self` is left untouched
    /// so the caller can discard the result if the run is abandoned.
    pub fn advance(&self, stats: RunStats, horizon: DedupHorizon, finished_at: DateTime<Utc>) -> RunState {
        RunState {
            version: self.version + 1,
            last_run_at: Some(finished_at),
            totals: Totals {
                runs: self.totals.runs + 1,
                saved_articles: self.totals.saved_articles + stats.saved_articles as u64,
                errors: self.totals.errors + stats.errors as u64,
            },
            last_stats: Some(stats),
            horizon,
        }
    }
}
