//! News-search API client.
//!
//! Issues one authenticated query per run against a NewsAPI-style endpoint
//! (`q`, `language`, `pageSize`; key in the `X-Api-Key` header). The source
//! is optional: with no key configured, or with a key the provider rejects,
//! it contributes zero items without counting an error, so deployments
//! without a subscription degrade gracefully.

use super::{SourceClient, absolute_link, parse_timestamp};
use crate::errors::{SourceError, SourceErrorKind};
use crate::models::{CandidateArticle, SourceKind};
use crate::utils::{strip_html, truncate_for_log};
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt;
use tracing::{info, instrument, warn};

#[derive(Clone)]
pub struct SearchApiClient {
    id: String,
    endpoint: String,
    query: String,
    language: String,
    page_size: usize,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl fmt::Debug for SearchApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchApiClient")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("query", &self.query)
            .field("api_key", &self.api_key.as_deref().map(|_| "<redacted>"))
            .finish()
    }
}

impl SearchApiClient {
    pub fn new(
        id: &str,
        endpoint: &str,
        query: &str,
        language: &str,
        page_size: usize,
        api_key: Option<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
            query: query.to_string(),
            language: language.to_string(),
            page_size,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            http,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    fn request_url(&self) -> String {
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!(
            "{}{}q={}&language={}&pageSize={}",
            self.endpoint,
            sep,
            urlencoding::encode(&self.query),
            urlencoding::encode(&self.language),
            self.page_size
        )
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    status: Option<String>,
    message: Option<String>,
    #[serde(default)]
    articles: Vec<SearchArticle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchArticle {
    title: Option<String>,
    url: Option<String>,
    description: Option<String>,
    published_at: Option<String>,
}

impl SourceClient for SearchApiClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::SearchApi
    }

    #[instrument(level = "info", skip_all, fields(source_id = %self.id))]
    async fn fetch(&self) -> Result<Vec<CandidateArticle>, SourceError> {
        let Some(api_key) = self.api_key.as_deref() else {
            info!("No search API key configured; source disabled");
            return Ok(Vec::new());
        };

        let response = self
            .http
            .get(self.request_url())
            .header("X-Api-Key", api_key)
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(&self.id, &e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(%status, "Search API rejected the key; source disabled for this run");
            return Ok(Vec::new());
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::new(SourceErrorKind::Blocked, &self.id, "rate limited"));
        }
        if !status.is_success() {
            return Err(SourceError::new(
                SourceErrorKind::HttpError,
                &self.id,
                format!("HTTP {status}"),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SourceError::from_reqwest(&self.id, &e))?;
        let parsed: SearchResponse = serde_json::from_str(&body).map_err(|e| {
            SourceError::new(
                SourceErrorKind::ParseError,
                &self.id,
                format!("{e}; body: {}", truncate_for_log(&body, 200)),
            )
        })?;

        if parsed.status.as_deref() == Some("error") {
            return Err(SourceError::new(
                SourceErrorKind::HttpError,
                &self.id,
                parsed.message.unwrap_or_else(|| "provider reported an error".to_string()),
            ));
        }

        let fetched_at = Utc::now();
        let candidates: Vec<CandidateArticle> = parsed
            .articles
            .into_iter()
            .filter_map(|a| {
                let title = strip_html(a.title.as_deref()?);
                if title.is_empty() || title == "[Removed]" {
                    return None;
                }
                Some(CandidateArticle {
                    title,
                    link: absolute_link(a.url.as_deref()?)?,
                    published_at: a
                        .published_at
                        .as_deref()
                        .and_then(parse_timestamp)
                        .unwrap_or(fetched_at),
                    summary_raw: a.description.as_deref().map(strip_html).filter(|s| !s.is_empty()),
                    source_kind: SourceKind::SearchApi,
                    source_id: self.id.clone(),
                })
            })
            .take(self.page_size)
            .collect();

        info!(count = candidates.len(), "Fetched search results");
        Ok(candidates)
    }
}
