//! Upstream source clients.
//!
//! Each client turns one upstream into a batch of [`CandidateArticle`]s or a
//! single [`SourceError`]. A batch is returned only when the whole payload
//! parsed cleanly; there are no partial successes.
//!
//! # Supported Sources
//!
//! | Kind | Module | Method | Notes |
//! |------|--------|--------|-------|
//! | RSS 2.0 / RSS 1.0 / Atom | [`rss`] | HTTP GET + XML | Rotating browser User-Agent |
//! | News search API | [`search`] | Authenticated HTTP GET + JSON | Disabled when no key is configured |

pub mod rss;
pub mod search;

use crate::errors::SourceError;
use crate::models::{CandidateArticle, SourceKind};
use chrono::{DateTime, NaiveDateTime, Utc};
use rand::{Rng, rng};
use url::Url;

pub use rss::RssClient;
pub use search::SearchApiClient;

/// Browser User-Agent strings rotated across feed requests.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
];

pub fn random_user_agent() -> &'static str {
    USER_AGENTS[rng().random_range(0..USER_AGENTS.len())]
}

/// One upstream the aggregator can fan out to.
pub trait SourceClient {
    fn id(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Fetch the current batch from the upstream.
    async fn fetch(&self) -> Result<Vec<CandidateArticle>, SourceError>;
}

/// The configured sources, dispatched statically.
#[derive(Debug)]
pub enum Source {
    Rss(RssClient),
    Search(SearchApiClient),
}

impl SourceClient for Source {
    fn id(&self) -> &str {
        match self {
            Source::Rss(c) => c.id(),
            Source::Search(c) => c.id(),
        }
    }

    fn kind(&self) -> SourceKind {
        match self {
            Source::Rss(c) => c.kind(),
            Source::Search(c) => c.kind(),
        }
    }

    async fn fetch(&self) -> Result<Vec<CandidateArticle>, SourceError> {
        match self {
            Source::Rss(c) => c.fetch().await,
            Source::Search(c) => c.fetch().await,
        }
    }
}

/// Best-effort timestamp parsing across the formats feeds and APIs emit.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|n| n.and_utc())
}

/// Accept only absolute http(s) links; anything else cannot anchor an identity.
pub fn absolute_link(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}
