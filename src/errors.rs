//! Error taxonomy for the ingestion worker.
//!
//! Everything below the run level is absorbed and counted by the pipeline:
//! a [`SourceError`] costs one source, an [`EnrichmentError`] costs one AI
//! call, a [`PersistenceError`] costs one article. Only [`RunError`] ends a
//! run early, and even that is logged rather than propagated out of the
//! scheduler loop.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Marks errors that the [`CallPolicy`](crate::policy::CallPolicy) may retry.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Lets the call policy report an expired deadline in the caller's own error type.
pub trait FromTimeout {
    fn timed_out(op: &str, after: Duration) -> Self;
}

/// Why a single source contributed zero items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    Timeout,
    HttpError,
    ParseError,
    Blocked,
}

impl fmt::Display for SourceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceErrorKind::Timeout => "timeout",
            SourceErrorKind::HttpError => "http error",
            SourceErrorKind::ParseError => "parse error",
            SourceErrorKind::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind} from source {source_id}: {detail}")]
pub struct SourceError {
    pub kind: SourceErrorKind,
    pub source_id: String,
    pub detail: String,
}

impl SourceError {
    pub fn new(kind: SourceErrorKind, source_id: &str, detail: impl Into<String>) -> Self {
        Self {
            kind,
            source_id: source_id.to_string(),
            detail: detail.into(),
        }
    }

    /// Classify a transport-level reqwest failure.
    pub fn from_reqwest(source_id: &str, e: &reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            SourceErrorKind::Timeout
        } else if e.is_decode() {
            SourceErrorKind::ParseError
        } else {
            SourceErrorKind::HttpError
        };
        Self::new(kind, source_id, e.to_string())
    }
}

impl FromTimeout for SourceError {
    fn timed_out(op: &str, after: Duration) -> Self {
        Self::new(SourceErrorKind::Timeout, op, format!("no response within {after:?}"))
    }
}

impl Transient for SourceError {
    fn is_transient(&self) -> bool {
        matches!(self.kind, SourceErrorKind::Timeout | SourceErrorKind::HttpError)
    }
}

#[derive(Debug, Clone, Error)]
pub enum EnrichmentError {
    #[error("AI request timed out after {0:?}")]
    Timeout(Duration),
    #[error("AI quota or rate limit exceeded: {0}")]
    Quota(String),
    #[error("AI service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("AI transport error: {0}")]
    Transport(String),
    #[error("malformed AI response: {0}")]
    Malformed(String),
}

impl FromTimeout for EnrichmentError {
    fn timed_out(_op: &str, after: Duration) -> Self {
        EnrichmentError::Timeout(after)
    }
}

impl Transient for EnrichmentError {
    fn is_transient(&self) -> bool {
        match self {
            EnrichmentError::Timeout(_)
            | EnrichmentError::Quota(_)
            | EnrichmentError::Transport(_) => true,
            EnrichmentError::Http { status, .. } => *status >= 500,
            EnrichmentError::Malformed(_) => false,
        }
    }
}

/// A write that failed for a reason other than "already present".
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    #[error("database call timed out after {0:?}")]
    Timeout(Duration),
    #[error("database returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("database transport error: {0}")]
    Transport(String),
    #[error("could not encode or decode payload: {0}")]
    Payload(String),
}

impl FromTimeout for PersistenceError {
    fn timed_out(_op: &str, after: Duration) -> Self {
        PersistenceError::Timeout(after)
    }
}

impl Transient for PersistenceError {
    fn is_transient(&self) -> bool {
        match self {
            PersistenceError::Timeout(_) | PersistenceError::Transport(_) => true,
            PersistenceError::Http { status, .. } => *status >= 500,
            PersistenceError::Payload(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("run-state I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("run-state is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure of a whole run. The previous run state stays authoritative.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("run exceeded its {0:?} budget and was abandoned")]
    Timeout(Duration),
    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {error}")]
    Read { path: String, error: std::io::Error },
    #[error("config file is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
