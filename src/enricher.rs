//! AI categorization and summarization with per-article fallback.
//!
//! Every surviving candidate gets one request to the [`AiService`], wrapped
//! in the enrichment [`CallPolicy`]. Requests run concurrently up to a fixed
//! cap to respect provider rate limits. Whatever goes wrong with one article
//! (timeout, quota, malformed reply) only costs that article its AI summary:
//! it is still returned, filed as `Uncategorized` with the raw summary.

use crate::ai::{AiService, EnrichmentRequest};
use crate::dedup::ArticleIdentity;
use crate::errors::EnrichmentError;
use crate::models::{CandidateArticle, Category, EnrichedArticle};
use crate::policy::CallPolicy;
use crate::utils::{looks_truncated, truncate_chars, truncate_for_log};
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

/// Longest title prefix used as a summary when nothing better exists.
const FALLBACK_TITLE_CHARS: usize = 200;

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*```[a-zA-Z]*\s*(.*?)\s*```\s*$").expect("static regex"));

#[derive(Debug, Deserialize)]
struct RawVerdict {
    category: String,
    summary: String,
}

/// A parsed, validated model reply.
#[derive(Debug, Clone, PartialEq)]
pub struct AiVerdict {
    pub category: Category,
    pub summary: String,
}

/// Strip code fences and any prose around the JSON object.
fn extract_json(raw: &str) -> &str {
    let s = CODE_FENCE
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw)
        .trim();
    match (s.find('{'), s.rfind('}')) {
        (Some(start), Some(end)) if end > start => &s[start..=end],
        (Some(start), _) => &s[start..],
        _ => s,
    }
}

/// Parse a model reply. Unknown category labels map to `Uncategorized`.
pub fn parse_verdict(raw: &str) -> Result<AiVerdict, serde_json::Error> {
    let verdict: RawVerdict = serde_json::from_str(extract_json(raw))?;
    let category = Category::parse_label(&verdict.category).unwrap_or_else(|| {
        warn!(label = %verdict.category, "Model returned a category outside the set");
        Category::Uncategorized
    });
    Ok(AiVerdict {
        category,
        summary: verdict.summary.trim().to_string(),
    })
}

/// Summary used when the AI result is unavailable.
pub fn fallback_summary(candidate: &CandidateArticle) -> String {
    match candidate.summary_raw.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => truncate_chars(&candidate.title, FALLBACK_TITLE_CHARS),
    }
}

#[derive(Debug, Default)]
pub struct EnrichmentReport {
    pub articles: Vec<EnrichedArticle>,
    /// Articles whose category and summary came from the model.
    pub ai_processed: usize,
    /// Articles that fell back to raw content.
    pub errors: usize,
}

pub struct Enricher<A> {
    ai: A,
    policy: CallPolicy,
    concurrency: usize,
}

impl<A: AiService> Enricher<A> {
    pub fn new(ai: A, policy: CallPolicy, concurrency: usize) -> Self {
        Self {
            ai,
            policy,
            concurrency: concurrency.max(1),
        }
    }

    /// Ask once; if the reply was cut off mid-JSON, ask exactly one more time.
    async fn ask(&self, request: &EnrichmentRequest) -> Result<AiVerdict, EnrichmentError> {
        let raw = self.ai.complete(request).await?;
        let parsed = match parse_verdict(&raw) {
            Err(e) if looks_truncated(&e) => {
                warn!(error = %e, "EOF while parsing; re-asking once");
                let retry = self.ai.complete(request).await?;
                parse_verdict(&retry).map_err(|e| (e, retry))
            }
            other => other.map_err(|e| (e, raw)),
        };

        match parsed {
            Ok(v) if v.summary.is_empty() => Err(EnrichmentError::Malformed("empty summary".to_string())),
            Ok(v) => Ok(v),
            Err((e, reply)) => Err(EnrichmentError::Malformed(format!(
                "{e}; reply: {}",
                truncate_for_log(&reply, 200)
            ))),
        }
    }

    async fn enrich_one(&self, identity: ArticleIdentity, candidate: CandidateArticle) -> EnrichedArticle {
        let request = EnrichmentRequest {
            title: candidate.title.clone(),
            raw_summary: candidate.summary_raw.clone(),
        };
        let settled = self
            .policy
            .call_or_else(
                "enrich",
                || self.ask(&request),
                |_| AiVerdict {
                    category: Category::Uncategorized,
                    summary: fallback_summary(&candidate),
                },
            )
            .await;

        let enriched_by_ai = !settled.is_fallback();
        let (verdict, error) = settled.into_parts();
        if let Some(e) = error {
            warn!(identity = %identity, error = %e, "Enrichment failed; using raw content");
        } else {
            debug!(identity = %identity, category = %verdict.category, "Enriched article");
        }

        EnrichedArticle {
            candidate,
            identity,
            category: verdict.category,
            ai_summary: verdict.summary,
            enriched_by_ai,
        }
    }

    /// Enrich a deduplicated batch. Output order follows completion, not input.
    #[instrument(level = "info", skip_all, fields(batch = batch.len(), concurrency = self.concurrency))]
    pub async fn enrich_all(&self, batch: Vec<(ArticleIdentity, CandidateArticle)>) -> EnrichmentReport {
        let articles: Vec<EnrichedArticle> = stream::iter(batch)
            .map(|(identity, candidate)| self.enrich_one(identity, candidate))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let ai_processed = articles.iter().filter(|a| a.enriched_by_ai).count();
        let errors = articles.len() - ai_processed;
        info!(total = articles.len(), ai_processed, fallbacks = errors, "Completed enrichment");

        EnrichmentReport {
            articles,
            ai_processed,
            errors,
        }
    }
}
