//! Article identity and the two-phase deduplicator.
//!
//! Phase one collapses a fetched batch to one candidate per
//! [`ArticleIdentity`], preferring the richer raw summary. Phase two drops
//! candidates already recorded in the [`DedupHorizon`] by an earlier run.
//!
//! The horizon is bounded twice: entries expire after a time window and,
//! when the window still holds too many, the oldest are evicted. Each entry
//! carries its latest sighting, and every run refreshes the identities it
//! filtered out, so the window only forgets stories that have left every
//! source. Only identities whose article was saved (or found already
//! present) are added, so an article lost to a database error is
//! rediscovered on the next run.

use crate::models::CandidateArticle;
use crate::utils::collapse_whitespace;
use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;
use url::Url;

/// Query parameters that identify a campaign or click rather than a story.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "msclkid", "mc_cid", "mc_eid", "ref", "ref_src", "igshid", "ocid",
    "cmpid", "_ga",
];

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Lower-cased, whitespace-collapsed title.
pub fn normalize_title(title: &str) -> String {
    collapse_whitespace(title).to_lowercase()
}

/// Canonical form of an article URL.
///
/// Scheme folds to https, a leading `www.` is dropped, fragments and
/// tracking parameters are removed, and a trailing slash on a non-root path
/// is trimmed. Unparseable links fall back to lower-cased text.
pub fn normalize_link(link: &str) -> String {
    let Ok(mut url) = Url::parse(link.trim()) else {
        return collapse_whitespace(link).to_lowercase();
    };
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(&kept);
    }

    let host = url.host_str().unwrap_or_default();
    let host = host.strip_prefix("www.").unwrap_or(host);
    let mut path = url.path();
    if path.len() > 1 {
        path = path.trim_end_matches('/');
    }

    let mut out = format!("https://{host}");
    if let Some(port) = url.port() {
        out.push_str(&format!(":{port}"));
    }
    out.push_str(path);
    if let Some(q) = url.query() {
        out.push('?');
        out.push_str(q);
    }
    out.to_lowercase()
}

/// Stable key under which two candidates count as the same story.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArticleIdentity(String);

impl ArticleIdentity {
    pub fn of(title: &str, link: &str) -> Self {
        Self(format!("{}|{}", normalize_title(title), normalize_link(link)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArticleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bounded memory of identities ingested by previous runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupHorizon {
    entries: BTreeMap<ArticleIdentity, DateTime<Utc>>,
}

impl DedupHorizon {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &ArticleIdentity) -> bool {
        self.entries.contains_key(id)
    }

    /// Record a sighting of `id`. An existing entry keeps the later timestamp.
    pub fn record(&mut self, id: ArticleIdentity, seen_at: DateTime<Utc>) {
        let seen = self.entries.entry(id).or_insert(seen_at);
        if seen_at > *seen {
            *seen = seen_at;
        }
    }

    /// Drop entries older than `window`, then evict the oldest until at most
    /// `max_entries` remain. Returns how many entries were removed.
    pub fn prune(&mut self, now: DateTime<Utc>, window: Duration, max_entries: usize) -> usize {
        let before = self.entries.len();
        let cutoff = now - window;
        self.entries.retain(|_, seen| *seen >= cutoff);

        let excess = self.entries.len().saturating_sub(max_entries);
        if excess > 0 {
            let oldest: Vec<ArticleIdentity> = self
                .entries
                .iter()
                .sorted_by_key(|(_, seen)| **seen)
                .take(excess)
                .map(|(id, _)| id.clone())
                .collect();
            for id in oldest {
                self.entries.remove(&id);
            }
        }
        before - self.entries.len()
    }
}

/// Candidates that survived both phases, each paired with its identity.
#[derive(Debug, Default)]
pub struct DedupOutcome {
    pub unique: Vec<(ArticleIdentity, CandidateArticle)>,
    pub duplicates_in_batch: usize,
    /// Identities dropped because an earlier run already recorded them.
    pub seen_before: Vec<ArticleIdentity>,
}

/// Phase one: one candidate per identity, richer raw summary wins, ties keep
/// the first encountered. Output keeps first-encounter order.
pub fn collapse_batch(candidates: Vec<CandidateArticle>) -> Vec<(ArticleIdentity, CandidateArticle)> {
    let mut slots: Vec<(ArticleIdentity, CandidateArticle)> = Vec::with_capacity(candidates.len());
    let mut index: HashMap<ArticleIdentity, usize> = HashMap::with_capacity(candidates.len());

    for candidate in candidates {
        let id = candidate.identity();
        match index.get(&id) {
            Some(&i) => {
                if candidate.summary_len() > slots[i].1.summary_len() {
                    debug!(identity = %id, kept = %candidate.source_id, "Replacing duplicate with richer summary");
                    slots[i].1 = candidate;
                }
            }
            None => {
                index.insert(id.clone(), slots.len());
                slots.push((id, candidate));
            }
        }
    }
    slots
}

/// Both phases against the horizon loaded at the start of the run.
pub fn deduplicate(candidates: Vec<CandidateArticle>, horizon: &DedupHorizon) -> DedupOutcome {
    let fetched = candidates.len();
    let collapsed = collapse_batch(candidates);
    let duplicates_in_batch = fetched - collapsed.len();

    let (unique, seen): (Vec<_>, Vec<_>) =
        collapsed.into_iter().partition(|(id, _)| !horizon.contains(id));

    DedupOutcome {
        unique,
        duplicates_in_batch,
        seen_before: seen.into_iter().map(|(id, _)| id).collect(),
    }
}
