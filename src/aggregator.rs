//! Concurrent fan-out to every configured source.
//!
//! Each source runs under the source [`CallPolicy`], so a slow or failing
//! upstream costs exactly one error and never delays or cancels the others.
//! The merged batch carries no ordering guarantee.

use crate::models::{CandidateArticle, SourceCounts, SourceKind};
use crate::policy::CallPolicy;
use crate::sources::SourceClient;
use futures::stream::{self, StreamExt};
use tracing::{info, instrument, warn};

#[derive(Debug, Default)]
pub struct Aggregation {
    pub candidates: Vec<CandidateArticle>,
    /// Sources that contributed an error instead of a batch.
    pub errors: usize,
    pub counts: SourceCounts,
}

pub struct Aggregator<S> {
    sources: Vec<S>,
    policy: CallPolicy,
    concurrency: usize,
}

impl<S: SourceClient> Aggregator<S> {
    pub fn new(sources: Vec<S>, policy: CallPolicy, concurrency: usize) -> Self {
        Self {
            sources,
            policy,
            concurrency: concurrency.max(1),
        }
    }

    #[instrument(level = "info", skip_all, fields(sources = self.sources.len()))]
    pub async fn collect(&self) -> Aggregation {
        let results: Vec<_> = stream::iter(self.sources.iter())
            .map(|source| async move {
                let outcome = self.policy.call(source.id(), || source.fetch()).await;
                (source.kind(), source.id(), outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut aggregation = Aggregation::default();
        for (kind, id, outcome) in results {
            match outcome {
                Ok(items) => {
                    info!(source_id = id, %kind, count = items.len(), "Source delivered");
                    aggregation.counts.add(kind, items.len());
                    aggregation.candidates.extend(items);
                }
                Err(e) => {
                    warn!(source_id = id, %kind, kind_of_error = %e.kind, error = %e, "Source failed");
                    aggregation.errors += 1;
                }
            }
        }

        info!(
            total = aggregation.counts.total(),
            rss = aggregation.counts.rss,
            search_api = aggregation.counts.search_api,
            errors = aggregation.errors,
            "Aggregated sources"
        );
        aggregation
    }

    pub fn count_of(&self, kind: SourceKind) -> usize {
        self.sources.iter().filter(|s| s.kind() == kind).count()
    }
}
