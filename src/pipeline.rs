//! One end-to-end ingestion run.
//!
//! [`Pipeline::run_once`] loads the run state, fans out to the sources,
//! deduplicates, enriches, persists and writes the successor state in a
//! single save. It knows nothing about timers or triggers; the scheduler
//! decides when to call it and bounds how long it may take.

use crate::aggregator::Aggregator;
use crate::ai::AiService;
use crate::dedup::{DedupHorizon, deduplicate};
use crate::enricher::Enricher;
use crate::errors::RunError;
use crate::models::{RunState, RunStats, Trigger};
use crate::persist::{ArticleStore, Persister};
use crate::sources::SourceClient;
use crate::state::RunStateStore;
use chrono::Utc;
use std::time::Instant;
use tracing::{debug, info, instrument};

/// How long identities stay in the dedup horizon, and how many at most.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HorizonPolicy {
    pub window: chrono::Duration,
    pub max_entries: usize,
}

impl Default for HorizonPolicy {
    fn default() -> Self {
        Self {
            window: chrono::Duration::hours(72),
            max_entries: 5000,
        }
    }
}

impl HorizonPolicy {
    fn apply(&self, horizon: &mut DedupHorizon, now: chrono::DateTime<Utc>) -> usize {
        horizon.prune(now, self.window, self.max_entries)
    }
}

pub struct Pipeline<S, A, D, R> {
    aggregator: Aggregator<S>,
    enricher: Enricher<A>,
    persister: Persister<D>,
    state_store: R,
    horizon: HorizonPolicy,
}

impl<S, A, D, R> Pipeline<S, A, D, R>
where
    S: SourceClient,
    A: AiService,
    D: ArticleStore,
    R: RunStateStore,
{
    pub fn new(
        aggregator: Aggregator<S>,
        enricher: Enricher<A>,
        persister: Persister<D>,
        state_store: R,
        horizon: HorizonPolicy,
    ) -> Self {
        Self {
            aggregator,
            enricher,
            persister,
            state_store,
            horizon,
        }
    }

    pub fn state_store(&self) -> &R {
        &self.state_store
    }

    /// Execute one run and return the state it persisted.
    ///
    /// Only a run-state read or write failure aborts the run. Everything
    /// else is absorbed and shows up in the returned stats as `errors`.
    #[instrument(level = "info", skip_all, fields(trigger = ?trigger))]
    pub async fn run_once(&self, trigger: Trigger) -> Result<RunState, RunError> {
        let started = Instant::now();
        let started_at = Utc::now();
        let mut stats = RunStats::new(trigger, started_at);

        let previous = self.state_store.load().await?.unwrap_or_default();
        let mut horizon = previous.horizon.clone();
        let expired = self.horizon.apply(&mut horizon, started_at);
        debug!(expired, remaining = horizon.len(), "Pruned dedup horizon");

        let aggregation = self.aggregator.collect().await;
        stats.source_articles = aggregation.counts;
        stats.errors += aggregation.errors;

        let dedup = deduplicate(aggregation.candidates, &horizon);
        stats.unique_articles = dedup.unique.len();
        info!(
            unique = dedup.unique.len(),
            duplicates_in_batch = dedup.duplicates_in_batch,
            seen_before = dedup.seen_before.len(),
            "Deduplicated candidates"
        );

        let enrichment = self.enricher.enrich_all(dedup.unique).await;
        stats.ai_processed = enrichment.ai_processed;
        stats.errors += enrichment.errors;

        let persisted = self.persister.persist_all(enrichment.articles).await;
        stats.saved_articles = persisted.saved.len();
        stats.skipped_articles = persisted.skipped.len();
        stats.errors += persisted.errors;

        let finished_at = Utc::now();
        for identity in persisted
            .saved
            .into_iter()
            .chain(persisted.skipped)
            .chain(dedup.seen_before)
        {
            horizon.record(identity, finished_at);
        }
        self.horizon.apply(&mut horizon, finished_at);

        stats.execution_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let next = previous.advance(stats, horizon, finished_at);
        self.state_store.save(&next).await?;

        if let Some(stats) = &next.last_stats {
            info!(
                version = next.version,
                unique = stats.unique_articles,
                ai_processed = stats.ai_processed,
                saved = stats.saved_articles,
                skipped = stats.skipped_articles,
                errors = stats.errors,
                elapsed_ms = stats.execution_time_ms,
                "Run complete"
            );
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SourceErrorKind;
    use crate::models::{Category, SourceKind};
    use crate::policy::CallPolicy;
    use crate::test_support::{
        MemoryArticleStore, MemoryRunStateStore, StubAi, StubSource, candidate,
    };
    use std::time::Duration;

    type TestPipeline = Pipeline<StubSource, StubAi, MemoryArticleStore, MemoryRunStateStore>;

    fn policy(timeout_ms: u64) -> CallPolicy {
        CallPolicy::new(Duration::from_millis(timeout_ms), 0).with_max_jitter(Duration::ZERO)
    }

    fn pipeline(
        sources: Vec<StubSource>,
        ai: StubAi,
        store: MemoryArticleStore,
        state: MemoryRunStateStore,
    ) -> TestPipeline {
        Pipeline::new(
            Aggregator::new(sources, policy(1000), 4),
            Enricher::new(ai, policy(200), 3),
            Persister::new(store, policy(1000)),
            state,
            HorizonPolicy::default(),
        )
    }

    fn single_feed() -> Vec<StubSource> {
        vec![StubSource::ok(
            "a",
            SourceKind::Rss,
            vec![candidate("Fuel prices rise", "https://a.test/1", SourceKind::Rss, "a")],
        )]
    }

    fn two_feeds() -> Vec<StubSource> {
        vec![
            StubSource::ok(
                "a",
                SourceKind::Rss,
                vec![
                    candidate("Fuel prices rise", "https://a.test/1", SourceKind::Rss, "a"),
                    candidate("Cup final tonight", "https://a.test/2", SourceKind::Rss, "a"),
                ],
            ),
            StubSource::ok(
                "news",
                SourceKind::SearchApi,
                vec![candidate("Rates on hold", "https://n.test/rates", SourceKind::SearchApi, "news")],
            ),
        ]
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let store = MemoryArticleStore::default();
        let state = MemoryRunStateStore::default();
        let p = pipeline(two_feeds(), StubAi::new(), store.clone(), state.clone());

        let first = p.run_once(Trigger::Timer).await.unwrap();
        let first_stats = first.last_stats.unwrap();
        assert_eq!(first_stats.unique_articles, 3);
        assert_eq!(first_stats.saved_articles, 3);
        assert_eq!(first.horizon.len(), 3);

        let second = p.run_once(Trigger::Timer).await.unwrap();
        let second_stats = second.last_stats.unwrap();
        assert_eq!(second_stats.unique_articles, 0);
        assert_eq!(second_stats.saved_articles, 0);
        assert_eq!(second.version, 2);
        assert_eq!(second.totals.runs, 2);
        assert_eq!(second.totals.saved_articles, 3);
        assert_eq!(store.slugs().len(), 3);
        assert_eq!(state.saves(), 2);
    }

    #[tokio::test]
    async fn test_tracking_params_collapse_across_sources() {
        let mut from_search = candidate(
            "Fuel prices rise",
            "https://a.test/1?utm_source=x",
            SourceKind::SearchApi,
            "news",
        );
        from_search.summary_raw = Some("Pump prices climbed for a third week.".into());
        let sources = vec![
            StubSource::ok(
                "a",
                SourceKind::Rss,
                vec![candidate("Fuel prices rise", "https://a.test/1", SourceKind::Rss, "a")],
            ),
            StubSource::ok("news", SourceKind::SearchApi, vec![from_search]),
        ];
        let store = MemoryArticleStore::default();
        let ai = StubAi::new();
        let p = pipeline(sources, ai.clone(), store.clone(), MemoryRunStateStore::default());

        let stats = p.run_once(Trigger::Manual).await.unwrap().last_stats.unwrap();
        assert_eq!(stats.source_articles.rss, 1);
        assert_eq!(stats.source_articles.search_api, 1);
        assert_eq!(stats.unique_articles, 1);
        assert_eq!(stats.saved_articles, 1);
        assert_eq!(ai.calls(), 1);

        let rows = store.articles();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source_kind, SourceKind::SearchApi);
    }

    #[tokio::test]
    async fn test_same_story_from_two_feeds_yields_one_article() {
        let sources = vec![
            StubSource::ok(
                "a",
                SourceKind::Rss,
                vec![candidate("Fuel prices rise", "https://a.test/1", SourceKind::Rss, "a")],
            ),
            StubSource::ok(
                "b",
                SourceKind::Rss,
                vec![candidate("Fuel Prices Rise", "https://a.test/1?utm_source=x", SourceKind::Rss, "b")],
            ),
        ];
        let store = MemoryArticleStore::default();
        let p = pipeline(sources, StubAi::new(), store.clone(), MemoryRunStateStore::default());

        let stats = p.run_once(Trigger::Timer).await.unwrap().last_stats.unwrap();
        assert_eq!(stats.source_articles.rss, 2);
        assert_eq!(stats.unique_articles, 1);
        assert_eq!(stats.saved_articles, 1);
        assert_eq!(store.articles().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_source_is_counted_and_others_saved() {
        let mut sources = two_feeds();
        sources.push(StubSource::failing("down", SourceKind::Rss, SourceErrorKind::HttpError));
        let store = MemoryArticleStore::default();
        let p = pipeline(sources, StubAi::new(), store.clone(), MemoryRunStateStore::default());

        let stats = p.run_once(Trigger::Timer).await.unwrap().last_stats.unwrap();
        assert!(stats.errors >= 1);
        assert_eq!(stats.saved_articles, 3);
        assert_eq!(store.slugs().len(), 3);
    }

    #[tokio::test]
    async fn test_enrichment_timeout_is_saved_uncategorized() {
        let ai = StubAi::new().slow_on("Cup final tonight", Duration::from_secs(5));
        let store = MemoryArticleStore::default();
        let p = pipeline(two_feeds(), ai, store.clone(), MemoryRunStateStore::default());

        let stats = p.run_once(Trigger::Timer).await.unwrap().last_stats.unwrap();
        assert_eq!(stats.saved_articles, 3);
        assert_eq!(stats.ai_processed, 2);
        assert_eq!(stats.errors, 1);

        let cup = store
            .articles()
            .into_iter()
            .find(|a| a.title == "Cup final tonight")
            .unwrap();
        assert_eq!(cup.category, Category::Uncategorized);
        assert_eq!(cup.summary, "Cup final tonight");
    }

    #[tokio::test]
    async fn test_slug_conflict_counts_as_skip() {
        let store = MemoryArticleStore::default();
        let rates = candidate("Rates on hold", "https://n.test/rates", SourceKind::SearchApi, "news");
        store.seed("rates-on-hold");
        store.seed(&format!("rates-on-hold-{}", crate::persist::slug_suffix(&rates.identity())));

        let p = pipeline(two_feeds(), StubAi::new(), store, MemoryRunStateStore::default());
        let state = p.run_once(Trigger::Timer).await.unwrap();
        let stats = state.last_stats.unwrap();
        assert_eq!(stats.saved_articles, 2);
        assert_eq!(stats.skipped_articles, 1);
        assert_eq!(stats.errors, 0);
        assert!(state.horizon.contains(&rates.identity()));
    }

    #[tokio::test]
    async fn test_persistence_failure_is_retried_next_run() {
        let store = MemoryArticleStore::default().failing_on("cup-final-tonight");
        let p = pipeline(two_feeds(), StubAi::new(), store, MemoryRunStateStore::default());

        let state = p.run_once(Trigger::Timer).await.unwrap();
        let cup = candidate("Cup final tonight", "https://a.test/2", SourceKind::Rss, "a");
        assert_eq!(state.last_stats.unwrap().errors, 1);
        assert!(!state.horizon.contains(&cup.identity()));

        let again = p.run_once(Trigger::Timer).await.unwrap().last_stats.unwrap();
        assert_eq!(again.unique_articles, 1);
    }

    #[tokio::test]
    async fn test_all_sources_failing_is_still_a_run() {
        let sources = vec![
            StubSource::failing("a", SourceKind::Rss, SourceErrorKind::Blocked),
            StubSource::failing("news", SourceKind::SearchApi, SourceErrorKind::Timeout),
        ];
        let state = MemoryRunStateStore::default();
        let p = pipeline(sources, StubAi::new(), MemoryArticleStore::default(), state.clone());

        let next = p.run_once(Trigger::Timer).await.unwrap();
        let stats = next.last_stats.unwrap();
        assert_eq!(stats.unique_articles, 0);
        assert_eq!(stats.saved_articles, 0);
        assert_eq!(stats.errors, 2);
        assert_eq!(next.version, 1);
        assert_eq!(state.saves(), 1);
    }

    #[tokio::test]
    async fn test_story_outliving_the_horizon_is_not_stored_twice() {
        let store = MemoryArticleStore::default();
        let p = Pipeline::new(
            Aggregator::new(single_feed(), policy(1000), 4),
            Enricher::new(StubAi::new(), policy(200), 3),
            Persister::new(store.clone(), policy(1000)),
            MemoryRunStateStore::default(),
            HorizonPolicy {
                window: chrono::Duration::milliseconds(50),
                max_entries: 100,
            },
        );

        let first = p.run_once(Trigger::Timer).await.unwrap().last_stats.unwrap();
        assert_eq!(first.saved_articles, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = p.run_once(Trigger::Timer).await.unwrap();
        let stats = second.last_stats.unwrap();
        assert_eq!(stats.unique_articles, 1);
        assert_eq!(stats.saved_articles, 0);
        assert_eq!(stats.skipped_articles, 1);
        assert_eq!(store.articles().len(), 1);
        assert_eq!(store.slugs(), vec!["fuel-prices-rise".to_string()]);
        assert_eq!(second.horizon.len(), 1);
    }

    #[tokio::test]
    async fn test_story_still_upstream_stays_in_horizon() {
        let state = MemoryRunStateStore::default();
        let story = candidate("Fuel prices rise", "https://a.test/1", SourceKind::Rss, "a");
        let nearly_expired = Utc::now() - chrono::Duration::hours(71);
        let mut horizon = DedupHorizon::default();
        horizon.record(story.identity(), nearly_expired);
        let seeded =
            RunState::default().advance(RunStats::new(Trigger::Timer, nearly_expired), horizon, nearly_expired);
        state.save(&seeded).await.unwrap();

        let p = pipeline(single_feed(), StubAi::new(), MemoryArticleStore::default(), state);
        let mut next = p.run_once(Trigger::Timer).await.unwrap();
        assert_eq!(next.last_stats.as_ref().unwrap().unique_articles, 0);

        let later = Utc::now() + chrono::Duration::hours(2);
        next.horizon.prune(later, chrono::Duration::hours(72), 5000);
        assert!(next.horizon.contains(&story.identity()));
    }

    #[tokio::test]
    async fn test_expired_horizon_entries_are_pruned() {
        let state = MemoryRunStateStore::default();
        let old = Utc::now() - chrono::Duration::hours(100);
        let mut horizon = DedupHorizon::default();
        horizon.record(crate::dedup::ArticleIdentity::of("Old news", "https://o.test/1"), old);
        let seeded = RunState::default().advance(RunStats::new(Trigger::Timer, old), horizon, old);
        state.save(&seeded).await.unwrap();

        let p = pipeline(vec![], StubAi::new(), MemoryArticleStore::default(), state);
        let next = p.run_once(Trigger::Timer).await.unwrap();
        assert!(next.horizon.is_empty());
        assert_eq!(next.version, 2);
    }
}
