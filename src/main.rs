//! # Newswire Ingest
//!
//! A scheduled worker that keeps a news site's article table fed. On a fixed
//! interval, or when asked over HTTP, it pulls candidate items from RSS/Atom
//! feeds and a news-search API, removes duplicates, asks an LLM for a
//! category and short summary, and writes each article exactly once.
//!
//! ## Features
//!
//! - Concurrent fetching with per-source timeouts; one bad feed never sinks a run
//! - Intra-batch and cross-run deduplication on a normalized title+link identity
//! - AI enrichment with a concurrency cap and per-article fallback to raw content
//! - Insert-if-absent persistence with deterministic slug suffixes
//! - `GET /health`, `GET /stats` and `POST /run` on a small HTTP surface
//!
//! ## Usage
//!
//! ```sh
//! DATABASE_URL=https://db.example.co/rest/v1 newswire_ingest -c ./ingest.yaml
//! ```
//!
//! ## Architecture
//!
//! Each run follows the same pipeline:
//! 1. **Aggregate**: fetch every source concurrently
//! 2. **Deduplicate**: collapse the batch, drop identities seen by earlier runs
//! 3. **Enrich**: categorize and summarize (3 at a time by default)
//! 4. **Persist**: insert new articles, count conflicts as skips
//! 5. **Record**: write the new run state in a single atomic save

use clap::Parser;
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod aggregator;
mod ai;
mod cli;
mod config;
mod dedup;
mod enricher;
mod errors;
mod health;
mod models;
mod persist;
mod pipeline;
mod policy;
mod scheduler;
mod sources;
mod state;
#[cfg(test)]
mod test_support;
mod utils;

use aggregator::Aggregator;
use ai::OpenAiCompatClient;
use cli::Cli;
use config::Config;
use enricher::Enricher;
use health::HealthState;
use models::{SourceKind, Trigger};
use persist::{Persister, RestArticleStore};
use pipeline::Pipeline;
use scheduler::Scheduler;
use state::FileRunStateStore;
use utils::ensure_writable_parent;

/// Resolves on Ctrl-C. If the handler cannot be installed the worker runs
/// until killed.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested; finishing the active run first");
}

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "newswire_ingest starting up");

    // Parse CLI
    let args = Cli::parse();
    debug!(config = ?args.config, state_file = %args.state_file, once = args.once, "Parsed CLI arguments");

    // --- Configuration ---
    let mut config = match args.config.as_deref() {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.apply_overrides(&args);
    if let Err(e) = config.validate() {
        error!(error = %e, "Refusing to start with this configuration");
        return Err(e.into());
    }

    // Early check: the run state must be writable before the first run
    let state_path = PathBuf::from(&args.state_file);
    if let Err(e) = ensure_writable_parent(&state_path).await {
        error!(
            path = %state_path.display(),
            error = %e,
            "Run-state directory is not writable (fix perms or choose a different path)"
        );
        return Err(e);
    }

    // ---- Collaborators ----
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()?;

    let database_url = config.database.url.clone().unwrap_or_default();
    let store = RestArticleStore::new(
        &database_url,
        &config.database.table,
        config.database.service_key.clone(),
        http.clone(),
    );
    let ai = OpenAiCompatClient::new(&config.ai.api_base, &config.ai.model, config.ai.api_key.clone(), http.clone())
        .with_temperature(config.ai.temperature);

    let aggregator = Aggregator::new(
        config.build_sources(&http),
        config.source_policy(),
        config.pipeline.source_concurrency,
    );
    info!(
        rss = aggregator.count_of(SourceKind::Rss),
        search_api = aggregator.count_of(SourceKind::SearchApi),
        "Configured sources"
    );

    let pipeline = Pipeline::new(
        aggregator,
        Enricher::new(ai, config.enrich_policy(), config.pipeline.enrich_concurrency),
        Persister::new(store, config.persist_policy()),
        FileRunStateStore::new(&state_path),
        config.horizon_policy(),
    );
    let (scheduler, trigger, board) = Scheduler::new(pipeline, config.interval(), config.run_timeout());
    scheduler.prime().await;

    // ---- Single run for external cron ----
    if args.once {
        let state = scheduler.execute(Trigger::Manual).await?;
        if let Some(stats) = &state.last_stats {
            info!(
                saved = stats.saved_articles,
                skipped = stats.skipped_articles,
                errors = stats.errors,
                elapsed_ms = stats.execution_time_ms,
                "Execution complete"
            );
        }
        return Ok(());
    }

    // ---- Health surface ----
    let listener = tokio::net::TcpListener::bind(&config.scheduler.listen).await?;
    let health_state = HealthState::new(board, trigger, config.interval());
    tokio::spawn(async move {
        if let Err(e) = health::serve(listener, health_state).await {
            error!(error = %e, "Health endpoint stopped");
        }
    });

    scheduler.run_until(shutdown_signal()).await;
    info!("Execution complete");
    Ok(())
}
