//! Command-line interface definitions for the ingestion worker.
//!
//! Every option can also come from the environment. Secrets are read from
//! the environment in practice and are hidden from `--help` output.

use clap::Parser;

/// Command-line arguments for the ingestion worker.
///
/// Values given here override the matching entries of the YAML config file.
///
/// # Examples
///
/// ```sh
/// # Scheduled worker with the health endpoint on the default address
/// newswire_ingest -c ./ingest.yaml
///
/// # Single run for an external cron, with a custom state file
/// newswire_ingest -c ./ingest.yaml -s /var/lib/ingest/state.json --once
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, env = "INGEST_CONFIG")]
    pub config: Option<String>,

    /// Where the run state (last run, totals, dedup horizon) is kept
    #[arg(short, long, env = "INGEST_STATE_FILE", default_value = "./state/run_state.json")]
    pub state_file: String,

    /// Address for the health and trigger endpoints
    #[arg(short, long, env = "INGEST_LISTEN")]
    pub listen: Option<String>,

    /// Seconds between scheduled runs
    #[arg(short, long, env = "INGEST_INTERVAL_SECS")]
    pub interval_secs: Option<u64>,

    /// Execute a single run and exit
    #[arg(long)]
    pub once: bool,

    /// News search API key; the search source is disabled without it
    #[arg(long, env = "SEARCH_API_KEY", hide_env_values = true)]
    pub search_api_key: Option<String>,

    /// Bearer key for the chat-completions endpoint
    #[arg(long, env = "AI_API_KEY", hide_env_values = true)]
    pub ai_api_key: Option<String>,

    /// Base URL of the article database REST API
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Write-scoped service key for the article database
    #[arg(long, env = "DATABASE_SERVICE_KEY", hide_env_values = true)]
    pub database_service_key: Option<String>,
}
