//! Fixed-interval execution, manual triggers and the shared status board.
//!
//! Runs happen strictly one at a time inside [`Scheduler::run_until`]: the
//! loop waits for either the next tick or a queued manual trigger, executes
//! the pipeline under the run timeout, publishes the outcome to the
//! [`StatusBoard`], and goes back to waiting. The HTTP surface only ever
//! reads the board and pushes into the trigger queue.

use crate::ai::AiService;
use crate::errors::RunError;
use crate::models::{RunState, RunStats, Totals, Trigger};
use crate::persist::ArticleStore;
use crate::pipeline::Pipeline;
use crate::sources::SourceClient;
use crate::state::RunStateStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{error, info, warn};

/// What the health surface knows about the worker. Cheap to clone.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub version: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_stats: Option<RunStats>,
    pub totals: Totals,
    pub horizon_size: usize,
    pub last_error: Option<String>,
}

impl Snapshot {
    fn from_state(state: &RunState) -> Self {
        Self {
            version: state.version,
            last_run_at: state.last_run_at,
            last_stats: state.last_stats.clone(),
            totals: state.totals,
            horizon_size: state.horizon.len(),
            last_error: None,
        }
    }
}

/// Status shared between the scheduler loop and the HTTP handlers.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    snapshot: Arc<RwLock<Snapshot>>,
    running: Arc<AtomicBool>,
}

impl StatusBoard {
    pub fn snapshot(&self) -> Snapshot {
        let guard = self.snapshot.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    fn update(&self, f: impl FnOnce(&mut Snapshot)) {
        let mut guard = self.snapshot.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard);
    }

    /// Publish a freshly persisted state and clear any previous run error.
    pub fn publish(&self, state: &RunState) {
        self.update(|s| *s = Snapshot::from_state(state));
    }

    /// Keep the last good state but surface why the latest run failed.
    pub fn record_failure(&self, error: &RunError) {
        let message = error.to_string();
        self.update(|s| s.last_error = Some(message));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Queued,
    /// A run is executing or one is already waiting.
    Busy,
    /// The scheduler loop has exited.
    Closed,
}

/// Cloneable handle for requesting a manual run.
#[derive(Debug, Clone)]
pub struct TriggerHandle {
    tx: mpsc::Sender<Trigger>,
    board: StatusBoard,
}

impl TriggerHandle {
    pub fn request_run(&self) -> TriggerOutcome {
        if self.board.is_running() {
            return TriggerOutcome::Busy;
        }
        match self.tx.try_send(Trigger::Manual) {
            Ok(()) => TriggerOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => TriggerOutcome::Busy,
            Err(mpsc::error::TrySendError::Closed(_)) => TriggerOutcome::Closed,
        }
    }
}

pub struct Scheduler<S, A, D, R> {
    pipeline: Pipeline<S, A, D, R>,
    every: Duration,
    run_timeout: Duration,
    board: StatusBoard,
    triggers: mpsc::Receiver<Trigger>,
}

impl<S, A, D, R> Scheduler<S, A, D, R>
where
    S: SourceClient,
    A: AiService,
    D: ArticleStore,
    R: RunStateStore,
{
    /// Build the scheduler plus the handles the HTTP surface needs.
    pub fn new(
        pipeline: Pipeline<S, A, D, R>,
        every: Duration,
        run_timeout: Duration,
    ) -> (Self, TriggerHandle, StatusBoard) {
        let (tx, triggers) = mpsc::channel(1);
        let board = StatusBoard::default();
        let handle = TriggerHandle {
            tx,
            board: board.clone(),
        };
        let scheduler = Self {
            pipeline,
            every,
            run_timeout,
            board: board.clone(),
            triggers,
        };
        (scheduler, handle, board)
    }

    /// Seed the status board from the persisted state before the first run.
    pub async fn prime(&self) {
        match self.pipeline.state_store().load().await {
            Ok(Some(state)) => {
                info!(version = state.version, last_run_at = ?state.last_run_at, "Resuming from stored run state");
                self.board.publish(&state);
            }
            Ok(None) => info!("No completed run yet"),
            Err(e) => {
                warn!(error = %e, "Could not read run state at startup");
                self.board.update(|s| s.last_error = Some(e.to_string()));
            }
        }
    }

    /// Execute a single run under the run timeout and publish the outcome.
    ///
    /// When the timeout fires the run future is dropped before it reaches
    /// its single state write, so the stored state stays as it was.
    pub async fn execute(&self, trigger: Trigger) -> Result<RunState, RunError> {
        self.board.set_running(true);
        let outcome = match timeout(self.run_timeout, self.pipeline.run_once(trigger)).await {
            Ok(result) => result,
            Err(_) => Err(RunError::Timeout(self.run_timeout)),
        };
        match &outcome {
            Ok(state) => self.board.publish(state),
            Err(e) => {
                error!(error = %e, ?trigger, "Run failed; previous state kept");
                self.board.record_failure(e);
            }
        }
        self.board.set_running(false);
        outcome
    }

    /// Run on every tick and on every manual trigger until `shutdown` resolves.
    ///
    /// The first tick fires immediately. A run in progress is always allowed
    /// to finish before shutdown is observed.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(interval_secs = self.every.as_secs(), run_timeout_secs = self.run_timeout.as_secs(), "Scheduler started");
        loop {
            let trigger = tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => Trigger::Timer,
                Some(trigger) = self.triggers.recv() => trigger,
            };
            // Errors are already published on the board.
            let _ = self.execute(trigger).await;
            ticker.reset();
        }
        info!("Scheduler stopped");
    }
}
