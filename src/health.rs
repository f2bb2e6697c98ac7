//! HTTP surface: liveness, last-run statistics and the manual trigger.
//!
//! | Method | Path | Response |
//! |--------|------|----------|
//! | GET | `/health` | worker status summary |
//! | GET | `/stats` | last [`RunStats`](crate::models::RunStats), 404 before the first run |
//! | POST | `/run` | 202 when queued, 409 when a run is active or already queued |
//!
//! Handlers only read the [`StatusBoard`] or push into the trigger queue;
//! none of them waits on a run.

use crate::models::Totals;
use crate::scheduler::{StatusBoard, TriggerHandle, TriggerOutcome};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, instrument};

/// A run is considered overdue after this many missed intervals.
const STALE_AFTER_INTERVALS: u32 = 3;

#[derive(Debug, Clone)]
pub struct HealthState {
    board: StatusBoard,
    trigger: TriggerHandle,
    interval: Duration,
}

impl HealthState {
    pub fn new(board: StatusBoard, trigger: TriggerHandle, interval: Duration) -> Self {
        Self {
            board,
            trigger,
            interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Starting,
    Ok,
    Stale,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: Liveness,
    pub running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub version: u64,
    pub horizon_size: usize,
    pub totals: Totals,
}

pub fn liveness(last_run_at: Option<DateTime<Utc>>, interval: Duration, now: DateTime<Utc>) -> Liveness {
    let Some(last) = last_run_at else {
        return Liveness::Starting;
    };
    let allowance = chrono::Duration::from_std(interval * STALE_AFTER_INTERVALS).unwrap_or(chrono::Duration::MAX);
    if now - last > allowance {
        Liveness::Stale
    } else {
        Liveness::Ok
    }
}

async fn health(State(state): State<HealthState>) -> Json<HealthReport> {
    let snap = state.board.snapshot();
    Json(HealthReport {
        status: liveness(snap.last_run_at, state.interval, Utc::now()),
        running: state.board.is_running(),
        last_run_at: snap.last_run_at,
        last_error: snap.last_error,
        version: snap.version,
        horizon_size: snap.horizon_size,
        totals: snap.totals,
    })
}

async fn stats(State(state): State<HealthState>) -> Response {
    match state.board.snapshot().last_stats {
        Some(stats) => Json(stats).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "no completed run yet"}))).into_response(),
    }
}

#[instrument(level = "info", skip_all)]
async fn run_now(State(state): State<HealthState>) -> Response {
    let outcome = state.trigger.request_run();
    info!(?outcome, "Manual run requested");
    match outcome {
        TriggerOutcome::Queued => (StatusCode::ACCEPTED, Json(json!({"status": "queued"}))).into_response(),
        TriggerOutcome::Busy => (StatusCode::CONFLICT, Json(json!({"status": "busy"}))).into_response(),
        TriggerOutcome::Closed => {
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "shutting_down"}))).into_response()
        }
    }
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/run", post(run_now))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: HealthState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Health endpoint listening");
    }
    axum::serve(listener, router(state)).await
}
