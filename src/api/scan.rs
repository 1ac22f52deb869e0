//! Scan control endpoints

use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use uuid::Uuid;

use super::{ActionResponse, ApiError, api_error, engine_error};
use crate::app::AppState;
use crate::scan::{RunRecord, RunSummary, ScanStatistics, ScanStatus};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MIN_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub interval_secs: Option<u64>,
    pub auto_download: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

async fn status(State(state): State<AppState>) -> Json<ScanStatus> {
    Json(state.scan.status().await)
}

async fn start(
    State(state): State<AppState>,
    body: Option<Json<StartRequest>>,
) -> Result<Json<ActionResponse>, ApiError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    if let Some(secs) = request.interval_secs {
        if secs < MIN_INTERVAL_SECS {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("interval_secs must be at least {MIN_INTERVAL_SECS}"),
            ));
        }
    }

    let started = state.scan.start(
        request.interval_secs.map(Duration::from_secs),
        request.auto_download,
    );
    Ok(ActionResponse::ok(if started {
        "Scan loop started"
    } else {
        "Scan loop already running"
    }))
}

async fn stop(State(state): State<AppState>) -> Json<ActionResponse> {
    let stopped = state.scan.stop().await;
    ActionResponse::ok(if stopped {
        "Scan loop stopped"
    } else {
        "Scan loop was not running"
    })
}

async fn pause(State(state): State<AppState>) -> Json<ActionResponse> {
    let paused = state.scan.pause();
    ActionResponse::ok(if paused {
        "Scanning paused"
    } else {
        "Scanning already paused"
    })
}

async fn resume(State(state): State<AppState>) -> Json<ActionResponse> {
    let resumed = state.scan.resume();
    ActionResponse::ok(if resumed {
        "Scanning resumed"
    } else {
        "Scanning was not paused"
    })
}

/// Run one scan now and return its summary
async fn run_once(State(state): State<AppState>) -> Result<Json<RunSummary>, ApiError> {
    state.scan.scan_once().await.map(Json).map_err(engine_error)
}

async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<RunRecord>>, ApiError> {
    state
        .scan
        .history(query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
        .await
        .map(Json)
        .map_err(engine_error)
}

async fn detail(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunSummary>, ApiError> {
    match state.scan.detail(run_id).await.map_err(engine_error)? {
        Some(summary) => Ok(Json(summary)),
        None => Err(api_error(StatusCode::NOT_FOUND, format!("Run {run_id} not found"))),
    }
}

async fn statistics(State(state): State<AppState>) -> Result<Json<ScanStatistics>, ApiError> {
    state.scan.statistics().await.map(Json).map_err(engine_error)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/scan/status", get(status))
        .route("/scan/start", post(start))
        .route("/scan/stop", post(stop))
        .route("/scan/pause", post(pause))
        .route("/scan/resume", post(resume))
        .route("/scan/run", post(run_once))
        .route("/scan/history", get(history))
        .route("/scan/history/{run_id}", get(detail))
        .route("/scan/statistics", get(statistics))
}
