//! Operator REST API.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/api/processing/status` | Scheduler run state and queue |
//! | `GET` | `/api/processing/realtime-stats` | Live throughput and per-type totals |
//! | `GET` | `/api/processing/concurrency-stats` | Active claims per node |
//! | `GET` | `/api/tddf/raw-status` | Raw lines processed and pending |
//! | `GET` | `/api/tddf/performance-kpis` | Rolling-window KPIs |
//! | `POST` | `/api/processing/pause` | Pause at the next file boundary |
//! | `POST` | `/api/processing/resume` | Resume and start a tick |
//! | `POST` | `/api/processing/trigger` | Process now (`{"fileIds": [...]}`, empty = all) |

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SchedulerError;
use crate::status::StatusService;

/// Application state shared across all handlers.
pub type AppState = Arc<StatusService>;

pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/api/processing/status", get(processing_status))
        .route("/api/processing/realtime-stats", get(realtime_stats))
        .route("/api/processing/concurrency-stats", get(concurrency_stats))
        .route("/api/processing/pause", post(pause))
        .route("/api/processing/resume", post(resume))
        .route("/api/processing/trigger", post(trigger))
        .route("/api/tddf/raw-status", get(raw_status))
        .route("/api/tddf/performance-kpis", get(performance_kpis))
        .route("/api/tddf/performance-history", get(performance_history))
        .with_state(service)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerRequest {
    #[serde(default)]
    file_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Accepted {
    accepted: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: msg.into() })).into_response()
}

fn command_response(result: Result<(), SchedulerError>) -> Response {
    match result {
        Ok(()) => (StatusCode::ACCEPTED, Json(Accepted { accepted: true })).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

async fn processing_status(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.processing_status().await)
}

async fn realtime_stats(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.realtime_stats().await)
}

async fn concurrency_stats(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.concurrency_stats().await)
}

async fn raw_status(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.raw_status().await)
}

async fn performance_kpis(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.performance_kpis().await)
}

async fn performance_history(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.performance_history().await)
}

async fn pause(State(service): State<AppState>) -> Response {
    info!("Pause requested");
    command_response(service.scheduler().pause().await)
}

async fn resume(State(service): State<AppState>) -> Response {
    info!("Resume requested");
    command_response(service.scheduler().resume().await)
}

/// An empty body, `{}` and `{"fileIds": []}` all mean every queued file.
async fn trigger(State(service): State<AppState>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        TriggerRequest::default()
    } else {
        match serde_json::from_slice::<TriggerRequest>(&body) {
            Ok(request) => request,
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("invalid trigger body: {e}"),
                );
            }
        }
    };
    info!(files = request.file_ids.len(), "Trigger requested");
    command_response(service.scheduler().trigger(request.file_ids).await)
}
