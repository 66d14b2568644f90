//! Health and queue control endpoints

use axum::{extract::State, http::StatusCode, routing::{get, post}, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::error::ApiResult;
use crate::services::WorkerHealth;
use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "paused" while the reindex queue is paused
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    #[serde(flatten)]
    pub worker: WorkerHealth,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let worker = state.worker.health().await?;
    let uptime_seconds = Utc::now()
        .signed_duration_since(state.startup_time)
        .num_seconds()
        .max(0) as u64;

    Ok(Json(HealthResponse {
        status: if worker.paused { "paused" } else { "ok" }.to_string(),
        module: "reindex-watcher".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        worker,
    }))
}

/// POST /pause
pub async fn pause(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.worker.pause().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /resume
pub async fn resume(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.worker.resume().await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn control_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
}
