use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub active_jobs: usize,
    pub total_jobs: usize,
    pub progress_subscribers: usize,
    pub version: &'static str,
    pub data_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
}

/// `degraded` when the job table failed to load at startup.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    tracing::debug!("Health check");

    let total_jobs = match state.controller.list().await {
        Ok(jobs) => jobs.len(),
        Err(e) => {
            tracing::warn!("Health check could not list jobs: {}", e);
            0
        }
    };
    let store_error = state.controller.store_load_error();
    let data_dir = state
        .config
        .data_dir
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    Json(HealthResponse {
        status: if store_error.is_some() { "degraded" } else { "ok" },
        uptime_seconds: state.start_time.elapsed().as_secs(),
        active_jobs: state.controller.executing().await.len(),
        total_jobs,
        progress_subscribers: state.controller.broadcaster().subscriber_count(),
        version: env!("CARGO_PKG_VERSION"),
        data_dir,
        store_error,
    })
}
