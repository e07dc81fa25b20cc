use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::command::BuiltCommand;
use crate::daemon::controller::BulkOutcome;
use crate::models::{Job, NewJob, Progress};

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize, Default)]
pub struct LogParams {
    pub tail: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct BulkResponse {
    pub restarted: usize,
    pub results: Vec<BulkOutcome>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub recovered: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct CommandPreviewResponse {
    #[serde(flatten)]
    pub command: BuiltCommand,
    pub display: String,
}

async fn resolve_id(state: &AppState, reference: &str) -> ApiResult<Uuid> {
    Ok(state.controller.resolve(reference).await?.id)
}

/// GET /api/jobs
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(state.controller.list().await?))
}

/// GET /api/jobs/failed
pub async fn list_failed(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(state.controller.list_failed().await?))
}

/// GET /api/jobs/{id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(reference): Path<String>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.controller.resolve(&reference).await?))
}

/// POST /api/jobs
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(new_job): Json<NewJob>,
) -> ApiResult<impl IntoResponse> {
    let job = state.controller.create(new_job).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// POST /api/jobs/preview
pub async fn create_with_preview(
    State(state): State<Arc<AppState>>,
    Json(new_job): Json<NewJob>,
) -> ApiResult<impl IntoResponse> {
    let job = state.controller.create_with_preview(new_job).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// POST /api/command/preview
pub async fn preview_command(
    State(state): State<Arc<AppState>>,
    Json(new_job): Json<NewJob>,
) -> ApiResult<Json<CommandPreviewResponse>> {
    let command = state.controller.preview_command(&new_job)?;
    let display = command.display();
    Ok(Json(CommandPreviewResponse { command, display }))
}

/// DELETE /api/jobs/{id}
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(reference): Path<String>,
) -> ApiResult<StatusCode> {
    let id = resolve_id(&state, &reference).await?;
    state.controller.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/jobs/{id}/start
pub async fn start_job(
    State(state): State<Arc<AppState>>,
    Path(reference): Path<String>,
) -> ApiResult<Json<Job>> {
    let id = resolve_id(&state, &reference).await?;
    Ok(Json(state.controller.start(id).await?))
}

/// POST /api/jobs/{id}/pause
pub async fn pause_job(
    State(state): State<Arc<AppState>>,
    Path(reference): Path<String>,
) -> ApiResult<Json<Job>> {
    let id = resolve_id(&state, &reference).await?;
    Ok(Json(state.controller.pause(id).await?))
}

/// POST /api/jobs/{id}/resume
pub async fn resume_job(
    State(state): State<Arc<AppState>>,
    Path(reference): Path<String>,
) -> ApiResult<Json<Job>> {
    let id = resolve_id(&state, &reference).await?;
    Ok(Json(state.controller.resume(id).await?))
}

/// POST /api/jobs/{id}/stop
pub async fn stop_job(
    State(state): State<Arc<AppState>>,
    Path(reference): Path<String>,
) -> ApiResult<Json<Job>> {
    let id = resolve_id(&state, &reference).await?;
    Ok(Json(state.controller.stop(id).await?))
}

/// POST /api/jobs/{id}/restart
pub async fn restart_job(
    State(state): State<Arc<AppState>>,
    Path(reference): Path<String>,
) -> ApiResult<Json<Job>> {
    let id = resolve_id(&state, &reference).await?;
    Ok(Json(state.controller.restart(id).await?))
}

/// POST /api/jobs/{id}/approve
pub async fn approve_job(
    State(state): State<Arc<AppState>>,
    Path(reference): Path<String>,
) -> ApiResult<Json<Job>> {
    let id = resolve_id(&state, &reference).await?;
    Ok(Json(state.controller.approve(id).await?))
}

/// POST /api/jobs/{id}/cancel
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(reference): Path<String>,
) -> ApiResult<StatusCode> {
    let id = resolve_id(&state, &reference).await?;
    state.controller.cancel_preview(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/jobs/restart-failed
pub async fn restart_failed(State(state): State<Arc<AppState>>) -> ApiResult<Json<BulkResponse>> {
    let results = state.controller.restart_failed().await?;
    let restarted = results.iter().filter(|o| o.ok).count();
    tracing::info!("Restarted {} of {} failed job(s)", restarted, results.len());
    Ok(Json(BulkResponse { restarted, results }))
}

/// POST /api/jobs/cleanup-interrupted
pub async fn cleanup_interrupted(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<CleanupResponse>> {
    let recovered = state.controller.recover_interrupted().await?;
    Ok(Json(CleanupResponse { recovered }))
}

/// GET /api/jobs/{id}/logs?tail=N
pub async fn get_log(
    State(state): State<Arc<AppState>>,
    Path(reference): Path<String>,
    Query(params): Query<LogParams>,
) -> ApiResult<impl IntoResponse> {
    let id = resolve_id(&state, &reference).await?;
    let content = state.controller.read_log(id, params.tail).await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        content,
    ))
}

/// GET /api/progress
pub async fn progress_snapshot(
    State(state): State<Arc<AppState>>,
) -> Json<HashMap<Uuid, Progress>> {
    Json(state.controller.broadcaster().snapshot().await)
}

/// POST /api/shutdown
pub async fn shutdown(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested");
    if let Some(ref tx) = state.shutdown_tx {
        let _ = tx.send(());
    }
    (
        StatusCode::OK,
        Json(serde_json::json!({ "message": "Shutdown initiated" })),
    )
}
