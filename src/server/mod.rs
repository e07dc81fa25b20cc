pub mod health;
pub mod routes;
pub mod sse;

use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::daemon::controller::JobController;
use crate::daemon::events::JobEvent;
use crate::errors::TrmError;
use crate::models::DaemonConfig;

/// Shared application state for the Axum server.
pub struct AppState {
    pub controller: Arc<JobController>,
    pub event_tx: broadcast::Sender<JobEvent>,
    pub config: Arc<DaemonConfig>,
    pub start_time: Instant,
    pub shutdown_tx: Option<watch::Sender<()>>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Error body for every failed request: `{ "error": code, "message": text }`.
#[derive(Debug)]
pub struct ApiError(pub TrmError);

impl From<TrmError> for ApiError {
    fn from(err: TrmError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            TrmError::Validation(_) => StatusCode::BAD_REQUEST,
            TrmError::IllegalTransition { .. } | TrmError::AlreadyRunning(_) => {
                StatusCode::CONFLICT
            }
            TrmError::NotFound(_) => StatusCode::NOT_FOUND,
            TrmError::Execution { .. } | TrmError::Storage(_) | TrmError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::warn!("Request rejected: {}", self.0);
        }
        let body = ErrorResponse {
            error: self.0.code().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/jobs", get(routes::list_jobs).post(routes::create_job))
        .route("/api/jobs/failed", get(routes::list_failed))
        .route("/api/jobs/preview", post(routes::create_with_preview))
        .route("/api/jobs/restart-failed", post(routes::restart_failed))
        .route("/api/jobs/cleanup-interrupted", post(routes::cleanup_interrupted))
        .route("/api/command/preview", post(routes::preview_command))
        .route(
            "/api/jobs/{id}",
            get(routes::get_job).delete(routes::delete_job),
        )
        .route("/api/jobs/{id}/start", post(routes::start_job))
        .route("/api/jobs/{id}/pause", post(routes::pause_job))
        .route("/api/jobs/{id}/resume", post(routes::resume_job))
        .route("/api/jobs/{id}/stop", post(routes::stop_job))
        .route("/api/jobs/{id}/restart", post(routes::restart_job))
        .route("/api/jobs/{id}/approve", post(routes::approve_job))
        .route("/api/jobs/{id}/cancel", post(routes::cancel_job))
        .route("/api/jobs/{id}/logs", get(routes::get_log))
        .route("/api/progress", get(routes::progress_snapshot))
        .route("/api/progress/stream", get(sse::progress_stream))
        .route("/api/events", get(sse::event_stream))
        .route("/api/shutdown", post(routes::shutdown))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tokio::sync::RwLock;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::daemon::broadcaster::ProgressBroadcaster;
    use crate::models::Job;
    use crate::process::{MockAttempt, MockProcessSpawner};
    use crate::storage::{JobStore, LogStore, Mutator};

    // -----------------------------------------------------------------------
    // In-memory test doubles
    // -----------------------------------------------------------------------

    struct InMemoryJobStore {
        jobs: RwLock<Vec<Job>>,
    }

    #[async_trait]
    impl JobStore for InMemoryJobStore {
        async fn list(&self) -> Result<Vec<Job>, TrmError> {
            Ok(self.jobs.read().await.clone())
        }

        async fn get(&self, id: Uuid) -> Result<Job, TrmError> {
            self.jobs
                .read()
                .await
                .iter()
                .find(|j| j.id == id)
                .cloned()
                .ok_or_else(|| TrmError::job_not_found(id))
        }

        async fn find_by_name(&self, name: &str) -> Result<Option<Job>, TrmError> {
            Ok(self.jobs.read().await.iter().find(|j| j.name == name).cloned())
        }

        async fn upsert(&self, job: Job) -> Result<(), TrmError> {
            let mut jobs = self.jobs.write().await;
            match jobs.iter_mut().find(|j| j.id == job.id) {
                Some(existing) => *existing = job,
                None => jobs.push(job),
            }
            Ok(())
        }

        async fn delete(&self, id: Uuid) -> Result<(), TrmError> {
            let mut jobs = self.jobs.write().await;
            let before = jobs.len();
            jobs.retain(|j| j.id != id);
            if jobs.len() == before {
                return Err(TrmError::job_not_found(id));
            }
            Ok(())
        }

        async fn update_atomic(&self, id: Uuid, mutator: Mutator) -> Result<Job, TrmError> {
            let mut jobs = self.jobs.write().await;
            let slot = jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or_else(|| TrmError::job_not_found(id))?;
            let updated = mutator(slot.clone())?;
            *slot = updated.clone();
            Ok(updated)
        }
    }

    #[derive(Default)]
    struct InMemoryLogStore {
        logs: RwLock<HashMap<Uuid, Vec<String>>>,
    }

    #[async_trait]
    impl LogStore for InMemoryLogStore {
        async fn append(&self, job_id: Uuid, message: &str) -> Result<(), TrmError> {
            self.logs
                .write()
                .await
                .entry(job_id)
                .or_default()
                .push(message.to_string());
            Ok(())
        }

        async fn read(&self, job_id: Uuid, tail: Option<usize>) -> Result<String, TrmError> {
            let logs = self.logs.read().await;
            let lines = logs.get(&job_id).cloned().unwrap_or_default();
            let skip = tail.map_or(0, |n| lines.len().saturating_sub(n));
            Ok(lines[skip..].iter().map(|l| format!("{}\n", l)).collect())
        }

        async fn remove(&self, job_id: Uuid) -> Result<(), TrmError> {
            self.logs.write().await.remove(&job_id);
            Ok(())
        }

        async fn remove_orphans(&self, known: &[Uuid]) -> Result<usize, TrmError> {
            let mut logs = self.logs.write().await;
            let before = logs.len();
            logs.retain(|id, _| known.contains(id));
            Ok(before - logs.len())
        }
    }

    fn make_test_app(spawner: MockProcessSpawner) -> Router {
        let config = DaemonConfig {
            backoff_base_ms: 10,
            stop_grace_secs: 0,
            progress_persist_ms: 0,
            ..DaemonConfig::default()
        };
        let (event_tx, _) = broadcast::channel(64);
        let controller = JobController::new(
            Arc::new(InMemoryJobStore {
                jobs: RwLock::new(Vec::new()),
            }),
            Arc::new(InMemoryLogStore::default()),
            Arc::new(spawner),
            Arc::new(ProgressBroadcaster::new(Duration::from_secs(1))),
            event_tx.clone(),
            &config,
        );
        create_router(Arc::new(AppState {
            controller: Arc::new(controller),
            event_tx,
            config: Arc::new(config),
            start_time: Instant::now(),
            shutdown_tx: None,
        }))
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn new_job_json(name: &str) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "source": "/data/photos",
            "destination": "/mnt/backup/photos"
        })
    }

    #[tokio::test]
    async fn test_health_returns_200_with_expected_fields() {
        let app = make_test_app(MockProcessSpawner::always(MockAttempt::exit(0)));
        let response = app.oneshot(empty_request("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert!(json["uptime_seconds"].is_number());
        assert_eq!(json["active_jobs"], 0);
        assert_eq!(json["version"], "0.1.0");
    }

    #[tokio::test]
    async fn test_create_job_returns_201() {
        let app = make_test_app(MockProcessSpawner::always(MockAttempt::exit(0)));
        let response = app
            .oneshot(json_request("POST", "/api/jobs", new_job_json("photos")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["status"], "created");
        assert_eq!(json["max_retries"], 5);
        assert_eq!(json["retry_count"], 0);
    }

    #[tokio::test]
    async fn test_duplicate_name_returns_400() {
        let app = make_test_app(MockProcessSpawner::always(MockAttempt::exit(0)));
        let first = app
            .clone()
            .oneshot(json_request("POST", "/api/jobs", new_job_json("photos")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app
            .oneshot(json_request("POST", "/api/jobs", new_job_json("photos")))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);
        let json = body_json(second).await;
        assert_eq!(json["error"], "validation_error");
        assert!(json["message"].as_str().unwrap().contains("already exists"));
    }

    #[tokio::test]
    async fn test_unknown_option_is_rejected() {
        let app = make_test_app(MockProcessSpawner::always(MockAttempt::exit(0)));
        let mut body = new_job_json("photos");
        body["transfer"] = serde_json::json!({ "tool": "rsync", "options": { "delet": true } });
        let response = app
            .oneshot(json_request("POST", "/api/jobs", body))
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_start_twice_conflicts() {
        let app = make_test_app(MockProcessSpawner::always(MockAttempt::held()));
        app.clone()
            .oneshot(json_request("POST", "/api/jobs", new_job_json("photos")))
            .await
            .unwrap();

        let started = app
            .clone()
            .oneshot(empty_request("POST", "/api/jobs/photos/start"))
            .await
            .unwrap();
        assert_eq!(started.status(), StatusCode::OK);

        let again = app
            .clone()
            .oneshot(empty_request("POST", "/api/jobs/photos/start"))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::CONFLICT);

        let stopped = app
            .oneshot(empty_request("POST", "/api/jobs/photos/stop"))
            .await
            .unwrap();
        assert_eq!(body_json(stopped).await["status"], "stopped");
    }

    #[tokio::test]
    async fn test_delete_returns_204_then_404() {
        let app = make_test_app(MockProcessSpawner::always(MockAttempt::exit(0)));
        app.clone()
            .oneshot(json_request("POST", "/api/jobs", new_job_json("photos")))
            .await
            .unwrap();

        let deleted = app
            .clone()
            .oneshot(empty_request("DELETE", "/api/jobs/photos"))
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let missing = app
            .oneshot(empty_request("GET", "/api/jobs/photos"))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_shutdown_without_channel_is_ok() {
        let app = make_test_app(MockProcessSpawner::always(MockAttempt::exit(0)));
        let response = app
            .oneshot(empty_request("POST", "/api/shutdown"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            ApiError(TrmError::Validation("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(TrmError::AlreadyRunning("x".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError(TrmError::job_not_found("x")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(TrmError::Storage("disk".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
