//! HTTP surface, embedded UI and background daemons.

#[cfg(feature = "embedded-frontend")]
pub mod assets;
pub mod dashboard;
pub mod onboarding;
pub mod sweeper;

use crate::jobs::{BackgroundRunner, JobError, JobManager, JobResult};
use crate::schema::{JobType, StoreConfig};
use crate::services::{StoreRepository, TableSink};
use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub runner: BackgroundRunner,
    pub stores: Arc<dyn StoreRepository>,
    pub sink: Arc<dyn TableSink>,
    pub default_project: Option<String>,
    pub stuck_job_hours: i64,
}

impl AppState {
    pub fn manager(&self) -> &JobManager {
        self.runner.manager()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::Validation(msg) => ApiError::Validation(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(format!("{e:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.as_str()),
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.as_str()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.as_str()),
            ApiError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", msg.as_str())
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "api: internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.as_str())
            }
        };
        let body = json!({ "error": { "code": code, "message": message } });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Create a job for `store` and launch it, unless one is already active for
/// the store. Returns the new job id, `None` when skipped.
pub async fn start_load(
    runner: &BackgroundRunner,
    store: StoreConfig,
    job_type: JobType,
    created_by: &str,
) -> JobResult<Option<String>> {
    let created = runner
        .manager()
        .create_job_if_idle(
            &store.merchant,
            &store.bigquery_dataset,
            job_type,
            Some(created_by),
        )
        .await?;
    let Some(job_id) = created else {
        tracing::info!(store = %store.merchant, "jobs: active job exists, load not started");
        return Ok(None);
    };
    tracing::info!(job_id = %job_id, store = %store.merchant, job_type = %job_type, "jobs: load started");
    runner.run_historical_load_async(store, job_id.clone());
    Ok(Some(job_id))
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(dashboard::health))
        .route("/ready", get(dashboard::ready))
        .route("/api/jobs", post(dashboard::create_job))
        .route("/api/jobs/active", get(dashboard::active_jobs))
        .route("/api/jobs/recent", get(dashboard::recent_jobs))
        .route("/api/jobs/clean-stuck", post(dashboard::clean_stuck))
        .route("/api/jobs/finished", delete(dashboard::clear_finished))
        .route("/api/jobs/{id}/logs", get(dashboard::job_logs))
        .route("/api/jobs/{id}/errors", get(dashboard::job_errors))
        .route("/api/jobs/{id}/history", get(dashboard::job_history))
        .route("/api/jobs/{id}/cancel", post(dashboard::cancel_job))
        .route(
            "/api/stores",
            get(onboarding::list_stores).post(onboarding::onboard_store),
        )
        .route("/api/stores/{merchant}", delete(onboarding::deactivate_store))
        .with_state(state);

    #[cfg(feature = "embedded-frontend")]
    let api = api.fallback(assets::serve_frontend);

    api
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::test_store;

    #[tokio::test]
    async fn start_load_skips_store_with_active_job() {
        let (state, _) = test_support::state();
        let first = start_load(&state.runner, test_store(), JobType::HistoricalLoad, "user")
            .await
            .unwrap();
        assert!(first.is_some());
        let second = start_load(&state.runner, test_store(), JobType::ScheduledLoad, "scheduler")
            .await
            .unwrap();
        assert_eq!(second, None);
    }

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (ApiError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ApiError::Conflict("x".into()), StatusCode::CONFLICT),
            (
                ApiError::from(JobError::Validation("bad".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(JobError::Unavailable("down".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }
}
