use super::{ApiError, ApiResult, AppState, start_load};
use crate::jobs::{ActiveJob, ErrorSummary, RecentJob};
use crate::schema::{JobEvent, JobType, LogLine};
use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn ready(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state
        .manager()
        .store()
        .ping()
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    Ok(Json(json!({ "status": "ready" })))
}

pub async fn active_jobs(State(state): State<AppState>) -> ApiResult<Json<Vec<ActiveJob>>> {
    Ok(Json(state.manager().get_active_jobs().await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitInput {
    pub limit: Option<usize>,
}

pub async fn recent_jobs(
    State(state): State<AppState>,
    Query(input): Query<LimitInput>,
) -> ApiResult<Json<Vec<RecentJob>>> {
    let limit = input.limit.unwrap_or(20).min(200);
    Ok(Json(state.manager().get_recent_jobs(limit).await?))
}

pub async fn job_logs(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(input): Query<LimitInput>,
) -> ApiResult<Json<Vec<LogLine>>> {
    let limit = input.limit.unwrap_or(100).min(1000);
    Ok(Json(state.manager().get_job_logs(&job_id, limit).await?))
}

pub async fn job_errors(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<ErrorSummary>> {
    Ok(Json(state.manager().get_job_error_summary(&job_id).await?))
}

pub async fn job_history(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Vec<JobEvent>>> {
    let history = state.manager().job_history(&job_id).await?;
    if history.is_empty() {
        return Err(ApiError::NotFound(format!("job {job_id}")));
    }
    Ok(Json(history))
}

#[derive(Debug, Deserialize)]
pub struct CreateJobInput {
    pub merchant: String,
}

/// Start a historical load for an onboarded store.
pub async fn create_job(
    State(state): State<AppState>,
    Json(input): Json<CreateJobInput>,
) -> ApiResult<Json<Value>> {
    let Some(store) = state.stores.get(&input.merchant).await? else {
        return Err(ApiError::NotFound(format!("store {}", input.merchant)));
    };
    if !store.is_active {
        return Err(ApiError::Validation(format!(
            "store {} is deactivated",
            input.merchant
        )));
    }
    match start_load(&state.runner, store, JobType::HistoricalLoad, "user").await? {
        Some(job_id) => Ok(Json(json!({ "job_id": job_id }))),
        None => Err(ApiError::Conflict(format!(
            "an active job already exists for {}",
            input.merchant
        ))),
    }
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Json<Value> {
    let cancelled = state.manager().cancel_job(&job_id).await;
    Json(json!({ "job_id": job_id, "cancelled": cancelled }))
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanStuckInput {
    pub hours: Option<i64>,
}

pub async fn clean_stuck(
    State(state): State<AppState>,
    Json(input): Json<CleanStuckInput>,
) -> ApiResult<Json<Value>> {
    let hours = input.hours.unwrap_or(state.stuck_job_hours);
    let (cleaned, total) = state.manager().force_clean_stuck_jobs(hours).await?;
    Ok(Json(json!({ "cleaned": cleaned, "total": total })))
}

pub async fn clear_finished(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let deleted = state.manager().clear_finished_jobs().await?;
    Ok(Json(json!({ "deleted": deleted })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::test_support;
    use crate::schema::JobStatus;

    async fn create(state: &AppState) -> ApiResult<Json<Value>> {
        create_job(
            State(state.clone()),
            Json(CreateJobInput {
                merchant: "demo.myshopify.com".to_string(),
            }),
        )
        .await
    }

    #[tokio::test]
    async fn second_load_for_a_store_conflicts() {
        let (state, _) = test_support::state();
        let Json(body) = create(&state).await.unwrap();
        assert!(body["job_id"].is_string());
        assert!(matches!(create(&state).await, Err(ApiError::Conflict(_))));
    }

    #[tokio::test]
    async fn unknown_store_is_not_found() {
        let (state, _) = test_support::state();
        let result = create_job(
            State(state),
            Json(CreateJobInput {
                merchant: "nope.myshopify.com".to_string(),
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn cancel_then_clear() {
        let (state, _) = test_support::state();
        let job_id = state
            .manager()
            .create_job("demo.myshopify.com", "ds", JobType::HistoricalLoad, Some("user"))
            .await
            .unwrap();

        let Json(body) = cancel_job(State(state.clone()), Path(job_id.clone())).await;
        assert_eq!(body["cancelled"], json!(true));

        let Json(history) = job_history(State(state.clone()), Path(job_id.clone()))
            .await
            .unwrap();
        assert_eq!(history[0].status, JobStatus::Cancelled);

        let Json(active) = active_jobs(State(state.clone())).await.unwrap();
        assert!(active.is_empty());

        let Json(cleared) = clear_finished(State(state.clone())).await.unwrap();
        assert_eq!(cleared["deleted"], json!(1));
        assert!(matches!(
            job_history(State(state), Path(job_id)).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn clean_stuck_rejects_non_positive_hours() {
        let (state, _) = test_support::state();
        for hours in [0, -1, 10_000_000_000_000] {
            let result =
                clean_stuck(State(state.clone()), Json(CleanStuckInput { hours: Some(hours) })).await;
            assert!(matches!(result, Err(ApiError::Validation(_))), "hours={hours}");
        }

        let Json(body) = clean_stuck(State(state), Json(CleanStuckInput::default()))
            .await
            .unwrap();
        assert_eq!(body, json!({ "cleaned": 0, "total": 0 }));
    }

    #[tokio::test]
    async fn recent_jobs_are_capped() {
        let (state, _) = test_support::state();
        for store in ["a.myshopify.com", "b.myshopify.com", "c.myshopify.com"] {
            state
                .manager()
                .create_job(store, "ds", JobType::HistoricalLoad, None)
                .await
                .unwrap();
        }
        let Json(recent) = recent_jobs(State(state), Query(LimitInput { limit: Some(2) }))
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
    }
}
