use super::{ApiError, ApiResult, AppState, start_load};
use crate::schema::store_config::{normalize_shopify_url, validate_onboarding};
use crate::schema::{JobType, StoreConfig};
use axum::Json;
use axum::extract::{Path, State};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct OnboardInput {
    pub merchant: String,
    pub token: String,
    pub dataset: String,
    #[serde(default)]
    pub gcp_project_id: Option<String>,
    #[serde(default)]
    pub backfill_start_date: Option<NaiveDate>,
    #[serde(default = "default_true")]
    pub initial_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Onboarded {
    pub store: StoreConfig,
    pub job_id: Option<String>,
}

/// Validate, create the dataset, save the config and optionally start the
/// first historical load.
pub async fn onboard(state: &AppState, input: OnboardInput, user: &str) -> ApiResult<Onboarded> {
    let merchant = normalize_shopify_url(&input.merchant);
    let token = input.token.trim().to_string();
    let dataset = input.dataset.trim().to_string();

    let mut errors = validate_onboarding(&merchant, &token, &dataset);
    let project = input
        .gcp_project_id
        .filter(|p| !p.trim().is_empty())
        .or_else(|| state.default_project.clone());
    if project.is_none() {
        errors.push("GCP Project ID is required".to_string());
    }
    let Some(project) = project.filter(|_| errors.is_empty()) else {
        return Err(ApiError::Validation(errors.join("; ")));
    };

    let mut config = StoreConfig::new(merchant, token, project, dataset);
    if let Some(start) = input.backfill_start_date {
        config.backfill_start_date = start;
    }
    let redacted = config.redacted();
    tracing::info!(
        store = %config.merchant,
        token = %redacted.token,
        dataset = %config.bigquery_dataset,
        "onboarding: connecting store"
    );

    state
        .sink
        .ensure_dataset(&config.gcp_project_id, &config.bigquery_dataset)
        .await?;
    state.stores.upsert(&config, user).await?;

    let job_id = if input.initial_run {
        start_load(&state.runner, config, JobType::HistoricalLoad, user).await?
    } else {
        None
    };

    Ok(Onboarded {
        store: redacted,
        job_id,
    })
}

pub async fn list_stores(State(state): State<AppState>) -> ApiResult<Json<Vec<StoreConfig>>> {
    let stores = state.stores.list(false).await?;
    Ok(Json(stores.iter().map(StoreConfig::redacted).collect()))
}

pub async fn onboard_store(
    State(state): State<AppState>,
    Json(input): Json<OnboardInput>,
) -> ApiResult<Json<Onboarded>> {
    Ok(Json(onboard(&state, input, "user").await?))
}

pub async fn deactivate_store(
    State(state): State<AppState>,
    Path(merchant): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.stores.deactivate(&merchant).await? {
        return Err(ApiError::NotFound(format!("store {merchant}")));
    }
    tracing::info!(store = %merchant, "onboarding: store deactivated");
    Ok(Json(json!({ "merchant": merchant, "is_active": false })))
}
