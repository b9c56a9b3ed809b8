use crate::schema::StoreConfig;
use chrono::NaiveDate;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Persistence for onboarded stores.
#[async_trait::async_trait]
pub trait StoreRepository: Send + Sync {
    async fn list(&self, active_only: bool) -> anyhow::Result<Vec<StoreConfig>>;

    async fn get(&self, merchant: &str) -> anyhow::Result<Option<StoreConfig>>;

    async fn upsert(&self, config: &StoreConfig, user: &str) -> anyhow::Result<()>;

    /// Soft delete. Returns whether the store existed.
    async fn deactivate(&self, merchant: &str) -> anyhow::Result<bool>;
}

#[derive(sqlx::FromRow)]
struct StoreRow {
    merchant: String,
    token: String,
    gcp_project_id: String,
    bigquery_dataset: String,
    backfill_start_date: NaiveDate,
    is_active: bool,
}

impl From<StoreRow> for StoreConfig {
    fn from(row: StoreRow) -> Self {
        let mut config = StoreConfig::new(
            row.merchant,
            row.token,
            row.gcp_project_id,
            row.bigquery_dataset,
        );
        config.backfill_start_date = row.backfill_start_date;
        config.is_active = row.is_active;
        config
    }
}

const STORE_COLUMNS: &str =
    "merchant, token, gcp_project_id, bigquery_dataset, backfill_start_date, is_active";

pub struct PgStoreRepository {
    pool: PgPool,
}

impl PgStoreRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl StoreRepository for PgStoreRepository {
    async fn list(&self, active_only: bool) -> anyhow::Result<Vec<StoreConfig>> {
        let rows = sqlx::query_as::<_, StoreRow>(&format!(
            "SELECT {STORE_COLUMNS} FROM store_configs WHERE is_active OR NOT $1 ORDER BY merchant"
        ))
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(StoreConfig::from).collect())
    }

    async fn get(&self, merchant: &str) -> anyhow::Result<Option<StoreConfig>> {
        let row = sqlx::query_as::<_, StoreRow>(&format!(
            "SELECT {STORE_COLUMNS} FROM store_configs WHERE merchant = $1"
        ))
        .bind(merchant)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(StoreConfig::from))
    }

    async fn upsert(&self, config: &StoreConfig, user: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO store_configs
                (merchant, token, gcp_project_id, bigquery_dataset, backfill_start_date,
                 is_active, created_by, updated_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (merchant) DO UPDATE SET
                token = EXCLUDED.token,
                gcp_project_id = EXCLUDED.gcp_project_id,
                bigquery_dataset = EXCLUDED.bigquery_dataset,
                backfill_start_date = EXCLUDED.backfill_start_date,
                is_active = EXCLUDED.is_active,
                updated_at = now(),
                updated_by = EXCLUDED.updated_by
            "#,
        )
        .bind(&config.merchant)
        .bind(&config.token)
        .bind(&config.gcp_project_id)
        .bind(&config.bigquery_dataset)
        .bind(config.backfill_start_date)
        .bind(config.is_active)
        .bind(user)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deactivate(&self, merchant: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE store_configs SET is_active = FALSE, updated_at = now() WHERE merchant = $1",
        )
        .bind(merchant)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Process-local repository, seeded from a JSON file when no database is configured.
#[derive(Default)]
pub struct MemoryStoreRepository {
    stores: Mutex<BTreeMap<String, StoreConfig>>,
}

impl MemoryStoreRepository {
    pub fn new(configs: Vec<StoreConfig>) -> Self {
        Self {
            stores: Mutex::new(
                configs
                    .into_iter()
                    .map(|c| (c.merchant.clone(), c))
                    .collect(),
            ),
        }
    }
}

#[async_trait::async_trait]
impl StoreRepository for MemoryStoreRepository {
    async fn list(&self, active_only: bool) -> anyhow::Result<Vec<StoreConfig>> {
        Ok(self
            .stores
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.is_active || !active_only)
            .cloned()
            .collect())
    }

    async fn get(&self, merchant: &str) -> anyhow::Result<Option<StoreConfig>> {
        Ok(self.stores.lock().unwrap().get(merchant).cloned())
    }

    async fn upsert(&self, config: &StoreConfig, _user: &str) -> anyhow::Result<()> {
        self.stores
            .lock()
            .unwrap()
            .insert(config.merchant.clone(), config.clone());
        Ok(())
    }

    async fn deactivate(&self, merchant: &str) -> anyhow::Result<bool> {
        match self.stores.lock().unwrap().get_mut(merchant) {
            Some(config) => {
                config.is_active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// `/secrets/store_config.json` when mounted, else `store_config.json`.
pub fn default_store_file() -> PathBuf {
    let secret = Path::new("/secrets/store_config.json");
    if secret.exists() {
        secret.to_path_buf()
    } else {
        PathBuf::from("store_config.json")
    }
}

/// Parse a JSON array of store configs in the upper-case layout.
pub fn load_store_file(path: &Path) -> anyhow::Result<Vec<StoreConfig>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    Ok(serde_json::from_str(&raw)?)
}
