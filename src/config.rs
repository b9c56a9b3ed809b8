use crate::jobs::{
    BackgroundRunner, JobDelegate, JobManager, JobManagerConfig, JobStore, MemoryJobStore,
    PgJobStore, RunnerConfig,
};
use crate::services::store_repository::{default_store_file, load_store_file};
use crate::services::{
    CloudRunConfig, CloudRunDelegate, MemoryStoreRepository, PgStoreRepository, StoreRepository,
    token_source_from_env,
};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

/// Process-wide settings read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub gcp_project_id: Option<String>,
    pub port: u16,
    pub active_window_hours: i64,
    pub stuck_job_hours: i64,
    pub sweep_interval: Duration,
    pub sync_schedule: Option<String>,
    pub sync_timezone: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            gcp_project_id: None,
            port: 8080,
            active_window_hours: 24,
            stuck_job_hours: 24,
            sweep_interval: Duration::from_secs(300),
            sync_schedule: None,
            sync_timezone: "UTC".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_string("DATABASE_URL"),
            gcp_project_id: env_string("GCP_PROJECT_ID"),
            port: env_parse("PORT", defaults.port),
            active_window_hours: env_parse("ACTIVE_JOB_WINDOW_HOURS", defaults.active_window_hours),
            stuck_job_hours: Some(env_parse("STUCK_JOB_HOURS", defaults.stuck_job_hours))
                .filter(|h| *h > 0)
                .unwrap_or(defaults.stuck_job_hours),
            sweep_interval: Duration::from_secs(env_parse(
                "SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )),
            sync_schedule: env_string("SYNC_SCHEDULE"),
            sync_timezone: env_string("SYNC_TIMEZONE").unwrap_or(defaults.sync_timezone),
        }
    }

    pub fn job_manager_config(&self) -> JobManagerConfig {
        let defaults = JobManagerConfig::default();
        let active_window = match chrono::Duration::try_hours(self.active_window_hours) {
            Some(window) if self.active_window_hours > 0 => window,
            _ => {
                tracing::warn!(
                    hours = self.active_window_hours,
                    "config: ignoring invalid ACTIVE_JOB_WINDOW_HOURS"
                );
                defaults.active_window
            }
        };
        JobManagerConfig {
            active_window,
            ..defaults
        }
    }

    /// Job manager and store repository, on Postgres when `DATABASE_URL` is
    /// set, in memory otherwise.
    pub async fn backends(&self) -> anyhow::Result<Backends> {
        let (job_store, pool): (Arc<dyn JobStore>, Option<PgPool>) = match &self.database_url {
            Some(url) => {
                let store = PgJobStore::connect(url).await?;
                let pool = store.pool().clone();
                tracing::info!("config: using postgres job store");
                (Arc::new(store), Some(pool))
            }
            None => {
                tracing::warn!("config: DATABASE_URL not set, job history is process-local");
                (Arc::new(MemoryJobStore::new()), None)
            }
        };

        let stores: Arc<dyn StoreRepository> = match pool {
            Some(pool) => Arc::new(PgStoreRepository::new(pool)),
            None => {
                let path = default_store_file();
                let seeded = if path.exists() {
                    load_store_file(&path).unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "config: ignoring unreadable store file");
                        Vec::new()
                    })
                } else {
                    Vec::new()
                };
                Arc::new(MemoryStoreRepository::new(seeded))
            }
        };

        Ok(Backends {
            manager: JobManager::with_store(job_store, self.job_manager_config()),
            stores,
        })
    }
}

#[derive(Clone)]
pub struct Backends {
    pub manager: JobManager,
    pub stores: Arc<dyn StoreRepository>,
}

/// Cloud Run delegation when `CLOUD_RUN_JOB` is configured, else local
/// subprocesses of this binary.
pub fn background_runner(manager: JobManager) -> anyhow::Result<BackgroundRunner> {
    let delegate: Option<Arc<dyn JobDelegate>> = match CloudRunConfig::from_env() {
        Some(config) => {
            tracing::info!(job = %config.job_path(), "config: loads run as cloud run executions");
            Some(Arc::new(CloudRunDelegate::new(config, token_source_from_env()?)?))
        }
        None => None,
    };
    Ok(BackgroundRunner::new(manager, delegate, RunnerConfig::from_env()))
}
