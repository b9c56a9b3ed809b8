//! The historical load: Shopify entities into warehouse tables, one store at a time.

pub mod customers;
pub mod fetch;
pub mod job_logger;
pub mod order_items;
pub mod orders;
pub mod products;
pub mod rows;
#[cfg(test)]
pub(crate) mod testing;

pub use job_logger::JobLogger;

use crate::jobs::runner::{ENV_STORE_CONFIG, ENV_TARGET_STORE};
use crate::schema::{Component, JobStatus, StoreConfig};
use crate::services::shopify::shop_timezone;
use crate::services::store_repository::{default_store_file, load_store_file};
use crate::services::{Row, ShopifyApi, StoreRepository, TableRef, TableSink};
use chrono_tz::Tz;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub throttle_backoff: Duration,
    pub target_store: Option<String>,
}

impl PipelineSettings {
    pub fn from_env() -> Self {
        let backoff = std::env::var("SHOPIFY_THROTTLE_BACKOFF_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);
        Self {
            throttle_backoff: Duration::from_secs(backoff),
            target_store: std::env::var(ENV_TARGET_STORE)
                .ok()
                .filter(|s| !s.is_empty()),
        }
    }
}

/// Everything one entity load needs for one store.
pub struct StoreRun<'a> {
    pub store: &'a StoreConfig,
    pub api: &'a dyn ShopifyApi,
    pub sink: &'a dyn TableSink,
    pub logger: &'a JobLogger,
    pub timezone: Tz,
    pub throttle_backoff: Duration,
}

impl StoreRun<'_> {
    /// Replace `table` with `rows`. Empty loads are skipped so a failed
    /// fetch never truncates yesterday's data.
    pub async fn load(
        &self,
        component: Component,
        table: &str,
        rows: Vec<Row>,
    ) -> anyhow::Result<usize> {
        let store = Some(self.store.merchant.as_str());
        if rows.is_empty() {
            self.logger
                .warning(&format!("No rows to upload for {table}"), store, component)
                .await;
            return Ok(0);
        }

        let table_ref = TableRef::new(
            &self.store.gcp_project_id,
            &self.store.bigquery_dataset,
            table,
        );
        match self.sink.replace(&table_ref, &rows).await {
            Ok(_) => {
                self.logger
                    .info(
                        &format!("Uploaded to BigQuery: {table_ref} - {} records", rows.len()),
                        store,
                        component,
                    )
                    .await;
                Ok(rows.len())
            }
            Err(e) => {
                self.logger
                    .error(&format!("Failed to upload to BigQuery: {e:#}"), store, component)
                    .await;
                for line in rows::column_diagnostics(&rows) {
                    self.logger.error(&line, store, component).await;
                }
                Err(e)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entity {
    Customers,
    Orders,
    OrderItems,
    Products,
}

const ENTITIES: [Entity; 4] = [
    Entity::Customers,
    Entity::Orders,
    Entity::OrderItems,
    Entity::Products,
];

impl Entity {
    fn component(self) -> Component {
        match self {
            Entity::Customers => Component::Customers,
            Entity::Orders => Component::Orders,
            Entity::OrderItems => Component::OrderItems,
            Entity::Products => Component::Products,
        }
    }

    fn title(self) -> &'static str {
        match self {
            Entity::Customers => "Customers",
            Entity::Orders => "Orders",
            Entity::OrderItems => "Order Items",
            Entity::Products => "Products",
        }
    }

    fn insight(self) -> &'static str {
        match self {
            Entity::Customers => "customer insights",
            Entity::Orders => "order insights",
            Entity::OrderItems => "order items insights",
            Entity::Products => "product insights",
        }
    }

    async fn run(self, run: &StoreRun<'_>) -> anyhow::Result<usize> {
        match self {
            Entity::Customers => customers::run(run).await,
            Entity::Orders => orders::run(run).await,
            Entity::OrderItems => order_items::run(run).await,
            Entity::Products => products::run(run).await,
        }
    }
}

/// Outcome of a whole run across every store.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PipelineReport {
    pub records: usize,
    pub failed_components: Vec<String>,
    pub details: Vec<String>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.failed_components.is_empty()
    }

    pub fn failure_message(&self) -> Option<String> {
        if self.is_success() {
            return None;
        }
        let details: Vec<&str> = self.details.iter().take(3).map(String::as_str).collect();
        Some(format!(
            "Failed components: {}. {}",
            self.failed_components.join(", "),
            details.join(" | ")
        ))
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }
}

pub type ShopifyConnector =
    Box<dyn Fn(&StoreConfig) -> anyhow::Result<Arc<dyn ShopifyApi>> + Send + Sync>;

pub struct Pipeline {
    logger: JobLogger,
    sink: Arc<dyn TableSink>,
    connect: ShopifyConnector,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        logger: JobLogger,
        sink: Arc<dyn TableSink>,
        connect: ShopifyConnector,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            logger,
            sink,
            connect,
            settings,
        }
    }

    pub fn logger(&self) -> &JobLogger {
        &self.logger
    }

    /// Run every configured store and record the final job status.
    /// Returns the process exit code.
    pub async fn run(&self, stores: Vec<StoreConfig>) -> i32 {
        let stores = match &self.settings.target_store {
            Some(target) => {
                let matching: Vec<StoreConfig> =
                    stores.into_iter().filter(|s| &s.merchant == target).collect();
                if matching.is_empty() {
                    self.logger
                        .error(
                            &format!("Target store {target} not found in configuration"),
                            None,
                            Component::Main,
                        )
                        .await;
                    self.logger
                        .update_job_status(
                            JobStatus::Failed,
                            Some(format!("Store {target} not found")),
                            None,
                        )
                        .await;
                    return 1;
                }
                matching
            }
            None => stores,
        };

        let mut report = PipelineReport::default();
        for store in &stores {
            self.run_store(store, &mut report).await;
        }
        self.finish(&report).await;
        report.exit_code()
    }

    async fn run_store(&self, store: &StoreConfig, report: &mut PipelineReport) {
        let merchant = Some(store.merchant.as_str());
        self.logger
            .info(
                &format!("Processing store: {}", store.merchant),
                merchant,
                Component::Main,
            )
            .await;

        let api = match (self.connect)(store) {
            Ok(api) => api,
            Err(e) => {
                self.logger
                    .error(
                        &format!("Failed to create Shopify client: {e:#}"),
                        merchant,
                        Component::Main,
                    )
                    .await;
                report.failed_components.push(Component::Main.as_str().to_string());
                report.details.push(format!("{}: {e:#}", store.merchant));
                return;
            }
        };

        let timezone = shop_timezone(api.as_ref()).await;
        self.logger
            .info(&format!("Shop timezone: {timezone}"), merchant, Component::Main)
            .await;

        let run = StoreRun {
            store,
            api: api.as_ref(),
            sink: self.sink.as_ref(),
            logger: &self.logger,
            timezone,
            throttle_backoff: self.settings.throttle_backoff,
        };

        for entity in ENTITIES {
            let component = entity.component();
            self.logger
                .info(&format!("Starting {}", entity.insight()), merchant, component)
                .await;
            match entity.run(&run).await {
                Ok(records) => {
                    report.records += records;
                    self.logger
                        .info(
                            &format!("{} completed: {records} records", entity.title()),
                            merchant,
                            component,
                        )
                        .await;
                }
                Err(e) => {
                    self.logger
                        .error(
                            &format!("Failed to run {}: {e:#}", entity.insight()),
                            merchant,
                            component,
                        )
                        .await;
                    report.failed_components.push(component.as_str().to_string());
                    report.details.push(format!("{}: {e:#}", entity.title()));
                }
            }
        }
    }

    async fn finish(&self, report: &PipelineReport) {
        let records = i64::try_from(report.records).unwrap_or(i64::MAX);
        match report.failure_message() {
            Some(message) => {
                self.logger
                    .error(
                        &format!(
                            "Pipeline completed with errors. Total records: {}. {message}",
                            report.records
                        ),
                        None,
                        Component::Main,
                    )
                    .await;
                self.logger
                    .update_job_status(JobStatus::Failed, Some(message), Some(records))
                    .await;
            }
            None => {
                self.logger
                    .info(
                        &format!(
                            "All stores processed successfully. Total records: {}",
                            report.records
                        ),
                        None,
                        Component::Main,
                    )
                    .await;
                self.logger
                    .update_job_status(JobStatus::Completed, None, Some(records))
                    .await;
            }
        }
    }
}

/// `STORE_CONFIG_JSON` holds one store object or an array of them.
pub fn parse_store_json(raw: &str) -> anyhow::Result<Vec<StoreConfig>> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| anyhow::anyhow!("Failed to parse {ENV_STORE_CONFIG}: {e}"))?;
    if value.is_array() {
        Ok(serde_json::from_value(value)?)
    } else {
        Ok(vec![serde_json::from_value(value)?])
    }
}

/// Stores to load: the inline JSON, else the repository's active stores,
/// else the JSON file.
pub async fn resolve_stores(
    inline: Option<&str>,
    repository: Option<&dyn StoreRepository>,
    file: &Path,
) -> anyhow::Result<Vec<StoreConfig>> {
    if let Some(raw) = inline.filter(|s| !s.trim().is_empty()) {
        let stores = parse_store_json(raw)?;
        tracing::info!(count = stores.len(), "pipeline: loaded store config from environment");
        return Ok(stores);
    }
    if let Some(repository) = repository {
        match repository.list(true).await {
            Ok(stores) => {
                tracing::info!(count = stores.len(), "pipeline: loaded active stores from repository");
                return Ok(stores);
            }
            Err(e) => {
                tracing::warn!(error = %e, "pipeline: store repository unavailable, falling back to file");
            }
        }
    }
    let stores = load_store_file(file)?;
    tracing::info!(count = stores.len(), path = %file.display(), "pipeline: loaded stores from file");
    Ok(stores)
}

/// [`resolve_stores`] with the environment and the default file location.
pub async fn resolve_stores_from_env(
    repository: Option<&dyn StoreRepository>,
) -> anyhow::Result<Vec<StoreConfig>> {
    let inline = std::env::var(ENV_STORE_CONFIG).ok();
    resolve_stores(inline.as_deref(), repository, &default_store_file()).await
}
