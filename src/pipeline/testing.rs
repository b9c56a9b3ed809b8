//! Fakes shared by the pipeline tests.

use super::StoreRun;
use super::job_logger::JobLogger;
use crate::schema::StoreConfig;
use crate::services::{Row, ShopifyApi, TableRef, TableSink};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Replays scripted responses in order, or answers by substring of the query.
#[derive(Default)]
pub struct FakeShopify {
    scripted: Mutex<VecDeque<Value>>,
    routes: Vec<(&'static str, Value)>,
    queries: Mutex<Vec<String>>,
}

impl FakeShopify {
    pub fn scripted(responses: Vec<Value>) -> Self {
        Self {
            scripted: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    pub fn routed(routes: Vec<(&'static str, Value)>) -> Self {
        Self {
            routes,
            ..Self::default()
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ShopifyApi for FakeShopify {
    async fn execute(&self, query: &str) -> anyhow::Result<Value> {
        self.queries.lock().unwrap().push(query.to_string());
        if let Some(next) = self.scripted.lock().unwrap().pop_front() {
            return Ok(next);
        }
        for (needle, response) in &self.routes {
            if query.contains(needle) {
                return Ok(response.clone());
            }
        }
        anyhow::bail!("no scripted response for query")
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub loads: Mutex<Vec<(String, Vec<Row>)>>,
    pub fail_tables: Vec<String>,
}

impl RecordingSink {
    pub fn failing(tables: &[&str]) -> Self {
        Self {
            fail_tables: tables.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn tables(&self) -> Vec<String> {
        self.loads
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.loads
            .lock()
            .unwrap()
            .iter()
            .find(|(t, _)| t == table)
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl TableSink for RecordingSink {
    async fn replace(&self, table: &TableRef, rows: &[Row]) -> anyhow::Result<u64> {
        if self.fail_tables.contains(&table.table) {
            anyhow::bail!("load into {table} failed: invalid value");
        }
        self.loads
            .lock()
            .unwrap()
            .push((table.table.clone(), rows.to_vec()));
        Ok(rows.len() as u64)
    }

    async fn ensure_dataset(&self, _project: &str, _dataset: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

pub fn test_store() -> StoreConfig {
    StoreConfig::new(
        "demo.myshopify.com".into(),
        "shpat_demo".into(),
        "proj".into(),
        "shopify_demo".into(),
    )
}

pub fn store_run<'a>(api: &'a FakeShopify, sink: &'a RecordingSink) -> StoreRun<'a> {
    let store: &'static StoreConfig = Box::leak(Box::new(test_store()));
    let logger: &'static JobLogger = Box::leak(Box::new(JobLogger::new(None, None, false)));
    StoreRun {
        store,
        api,
        sink,
        logger,
        timezone: chrono_tz::Tz::UTC,
        throttle_backoff: Duration::ZERO,
    }
}

pub fn connection(name: &str, nodes: Vec<Value>) -> Value {
    let edges: Vec<Value> = nodes.into_iter().map(|n| json!({ "node": n })).collect();
    let mut data = serde_json::Map::new();
    data.insert(
        name.to_string(),
        json!({
            "edges": edges,
            "pageInfo": { "hasNextPage": false, "endCursor": null }
        }),
    );
    json!({ "data": data })
}
