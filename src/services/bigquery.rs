use super::gcp_auth::TokenSource;
use serde_json::{Map, Value, json};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";
const UPLOAD_BASE: &str = "https://bigquery.googleapis.com/upload/bigquery/v2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const DATASET_LOCATION: &str = "US";

pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(project: &str, dataset: &str, table: &str) -> Self {
        Self {
            project: project.to_string(),
            dataset: dataset.to_string(),
            table: table.to_string(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// Destination warehouse for flattened rows.
#[async_trait::async_trait]
pub trait TableSink: Send + Sync {
    /// Replace the table's contents with `rows`. Returns the rows written.
    async fn replace(&self, table: &TableRef, rows: &[Row]) -> anyhow::Result<u64>;

    /// Create the dataset if it does not exist yet.
    async fn ensure_dataset(&self, project: &str, dataset: &str) -> anyhow::Result<()>;
}

/// BigQuery REST client running load jobs from newline-delimited JSON.
pub struct BigQuerySink {
    client: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
}

impl BigQuerySink {
    pub fn new(tokens: Arc<dyn TokenSource>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, tokens })
    }

    async fn wait_for_job(
        &self,
        project: &str,
        job_id: &str,
        location: Option<&str>,
    ) -> anyhow::Result<Value> {
        let url = format!("{API_BASE}/projects/{project}/jobs/{job_id}");
        loop {
            let token = self.tokens.access_token().await?;
            let mut req = self.client.get(&url).bearer_auth(token);
            if let Some(location) = location {
                req = req.query(&[("location", location)]);
            }
            let job = json_or_error(req.send().await?).await?;
            if job["status"]["state"].as_str() == Some("DONE") {
                return Ok(job);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

async fn json_or_error(resp: reqwest::Response) -> anyhow::Result<Value> {
    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let msg = body["error"]["message"].as_str().unwrap_or("unknown error");
        anyhow::bail!("BigQuery API error ({status}): {msg}");
    }
    Ok(body)
}

/// Newline-delimited JSON, one row per line.
pub fn to_ndjson(rows: &[Row]) -> anyhow::Result<String> {
    let mut out = String::new();
    for row in rows {
        out.push_str(&serde_json::to_string(row)?);
        out.push('\n');
    }
    Ok(out)
}

fn load_job_config(table: &TableRef, job_id: &str) -> Value {
    json!({
        "jobReference": { "projectId": table.project, "jobId": job_id },
        "configuration": {
            "load": {
                "destinationTable": {
                    "projectId": table.project,
                    "datasetId": table.dataset,
                    "tableId": table.table,
                },
                "sourceFormat": "NEWLINE_DELIMITED_JSON",
                "writeDisposition": "WRITE_TRUNCATE",
                "createDisposition": "CREATE_IF_NEEDED",
                "autodetect": true,
            }
        }
    })
}

/// `multipart/related` body carrying the job config and the data.
fn multipart_body(boundary: &str, metadata: &Value, data: &str) -> String {
    format!(
        "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n\
         --{boundary}\r\nContent-Type: application/octet-stream\r\n\r\n{data}\r\n\
         --{boundary}--\r\n"
    )
}

fn job_failure(job: &Value) -> Option<String> {
    let error = job["status"]["errorResult"].as_object()?;
    let mut msg = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("load job failed")
        .to_string();
    if let Some(details) = job["status"]["errors"].as_array() {
        let extra: Vec<&str> = details
            .iter()
            .filter_map(|e| e["message"].as_str())
            .take(5)
            .collect();
        if !extra.is_empty() {
            msg.push_str(": ");
            msg.push_str(&extra.join("; "));
        }
    }
    Some(msg)
}

#[async_trait::async_trait]
impl TableSink for BigQuerySink {
    async fn replace(&self, table: &TableRef, rows: &[Row]) -> anyhow::Result<u64> {
        let job_id = format!("shopload_{}", Uuid::new_v4().as_simple());
        let boundary = format!("shopload-{}", Uuid::new_v4().as_simple());
        let body = multipart_body(&boundary, &load_job_config(table, &job_id), &to_ndjson(rows)?);

        let token = self.tokens.access_token().await?;
        let resp = self
            .client
            .post(format!(
                "{UPLOAD_BASE}/projects/{}/jobs?uploadType=multipart",
                table.project
            ))
            .bearer_auth(token)
            .header(
                "Content-Type",
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await?;
        let created = json_or_error(resp).await?;
        let location = created["jobReference"]["location"].as_str().map(str::to_string);

        tracing::info!(table = %table, job_id = %job_id, rows = rows.len(), "bigquery: load job started");
        let job = self
            .wait_for_job(&table.project, &job_id, location.as_deref())
            .await?;
        if let Some(msg) = job_failure(&job) {
            anyhow::bail!("load into {table} failed: {msg}");
        }
        Ok(rows.len() as u64)
    }

    async fn ensure_dataset(&self, project: &str, dataset: &str) -> anyhow::Result<()> {
        let token = self.tokens.access_token().await?;
        let resp = self
            .client
            .post(format!("{API_BASE}/projects/{project}/datasets"))
            .bearer_auth(token)
            .json(&json!({
                "datasetReference": { "projectId": project, "datasetId": dataset },
                "location": DATASET_LOCATION,
            }))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::CONFLICT {
            tracing::info!(project, dataset, "bigquery: dataset already exists");
            return Ok(());
        }
        json_or_error(resp).await?;
        tracing::info!(project, dataset, "bigquery: dataset created");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ndjson_has_one_line_per_row() {
        let mut a = Row::new();
        a.insert("id".into(), json!("1"));
        let mut b = Row::new();
        b.insert("id".into(), json!("2"));
        b.insert("total".into(), json!(1.5));
        let out = to_ndjson(&[a, b]).unwrap();
        assert_eq!(out, "{\"id\":\"1\"}\n{\"id\":\"2\",\"total\":1.5}\n");
    }

    #[test]
    fn load_config_truncates_and_autodetects() {
        let table = TableRef::new("proj", "shopify_foo", "order_insights");
        let config = load_job_config(&table, "job1");
        let load = &config["configuration"]["load"];
        assert_eq!(load["writeDisposition"], "WRITE_TRUNCATE");
        assert_eq!(load["sourceFormat"], "NEWLINE_DELIMITED_JSON");
        assert_eq!(load["autodetect"], true);
        assert_eq!(load["destinationTable"]["tableId"], "order_insights");
        assert_eq!(table.to_string(), "proj.shopify_foo.order_insights");
    }

    #[test]
    fn multipart_body_wraps_both_parts() {
        let body = multipart_body("b", &json!({"k": 1}), "{\"id\":1}\n");
        assert!(body.starts_with("--b\r\nContent-Type: application/json"));
        assert!(body.contains("application/octet-stream\r\n\r\n{\"id\":1}\n"));
        assert!(body.ends_with("--b--\r\n"));
    }

    #[test]
    fn failure_message_includes_details() {
        let job = json!({"status": {
            "state": "DONE",
            "errorResult": {"message": "Error while reading data"},
            "errors": [{"message": "bad value in column total"}]
        }});
        assert_eq!(
            job_failure(&job).unwrap(),
            "Error while reading data: bad value in column total"
        );
        assert!(job_failure(&json!({"status": {"state": "DONE"}})).is_none());
    }
}
