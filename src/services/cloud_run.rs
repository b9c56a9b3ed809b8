use super::gcp_auth::TokenSource;
use crate::jobs::JobDelegate;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

const RUN_API: &str = "https://run.googleapis.com/v2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct CloudRunConfig {
    pub project: String,
    pub region: String,
    pub job: String,
}

impl CloudRunConfig {
    /// `None` unless `CLOUD_RUN_JOB` names an already deployed job.
    pub fn from_env() -> Option<Self> {
        let job = std::env::var("CLOUD_RUN_JOB").ok().filter(|s| !s.is_empty())?;
        let project = std::env::var("GCP_PROJECT_ID").ok().filter(|s| !s.is_empty())?;
        let region =
            std::env::var("CLOUD_RUN_REGION").unwrap_or_else(|_| "us-central1".to_string());
        Some(Self {
            project,
            region,
            job,
        })
    }

    pub fn job_path(&self) -> String {
        format!(
            "projects/{}/locations/{}/jobs/{}",
            self.project, self.region, self.job
        )
    }
}

/// Runs the pipeline as an execution of an existing Cloud Run job, passing
/// the job id and store config through container env overrides.
pub struct CloudRunDelegate {
    client: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    config: CloudRunConfig,
}

impl CloudRunDelegate {
    pub fn new(config: CloudRunConfig, tokens: Arc<dyn TokenSource>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            tokens,
            config,
        })
    }
}

fn run_request(env: &[(String, String)]) -> Value {
    let env: Vec<Value> = env
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();
    json!({ "overrides": { "containerOverrides": [{ "env": env }] } })
}

/// Execution name from the long-running operation returned by `:run`.
fn execution_name(operation: &Value) -> Option<String> {
    operation["metadata"]["name"]
        .as_str()
        .or_else(|| operation["name"].as_str())
        .map(str::to_string)
}

#[async_trait::async_trait]
impl JobDelegate for CloudRunDelegate {
    async fn launch(&self, job_id: &str, env: &[(String, String)]) -> anyhow::Result<String> {
        let token = self.tokens.access_token().await?;
        let url = format!("{RUN_API}/{}:run", self.config.job_path());
        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&run_request(env))
            .send()
            .await?;

        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let msg = body["error"]["message"].as_str().unwrap_or("unknown error");
            anyhow::bail!("Cloud Run API error ({status}): {msg}");
        }

        let execution = execution_name(&body).unwrap_or_else(|| self.config.job.clone());
        tracing::info!(job_id, execution = %execution, "cloud run: execution started");
        Ok(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_goes_into_container_overrides() {
        let body = run_request(&[
            ("PIPELINE_JOB_ID".to_string(), "abc".to_string()),
            ("TARGET_STORE".to_string(), "foo.myshopify.com".to_string()),
        ]);
        let env = &body["overrides"]["containerOverrides"][0]["env"];
        assert_eq!(env[0]["name"], "PIPELINE_JOB_ID");
        assert_eq!(env[1]["value"], "foo.myshopify.com");
    }

    #[test]
    fn execution_name_prefers_metadata() {
        let op = json!({
            "name": "projects/p/locations/r/operations/1",
            "metadata": {"name": "projects/p/locations/r/jobs/j/executions/j-x1"}
        });
        assert_eq!(
            execution_name(&op).unwrap(),
            "projects/p/locations/r/jobs/j/executions/j-x1"
        );
        assert_eq!(
            execution_name(&json!({"name": "op"})).unwrap(),
            "op"
        );
    }

    #[test]
    fn job_path_layout() {
        let config = CloudRunConfig {
            project: "p".into(),
            region: "us-central1".into(),
            job: "shopify-pipeline".into(),
        };
        assert_eq!(
            config.job_path(),
            "projects/p/locations/us-central1/jobs/shopify-pipeline"
        );
    }
}
