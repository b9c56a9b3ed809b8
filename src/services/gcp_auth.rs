use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
// refresh a bit before Google says the token expires
const EXPIRY_SLACK: Duration = Duration::from_secs(60);

/// OAuth access tokens for Google APIs (BigQuery, Cloud Run).
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> anyhow::Result<String>;
}

/// Fixed token, typically from `GCP_ACCESS_TOKEN` during local runs.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait::async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

/// Token of the attached service account, fetched from the GCE/Cloud Run
/// metadata server and cached until shortly before it expires.
pub struct MetadataTokenSource {
    client: reqwest::Client,
    cached: Mutex<Option<(String, Instant)>>,
}

impl MetadataTokenSource {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            cached: Mutex::new(None),
        })
    }
}

#[async_trait::async_trait]
impl TokenSource for MetadataTokenSource {
    async fn access_token(&self) -> anyhow::Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some((token, expires)) = cached.as_ref()
            && Instant::now() < *expires
        {
            return Ok(token.clone());
        }

        let resp = self
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("metadata server returned {status}");
        }
        let token: MetadataToken = resp.json().await?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_SLACK);
        *cached = Some((token.access_token.clone(), Instant::now() + lifetime));
        tracing::debug!(expires_in = token.expires_in, "gcp: refreshed access token");
        Ok(token.access_token)
    }
}

pub fn token_source_from_env() -> anyhow::Result<Arc<dyn TokenSource>> {
    match std::env::var("GCP_ACCESS_TOKEN") {
        Ok(token) if !token.trim().is_empty() => Ok(Arc::new(StaticToken::new(token.trim()))),
        _ => Ok(Arc::new(MetadataTokenSource::new()?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_response_shape() {
        let token: MetadataToken = serde_json::from_str(
            r#"{"access_token":"ya29.abc","expires_in":3599,"token_type":"Bearer"}"#,
        )
        .unwrap();
        assert_eq!(token.access_token, "ya29.abc");
        assert_eq!(token.expires_in, 3599);
    }

    #[tokio::test]
    async fn static_token_is_returned_as_is() {
        let source = StaticToken::new("t0k");
        assert_eq!(source.access_token().await.unwrap(), "t0k");
    }
}
