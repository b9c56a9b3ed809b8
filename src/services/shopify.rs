use chrono_tz::Tz;
use serde_json::{Value, json};
use std::time::Duration;

pub const API_VERSION: &str = "2025-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Executes GraphQL documents against one shop's Admin API.
///
/// Returns the whole response body, `errors` included: throttling and
/// permission errors arrive in a 200 response and are the caller's to
/// interpret.
#[async_trait::async_trait]
pub trait ShopifyApi: Send + Sync {
    async fn execute(&self, query: &str) -> anyhow::Result<Value>;
}

pub struct ShopifyClient {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl ShopifyClient {
    pub fn new(shop: &str, token: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("https://{shop}/admin/api/{API_VERSION}/graphql.json"),
            token: token.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl ShopifyApi for ShopifyClient {
    async fn execute(&self, query: &str) -> anyhow::Result<Value> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header("X-Shopify-Access-Token", &self.token)
            .json(&json!({ "query": query }))
            .send()
            .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Ok(json!({ "errors": [{ "message": "Throttled" }] }));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Shopify API error ({status}): {}", truncate(&body, 300));
        }
        Ok(resp.json().await?)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// `message` of every entry in the response's `errors` array.
pub fn error_messages(response: &Value) -> Vec<String> {
    response["errors"]
        .as_array()
        .map(|errors| {
            errors
                .iter()
                .map(|e| match e["message"].as_str() {
                    Some(msg) => msg.to_string(),
                    None => e.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn error_codes(response: &Value) -> Vec<&str> {
    response["errors"]
        .as_array()
        .map(|errors| {
            errors
                .iter()
                .filter_map(|e| e["extensions"]["code"].as_str())
                .collect()
        })
        .unwrap_or_default()
}

pub fn is_throttled(response: &Value) -> bool {
    error_messages(response).iter().any(|m| m.contains("Throttled"))
        || error_codes(response).contains(&"THROTTLED")
}

pub fn is_access_denied(response: &Value) -> bool {
    error_messages(response)
        .iter()
        .any(|m| m.contains("not approved to access"))
        || error_codes(response).contains(&"ACCESS_DENIED")
}

/// The shop's IANA timezone, UTC when it cannot be determined.
pub async fn shop_timezone(api: &dyn ShopifyApi) -> Tz {
    let response = match api.execute("query { shop { ianaTimezone } }").await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "shopify: timezone lookup failed, using UTC");
            return Tz::UTC;
        }
    };
    match response["data"]["shop"]["ianaTimezone"]
        .as_str()
        .and_then(|name| name.parse::<Tz>().ok())
    {
        Some(tz) => tz,
        None => {
            tracing::warn!("shopify: shop has no usable timezone, using UTC");
            Tz::UTC
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Value);

    #[async_trait::async_trait]
    impl ShopifyApi for Fixed {
        async fn execute(&self, _query: &str) -> anyhow::Result<Value> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn classifies_graphql_errors() {
        let throttled = json!({"errors": [{"message": "Throttled"}]});
        assert!(is_throttled(&throttled));
        assert!(!is_access_denied(&throttled));

        let by_code = json!({"errors": [{"message": "slow down", "extensions": {"code": "THROTTLED"}}]});
        assert!(is_throttled(&by_code));

        let denied = json!({"errors": [{
            "message": "This app is not approved to access the Customer object."
        }]});
        assert!(is_access_denied(&denied));
        assert!(!is_throttled(&denied));

        assert!(error_messages(&json!({"data": {}})).is_empty());
    }

    #[tokio::test]
    async fn timezone_falls_back_to_utc() {
        let tz = shop_timezone(&Fixed(json!({"data": {"shop": {"ianaTimezone": "Europe/Berlin"}}}))).await;
        assert_eq!(tz, chrono_tz::Europe::Berlin);

        let tz = shop_timezone(&Fixed(json!({"data": {"shop": {"ianaTimezone": "Mars/Olympus"}}}))).await;
        assert_eq!(tz, Tz::UTC);
    }

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
