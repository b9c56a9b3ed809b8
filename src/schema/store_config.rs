use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

fn default_backfill_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2015, 1, 1).unwrap_or_default()
}

fn default_true() -> bool {
    true
}

fn default_customer_table() -> String {
    "customer_insights".to_string()
}

fn default_order_table() -> String {
    "order_insights".to_string()
}

fn default_order_items_table() -> String {
    "order_items_insights".to_string()
}

fn default_product_table() -> String {
    "products_insights".to_string()
}

/// Per-store settings. Serialized in the upper-case shape used by
/// `STORE_CONFIG_JSON` and `store_config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(rename = "MERCHANT")]
    pub merchant: String,
    #[serde(rename = "TOKEN")]
    pub token: String,
    #[serde(rename = "GCP_PROJECT_ID")]
    pub gcp_project_id: String,
    #[serde(rename = "BIGQUERY_DATASET")]
    pub bigquery_dataset: String,
    #[serde(rename = "BACKFILL_START_DATE", default = "default_backfill_start")]
    pub backfill_start_date: NaiveDate,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(
        rename = "BIGQUERY_TABLE_CUSTOMER_INSIGHTS",
        default = "default_customer_table"
    )]
    pub customer_table: String,
    #[serde(
        rename = "BIGQUERY_TABLE_ORDER_INSIGHTS",
        default = "default_order_table"
    )]
    pub order_table: String,
    #[serde(
        rename = "BIGQUERY_TABLE_ORDER_ITEMS_INSIGHTS",
        default = "default_order_items_table"
    )]
    pub order_items_table: String,
    #[serde(
        rename = "BIGQUERY_TABLE_PRODUCT_INSIGHTS",
        default = "default_product_table"
    )]
    pub product_table: String,
}

impl StoreConfig {
    pub fn new(merchant: String, token: String, gcp_project_id: String, dataset: String) -> Self {
        Self {
            merchant,
            token,
            gcp_project_id,
            bigquery_dataset: dataset,
            backfill_start_date: default_backfill_start(),
            is_active: true,
            customer_table: default_customer_table(),
            order_table: default_order_table(),
            order_items_table: default_order_items_table(),
            product_table: default_product_table(),
        }
    }

    /// Copy safe to print or return over the API.
    pub fn redacted(&self) -> Self {
        Self {
            token: mask_token(&self.token),
            ..self.clone()
        }
    }
}

/// Strip scheme and path so `https://foo.myshopify.com/admin` becomes
/// `foo.myshopify.com`.
pub fn normalize_shopify_url(url: &str) -> String {
    let url = url.trim();
    let url = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    url.split('/').next().unwrap_or_default().to_string()
}

pub fn valid_shopify_url(url: &str) -> bool {
    !url.is_empty() && url.ends_with(".myshopify.com") && !url.contains('/') && !url.contains(' ')
}

pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() < 10 {
        return "********".to_string();
    }
    let head: String = chars[..10].iter().collect();
    let tail_start = chars.len().saturating_sub(5).max(10);
    let tail: String = chars[tail_start..].iter().collect();
    let stars = "*".repeat(chars.len().saturating_sub(15));
    format!("{head}{stars}{tail}")
}

pub fn valid_dataset_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Collect every onboarding validation failure instead of stopping at the first.
pub fn validate_onboarding(merchant: &str, token: &str, dataset: &str) -> Vec<String> {
    let mut errors = Vec::new();
    if !valid_shopify_url(merchant) {
        errors.push("Merchant URL must end with .myshopify.com".to_string());
    }
    if !token.starts_with("shpat_") {
        errors.push("Token must start with 'shpat_'".to_string());
    }
    if !valid_dataset_name(dataset) {
        errors.push(
            "Dataset name must contain only lowercase letters, numbers, and underscores"
                .to_string(),
        );
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_scheme_and_path() {
        assert_eq!(
            normalize_shopify_url("  https://foo.myshopify.com/admin/orders "),
            "foo.myshopify.com"
        );
        assert_eq!(normalize_shopify_url("http://bar.myshopify.com"), "bar.myshopify.com");
        assert_eq!(normalize_shopify_url("baz.myshopify.com"), "baz.myshopify.com");
    }

    #[test]
    fn rejects_non_shopify_urls() {
        assert!(valid_shopify_url("foo.myshopify.com"));
        assert!(!valid_shopify_url("foo.com"));
        assert!(!valid_shopify_url("foo bar.myshopify.com"));
        assert!(!valid_shopify_url(""));
    }

    #[test]
    fn masks_middle_of_token() {
        let token = "shpat_0123456789abcdef";
        let masked = mask_token(token);
        assert_eq!(masked.len(), token.len());
        assert!(masked.starts_with("shpat_0123"));
        assert!(masked.ends_with("bcdef"));
        assert_eq!(mask_token("short"), "********");
    }

    #[test]
    fn onboarding_validation_reports_every_problem() {
        let errors = validate_onboarding("foo.com", "abc", "Bad-Name");
        assert_eq!(errors.len(), 3);
        assert!(validate_onboarding("foo.myshopify.com", "shpat_x", "shopify_foo").is_empty());
    }

    #[test]
    fn parses_legacy_json_shape_with_defaults() {
        let config: StoreConfig = serde_json::from_str(
            r#"{
                "MERCHANT": "foo.myshopify.com",
                "TOKEN": "shpat_abc",
                "GCP_PROJECT_ID": "proj",
                "BIGQUERY_DATASET": "shopify_foo"
            }"#,
        )
        .unwrap();
        assert_eq!(config.customer_table, "customer_insights");
        assert_eq!(config.product_table, "products_insights");
        assert_eq!(
            config.backfill_start_date,
            NaiveDate::from_ymd_opt(2015, 1, 1).unwrap()
        );
        assert!(config.is_active);
    }
}
