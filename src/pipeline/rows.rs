//! Helpers for turning Shopify GraphQL nodes into flat warehouse rows.

use crate::services::Row;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::{Value, json};
use std::collections::BTreeSet;

const SAMPLE_CHARS: usize = 200;

/// `gid://shopify/Order/123` -> `123`. Plain ids pass through.
pub fn id_tail(gid: &str) -> String {
    gid.rsplit('/').next().unwrap_or(gid).to_string()
}

pub fn gid_at(node: &Value, pointer: &str) -> Value {
    match node.pointer(pointer).and_then(Value::as_str) {
        Some(gid) => json!(id_tail(gid)),
        None => Value::Null,
    }
}

pub fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

/// Shopify money amounts arrive as decimal strings. Absent or unparsable is 0.
pub fn amount(v: &Value) -> f64 {
    let raw = match v {
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    };
    if raw.is_finite() { round6(raw) } else { 0.0 }
}

pub fn money_at(node: &Value, pointer: &str) -> f64 {
    node.pointer(pointer).map(amount).unwrap_or(0.0)
}

pub fn value_at(node: &Value, pointer: &str) -> Value {
    node.pointer(pointer).cloned().unwrap_or(Value::Null)
}

pub fn int_at(node: &Value, pointer: &str) -> i64 {
    match node.pointer(pointer) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// RFC 3339 in UTC, or null.
pub fn utc_timestamp(v: &Value) -> Value {
    match parse_timestamp(v) {
        Some(t) => json!(t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        None => Value::Null,
    }
}

/// Wall-clock time and calendar date in the shop's timezone.
pub fn shop_local(v: &Value, tz: Tz) -> (Value, Value) {
    match parse_timestamp(v) {
        Some(t) => {
            let local = t.with_timezone(&tz);
            (
                json!(local.format("%Y-%m-%d %H:%M:%S").to_string()),
                json!(local.format("%Y-%m-%d").to_string()),
            )
        }
        None => (Value::Null, Value::Null),
    }
}

/// `["a", "b"]` -> `"a, b"`. Strings pass through; anything else is empty.
pub fn joined(v: &Value) -> String {
    match v {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(", "),
        Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

/// `node`s of a GraphQL connection's `edges`.
pub fn edge_nodes<'a>(connection: &'a Value) -> impl Iterator<Item = &'a Value> {
    connection["edges"]
        .as_array()
        .into_iter()
        .flatten()
        .map(|edge| &edge["node"])
        .filter(|node| node.is_object())
}

pub fn row(fields: Vec<(&str, Value)>) -> Row {
    fields
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// One line per column: null count, longest string and a few sample values.
/// Printed after a failed load to point at the offending column.
pub fn column_diagnostics(rows: &[Row]) -> Vec<String> {
    let columns: BTreeSet<&String> = rows.iter().flat_map(|r| r.keys()).collect();
    columns
        .into_iter()
        .map(|column| {
            let values: Vec<&Value> = rows
                .iter()
                .filter_map(|r| r.get(column))
                .filter(|v| !v.is_null())
                .collect();
            let nulls = rows.len() - values.len();
            let max_len = values
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.chars().count())
                .max()
                .unwrap_or(0);
            let samples: String = values
                .iter()
                .take(3)
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(", ")
                .chars()
                .take(SAMPLE_CHARS)
                .collect();
            format!("Column '{column}': nulls={nulls}, max_len={max_len}, samples=[{samples}]")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_gid_prefix() {
        assert_eq!(id_tail("gid://shopify/Customer/42"), "42");
        assert_eq!(id_tail("42"), "42");
        let node = json!({"customer": {"id": "gid://shopify/Customer/7"}});
        assert_eq!(gid_at(&node, "/customer/id"), json!("7"));
        assert_eq!(gid_at(&node, "/missing/id"), Value::Null);
    }

    #[test]
    fn money_is_rounded_and_defaults_to_zero() {
        assert_eq!(amount(&json!("19.9900001")), 19.99);
        assert_eq!(amount(&json!("0.1234567")), 0.123457);
        assert_eq!(amount(&json!(3)), 3.0);
        assert_eq!(amount(&Value::Null), 0.0);
        assert_eq!(amount(&json!("n/a")), 0.0);
        let node = json!({"totalPriceSet": {"shopMoney": {"amount": "12.50"}}});
        assert_eq!(money_at(&node, "/totalPriceSet/shopMoney/amount"), 12.5);
        assert_eq!(money_at(&node, "/totalTaxSet/shopMoney/amount"), 0.0);
    }

    #[test]
    fn timestamps_normalize_to_utc_and_shop_time() {
        let ts = json!("2024-01-10T23:30:00-05:00");
        assert_eq!(utc_timestamp(&ts), json!("2024-01-11T04:30:00Z"));
        let (local, date) = shop_local(&ts, chrono_tz::America::New_York);
        assert_eq!(local, json!("2024-01-10 23:30:00"));
        assert_eq!(date, json!("2024-01-10"));
        assert_eq!(utc_timestamp(&json!("yesterday")), Value::Null);
    }

    #[test]
    fn diagnostics_describe_each_column() {
        let rows = vec![
            row(vec![("id", json!("1")), ("note", Value::Null)]),
            row(vec![("id", json!("22")), ("note", json!("hello"))]),
        ];
        let lines = column_diagnostics(&rows);
        assert_eq!(
            lines,
            vec![
                "Column 'id': nulls=0, max_len=2, samples=[\"1\", \"22\"]".to_string(),
                "Column 'note': nulls=1, max_len=5, samples=[\"hello\"]".to_string(),
            ]
        );
    }
}
