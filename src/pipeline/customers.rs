use super::StoreRun;
use super::fetch::{Connection, fetch_all};
use super::rows::{amount, gid_at, int_at, joined, row, utc_timestamp, value_at};
use crate::schema::Component;
use crate::services::Row;
use chrono::NaiveDate;
use serde_json::{Value, json};

// requires the protected customer data scope
const PII_FIELDS: &str = r#"
        email
        firstName
        displayName
        phone
        note
        tags
        defaultAddress {
          id firstName lastName company address1 address2
          city province country zip phone name
        }"#;

pub fn query(start: NaiveDate, cursor: Option<&str>, include_pii: bool) -> String {
    let after = cursor
        .map(|c| format!(r#", after: "{c}""#))
        .unwrap_or_default();
    let pii = if include_pii { PII_FIELDS } else { "" };
    format!(
        r#"query {{
  customers(first: 250, query: "created_at:>={start}"{after}) {{
    edges {{
      cursor
      node {{
        id
        lastOrder {{ id name }}
        numberOfOrders
        amountSpent {{ amount currencyCode }}
        createdAt
        updatedAt{pii}
      }}
    }}
    pageInfo {{ hasNextPage endCursor }}
  }}
}}"#
    )
}

pub fn flatten(node: &Value, store_name: &str) -> Row {
    let address = &node["defaultAddress"];
    row(vec![
        ("store_name", json!(store_name)),
        ("id", gid_at(node, "/id")),
        ("created_at", utc_timestamp(&node["createdAt"])),
        ("updated_at", utc_timestamp(&node["updatedAt"])),
        ("email", json!(node["email"].as_str().unwrap_or(""))),
        ("first_name", json!(node["firstName"].as_str().unwrap_or(""))),
        ("display_name", json!(node["displayName"].as_str().unwrap_or(""))),
        ("total_spent", json!(amount(&node["amountSpent"]["amount"]))),
        ("currency_code", value_at(node, "/amountSpent/currencyCode")),
        ("last_order_id", gid_at(node, "/lastOrder/id")),
        ("last_order_name", value_at(node, "/lastOrder/name")),
        ("orders_count", json!(int_at(node, "/numberOfOrders"))),
        ("phone", value_at(node, "/phone")),
        ("note", json!(node["note"].as_str().unwrap_or(""))),
        ("tags", json!(joined(&node["tags"]))),
        ("default_address_id", address["id"].clone()),
        ("default_address_first_name", address["firstName"].clone()),
        ("default_address_last_name", address["lastName"].clone()),
        ("default_address_company", address["company"].clone()),
        ("default_address_address1", address["address1"].clone()),
        ("default_address_address2", address["address2"].clone()),
        ("default_address_city", address["city"].clone()),
        ("default_address_province", address["province"].clone()),
        ("default_address_country", address["country"].clone()),
        ("default_address_zip", address["zip"].clone()),
        ("default_address_phone", address["phone"].clone()),
        ("default_address_name", address["name"].clone()),
    ])
}

pub async fn run(run: &StoreRun<'_>) -> anyhow::Result<usize> {
    let start = run.store.backfill_start_date;
    let connection = Connection {
        name: "customers",
        component: Component::Customers,
        degradable: true,
        build: |cursor: Option<&str>, full: bool| query(start, cursor, full),
    };
    let nodes = fetch_all(run, &connection).await?;
    let rows = nodes
        .iter()
        .map(|n| flatten(n, &run.store.merchant))
        .collect();
    run.load(Component::Customers, &run.store.customer_table, rows)
        .await
}
