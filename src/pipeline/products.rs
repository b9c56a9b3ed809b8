use super::StoreRun;
use super::fetch::{Connection, fetch_all};
use super::rows::{amount, edge_nodes, gid_at, int_at, joined, row, utc_timestamp, value_at};
use crate::schema::Component;
use crate::services::Row;
use serde_json::{Value, json};

pub fn query(cursor: Option<&str>) -> String {
    let after = cursor
        .map(|c| format!(r#", after: "{c}""#))
        .unwrap_or_default();
    format!(
        r#"query {{
  products(first: 50{after}) {{
    pageInfo {{ hasNextPage endCursor }}
    edges {{
      cursor
      node {{
        id
        createdAt
        updatedAt
        title
        productType
        handle
        status
        publishedAt
        tags
        vendor
        media(first: 1, sortKey: POSITION) {{
          nodes {{ mediaContentType ... on MediaImage {{ image {{ url altText }} }} }}
        }}
        variants(first: 50) {{
          edges {{
            node {{
              id
              sku
              title
              price
              compareAtPrice
              inventoryItem {{ id }}
              inventoryQuantity
              image {{ url }}
            }}
          }}
        }}
      }}
    }}
  }}
}}"#
    )
}

fn product_image(node: &Value) -> Option<&str> {
    node["media"]["nodes"]
        .as_array()?
        .iter()
        .find_map(|media| media["image"]["url"].as_str())
}

/// One row per variant; the variant image falls back to the product's first image.
pub fn flatten(node: &Value, store_name: &str) -> Vec<Row> {
    let fallback_image = product_image(node).unwrap_or_default();

    edge_nodes(&node["variants"])
        .map(|variant| {
            let image = variant["image"]["url"]
                .as_str()
                .filter(|url| !url.is_empty())
                .unwrap_or(fallback_image);
            row(vec![
                ("store_name", json!(store_name)),
                ("id", gid_at(node, "/id")),
                ("created_at", utc_timestamp(&node["createdAt"])),
                ("updated_at", utc_timestamp(&node["updatedAt"])),
                ("published_at", utc_timestamp(&node["publishedAt"])),
                ("title", value_at(node, "/title")),
                ("product_type", value_at(node, "/productType")),
                ("handle", value_at(node, "/handle")),
                ("status", value_at(node, "/status")),
                ("tags", json!(joined(&node["tags"]))),
                ("vendor", value_at(node, "/vendor")),
                ("variant_id", gid_at(variant, "/id")),
                ("variant_sku", value_at(variant, "/sku")),
                ("variant_title", value_at(variant, "/title")),
                ("variant_price", json!(amount(&variant["price"]))),
                (
                    "variant_compare_at_price",
                    if variant["compareAtPrice"].is_null() {
                        Value::Null
                    } else {
                        json!(amount(&variant["compareAtPrice"]))
                    },
                ),
                ("variant_inventory_item_id", gid_at(variant, "/inventoryItem/id")),
                (
                    "variant_inventory_quantity",
                    json!(int_at(variant, "/inventoryQuantity")),
                ),
                ("variant_image_url", json!(image)),
            ])
        })
        .collect()
}

pub async fn run(run: &StoreRun<'_>) -> anyhow::Result<usize> {
    let connection = Connection {
        name: "products",
        component: Component::Products,
        degradable: false,
        build: |cursor: Option<&str>, _full: bool| query(cursor),
    };
    let products = fetch_all(run, &connection).await?;
    let rows: Vec<Row> = products
        .iter()
        .flat_map(|p| flatten(p, &run.store.merchant))
        .collect();
    run.load(Component::Products, &run.store.product_table, rows)
        .await
}
