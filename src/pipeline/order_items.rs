use super::StoreRun;
use super::fetch::{Connection, fetch_all};
use super::rows::{
    edge_nodes, gid_at, int_at, joined, money_at, round6, row, shop_local, utc_timestamp, value_at,
};
use crate::schema::Component;
use crate::services::Row;
use chrono::NaiveDate;
use chrono_tz::Tz;
use serde_json::{Value, json};

pub fn query(start: NaiveDate, cursor: Option<&str>) -> String {
    let after = cursor
        .map(|c| format!(r#", after: "{c}""#))
        .unwrap_or_default();
    format!(
        r#"query {{
  orders(first: 250, query: "processed_at:>={start}"{after}) {{
    edges {{
      cursor
      node {{
        createdAt
        updatedAt
        processedAt
        email
        displayFinancialStatus
        name
        paymentGatewayNames
        currencyCode
        discountCode
        totalDiscountsSet {{ shopMoney {{ amount }} }}
        totalPriceSet {{ shopMoney {{ amount }} }}
        shippingLines(first: 1) {{
          edges {{ node {{ code discountedPriceSet {{ shopMoney {{ amount }} }} }} }}
        }}
        refunds {{
          refundLineItems(first: 10) {{
            edges {{ node {{ restockType subtotalSet {{ shopMoney {{ amount }} }} lineItem {{ id }} }} }}
          }}
        }}
        lineItems(first: 250) {{
          edges {{
            node {{
              id
              currentQuantity
              quantity
              title
              sku
              vendor
              variantTitle
              product {{ id }}
              variant {{ id }}
              originalUnitPriceSet {{ shopMoney {{ amount }} }}
              discountedUnitPriceSet {{ shopMoney {{ amount }} }}
              discountAllocations {{ allocatedAmountSet {{ shopMoney {{ amount }} }} }}
              taxLines {{ priceSet {{ shopMoney {{ amount }} }} rate }}
            }}
          }}
        }}
      }}
    }}
    pageInfo {{ hasNextPage endCursor }}
  }}
}}"#
    )
}

/// First refund line pointing at `line_item_id`: restock type and subtotal.
fn refund_for<'a>(order: &'a Value, line_item_id: &str) -> Option<&'a Value> {
    order["refunds"]
        .as_array()?
        .iter()
        .flat_map(|refund| edge_nodes(&refund["refundLineItems"]))
        .find(|refund_line| refund_line["lineItem"]["id"].as_str() == Some(line_item_id))
}

/// One row per line item, carrying the order-level columns.
pub fn flatten(order: &Value, tz: Tz) -> Vec<Row> {
    let (_, processed_date) = shop_local(&order["processedAt"], tz);
    let shipping = edge_nodes(&order["shippingLines"])
        .next()
        .cloned()
        .unwrap_or(Value::Null);

    edge_nodes(&order["lineItems"])
        .map(|item| {
            let item_id = item["id"].as_str().unwrap_or_default();
            let refund = refund_for(order, item_id);
            let discount: f64 = item["discountAllocations"]
                .as_array()
                .map(|allocs| {
                    allocs
                        .iter()
                        .map(|a| money_at(a, "/allocatedAmountSet/shopMoney/amount"))
                        .sum()
                })
                .unwrap_or(0.0);
            let tax_line = &item["taxLines"][0];

            row(vec![
                ("processed_at_store_date", processed_date.clone()),
                ("created_at", utc_timestamp(&order["createdAt"])),
                ("updated_at", utc_timestamp(&order["updatedAt"])),
                ("currency_code", value_at(order, "/currencyCode")),
                ("email", value_at(order, "/email")),
                ("display_financial_status", value_at(order, "/displayFinancialStatus")),
                ("name", value_at(order, "/name")),
                (
                    "payment_gateway_names",
                    json!(joined(&order["paymentGatewayNames"])),
                ),
                (
                    "total_discounts",
                    json!(money_at(order, "/totalDiscountsSet/shopMoney/amount")),
                ),
                ("total_price", json!(money_at(order, "/totalPriceSet/shopMoney/amount"))),
                ("discount_code", value_at(order, "/discountCode")),
                ("line_item_id", gid_at(item, "/id")),
                ("line_item_current_quantity", json!(int_at(item, "/currentQuantity"))),
                ("line_item_quantity", json!(int_at(item, "/quantity"))),
                (
                    "line_item_pre_tax_price",
                    json!(money_at(item, "/originalUnitPriceSet/shopMoney/amount")),
                ),
                (
                    "line_item_price",
                    json!(money_at(item, "/discountedUnitPriceSet/shopMoney/amount")),
                ),
                ("line_item_discount", json!(round6(discount))),
                ("line_item_product_id", gid_at(item, "/product/id")),
                ("line_item_variant_id", gid_at(item, "/variant/id")),
                ("line_item_sku", value_at(item, "/sku")),
                ("line_item_title", value_at(item, "/title")),
                ("line_item_variant_title", value_at(item, "/variantTitle")),
                ("line_item_vendor", value_at(item, "/vendor")),
                ("line_item_tax_rate", tax_line["rate"].clone()),
                (
                    "line_item_tax_price",
                    json!(money_at(tax_line, "/priceSet/shopMoney/amount")),
                ),
                ("shipping_line_code", value_at(&shipping, "/code")),
                (
                    "shipping_line_discounted_price",
                    json!(money_at(&shipping, "/discountedPriceSet/shopMoney/amount")),
                ),
                (
                    "refund_restock_type",
                    refund.map(|r| r["restockType"].clone()).unwrap_or(Value::Null),
                ),
                (
                    "refund_subtotal",
                    json!(refund
                        .map(|r| money_at(r, "/subtotalSet/shopMoney/amount"))
                        .unwrap_or(0.0)),
                ),
            ])
        })
        .collect()
}

pub async fn run(run: &StoreRun<'_>) -> anyhow::Result<usize> {
    let start = run.store.backfill_start_date;
    run.logger
        .info(
            &format!("Fetching order items from {start}"),
            Some(&run.store.merchant),
            Component::OrderItems,
        )
        .await;
    let connection = Connection {
        name: "orders",
        component: Component::OrderItems,
        degradable: false,
        build: |cursor: Option<&str>, _full: bool| query(start, cursor),
    };
    let orders = fetch_all(run, &connection).await?;
    let rows: Vec<Row> = orders
        .iter()
        .flat_map(|o| flatten(o, run.timezone))
        .collect();
    run.load(Component::OrderItems, &run.store.order_items_table, rows)
        .await
}
