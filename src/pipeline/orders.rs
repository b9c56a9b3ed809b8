use super::StoreRun;
use super::fetch::{Connection, fetch_all};
use super::rows::{
    amount, gid_at, joined, money_at, round6, row, shop_local, utc_timestamp, value_at,
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
        currencyCode
        discountCodes
        email
        displayFinancialStatus
        name
        paymentGatewayNames
        shippingLine {{ title price taxLines {{ rate priceSet {{ shopMoney {{ amount }} }} }} }}
        totalDiscountsSet {{ shopMoney {{ amount }} }}
        totalPriceSet {{ shopMoney {{ amount }} }}
        cancelledAt
        confirmationNumber
        displayFulfillmentStatus
        landingPageUrl
        note
        tags
        totalRefundedSet {{ shopMoney {{ amount }} }}
        currentTotalDutiesSet {{ shopMoney {{ amount }} }}
        currentTotalAdditionalFeesSet {{ shopMoney {{ amount }} }}
        taxLines {{ priceSet {{ shopMoney {{ amount }} }} rate }}
        totalTipReceived {{ amount }}
        customer {{ id defaultAddress {{ country }} }}
        lineItems(first: 10) {{ edges {{ node {{ name vendor }} }} }}
      }}
    }}
    pageInfo {{ hasNextPage endCursor }}
  }}
}}"#
    )
}

fn line_item_field(node: &Value, field: &str) -> String {
    let values: Vec<Value> = super::rows::edge_nodes(&node["lineItems"])
        .map(|item| item[field].clone())
        .collect();
    joined(&Value::Array(values))
}

pub fn flatten(node: &Value, store_name: &str, tz: Tz) -> Row {
    let shipping = &node["shippingLine"];
    let shipping_tax = &shipping["taxLines"][0];
    let order_tax: f64 = node["taxLines"]
        .as_array()
        .map(|lines| {
            lines
                .iter()
                .map(|l| money_at(l, "/priceSet/shopMoney/amount"))
                .sum()
        })
        .unwrap_or(0.0);
    let (processed_local, processed_date) = shop_local(&node["processedAt"], tz);

    row(vec![
        ("store_name", json!(store_name)),
        ("name", value_at(node, "/name")),
        ("created_at", utc_timestamp(&node["createdAt"])),
        ("updated_at", utc_timestamp(&node["updatedAt"])),
        ("processed_at", utc_timestamp(&node["processedAt"])),
        ("processed_at_shopify_timezone", processed_local),
        ("processed_at_store_date", processed_date),
        ("currency_code", value_at(node, "/currencyCode")),
        ("discount_codes", json!(joined(&node["discountCodes"]))),
        ("email", value_at(node, "/email")),
        ("display_financial_status", value_at(node, "/displayFinancialStatus")),
        ("display_fulfillment_status", value_at(node, "/displayFulfillmentStatus")),
        ("payment_gateway_names", json!(joined(&node["paymentGatewayNames"]))),
        ("shipping_line_title", value_at(shipping, "/title")),
        ("shipping_line_price", json!(amount(&shipping["price"]))),
        ("shipping_line_tax_rate", shipping_tax["rate"].clone()),
        (
            "shipping_line_tax_amount",
            json!(money_at(shipping_tax, "/priceSet/shopMoney/amount")),
        ),
        ("total_refunded", json!(money_at(node, "/totalRefundedSet/shopMoney/amount"))),
        ("duties", json!(money_at(node, "/currentTotalDutiesSet/shopMoney/amount"))),
        (
            "additional_fees",
            json!(money_at(node, "/currentTotalAdditionalFeesSet/shopMoney/amount")),
        ),
        ("order_level_tax_amount", json!(round6(order_tax))),
        ("total_discounts", json!(money_at(node, "/totalDiscountsSet/shopMoney/amount"))),
        ("total_price", json!(money_at(node, "/totalPriceSet/shopMoney/amount"))),
        ("total_tip_received", json!(money_at(node, "/totalTipReceived/amount"))),
        ("cancelled_at", utc_timestamp(&node["cancelledAt"])),
        ("confirmation_number", value_at(node, "/confirmationNumber")),
        ("landing_page_url", value_at(node, "/landingPageUrl")),
        ("note", value_at(node, "/note")),
        ("tags", json!(joined(&node["tags"]))),
        ("customer_id", gid_at(node, "/customer/id")),
        ("customer_country", value_at(node, "/customer/defaultAddress/country")),
        ("line_items", json!(line_item_field(node, "name"))),
        ("vendor", json!(line_item_field(node, "vendor"))),
    ])
}

pub async fn run(run: &StoreRun<'_>) -> anyhow::Result<usize> {
    let start = run.store.backfill_start_date;
    let connection = Connection {
        name: "orders",
        component: Component::Orders,
        degradable: false,
        build: |cursor: Option<&str>, _full: bool| query(start, cursor),
    };
    let nodes = fetch_all(run, &connection).await?;
    let rows = nodes
        .iter()
        .map(|n| flatten(n, &run.store.merchant, run.timezone))
        .collect();
    run.load(Component::Orders, &run.store.order_table, rows).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Value {
        json!({
            "name": "#1001",
            "createdAt": "2024-02-01T08:00:00Z",
            "updatedAt": "2024-02-02T08:00:00Z",
            "processedAt": "2024-02-01T23:30:00Z",
            "currencyCode": "EUR",
            "discountCodes": ["WELCOME10"],
            "paymentGatewayNames": ["shopify_payments", "gift_card"],
            "shippingLine": {
                "title": "Standard",
                "price": "4.90",
                "taxLines": [{"rate": 0.19, "priceSet": {"shopMoney": {"amount": "0.78"}}}]
            },
            "totalPriceSet": {"shopMoney": {"amount": "59.90"}},
            "totalDiscountsSet": {"shopMoney": {"amount": "5.00"}},
            "taxLines": [
                {"rate": 0.19, "priceSet": {"shopMoney": {"amount": "8.10"}}},
                {"rate": 0.07, "priceSet": {"shopMoney": {"amount": "1.20"}}}
            ],
            "totalTipReceived": {"amount": "0.0"},
            "customer": {"id": "gid://shopify/Customer/77", "defaultAddress": {"country": "Germany"}},
            "lineItems": {"edges": [
                {"node": {"name": "Mug", "vendor": "Acme"}},
                {"node": {"name": "Tea", "vendor": "Leaf"}}
            ]},
            "cancelledAt": null
        })
    }

    #[test]
    fn flattens_order_with_shop_timezone() {
        let row = flatten(&order(), "demo.myshopify.com", chrono_tz::Europe::Berlin);
        assert_eq!(row["processed_at"], json!("2024-02-01T23:30:00Z"));
        assert_eq!(row["processed_at_shopify_timezone"], json!("2024-02-02 00:30:00"));
        assert_eq!(row["processed_at_store_date"], json!("2024-02-02"));
        assert_eq!(row["total_price"], json!(59.9));
        assert_eq!(row["order_level_tax_amount"], json!(9.3));
        assert_eq!(row["shipping_line_price"], json!(4.9));
        assert_eq!(row["shipping_line_tax_amount"], json!(0.78));
        assert_eq!(row["customer_id"], json!("77"));
        assert_eq!(row["customer_country"], json!("Germany"));
        assert_eq!(row["line_items"], json!("Mug, Tea"));
        assert_eq!(row["payment_gateway_names"], json!("shopify_payments, gift_card"));
        assert_eq!(row["total_refunded"], json!(0.0));
        assert_eq!(row["cancelled_at"], Value::Null);
    }

    #[test]
    fn query_filters_by_processed_date() {
        let q = query(NaiveDate::from_ymd_opt(2015, 1, 1).unwrap(), Some("xyz"));
        assert!(q.contains("processed_at:>=2015-01-01"));
        assert!(q.contains(r#"after: "xyz""#));
    }
}
