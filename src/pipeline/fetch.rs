use super::StoreRun;
use crate::schema::Component;
use crate::services::shopify::{error_messages, is_access_denied, is_throttled};
use serde_json::Value;

/// A paginated GraphQL connection, e.g. `customers` or `orders`.
pub struct Connection<F>
where
    F: Fn(Option<&str>, bool) -> String,
{
    pub name: &'static str,
    pub component: Component,
    /// Whether a permission error may be retried without restricted fields.
    pub degradable: bool,
    /// Builds the document for `(cursor, full_fields)`.
    pub build: F,
}

/// Walk every page of `connection` and return its nodes.
///
/// Throttling sleeps and retries without a cap. A permission error on a
/// degradable connection drops the restricted fields for the rest of the
/// walk. Any other error stops the walk and keeps what was fetched, and
/// only fails when nothing was.
pub async fn fetch_all<F>(run: &StoreRun<'_>, connection: &Connection<F>) -> anyhow::Result<Vec<Value>>
where
    F: Fn(Option<&str>, bool) -> String,
{
    let store = Some(run.store.merchant.as_str());
    let component = connection.component;
    let name = connection.name;

    let mut nodes = Vec::new();
    let mut cursor: Option<String> = None;
    let mut full = true;
    let mut page = 1;
    let mut failure: Option<String> = None;

    loop {
        let query = (connection.build)(cursor.as_deref(), full);
        let response = match run.api.execute(&query).await {
            Ok(r) => r,
            Err(e) => {
                let msg = format!("Shopify API error: {e}");
                run.logger.error(&msg, store, component).await;
                failure = Some(msg);
                break;
            }
        };

        if response.get("errors").is_some_and(|e| !e.is_null()) {
            if is_throttled(&response) {
                run.logger
                    .info(
                        &format!(
                            "Throttled by Shopify. Sleeping {} seconds before retry...",
                            run.throttle_backoff.as_secs()
                        ),
                        store,
                        component,
                    )
                    .await;
                tokio::time::sleep(run.throttle_backoff).await;
                continue;
            }
            if connection.degradable && full && is_access_denied(&response) {
                run.logger
                    .warning(
                        &format!("Access denied on {name}. Retrying with limited fields..."),
                        store,
                        component,
                    )
                    .await;
                full = false;
                continue;
            }
            let msg = format!("GraphQL errors: {}", error_messages(&response).join("; "));
            run.logger.error(&msg, store, component).await;
            failure = Some(msg);
            break;
        }

        let conn = &response["data"][name];
        if !conn.is_object() {
            let msg = format!("'data.{name}' missing from response");
            run.logger.error(&msg, store, component).await;
            failure = Some(msg);
            break;
        }

        let before = nodes.len();
        nodes.extend(super::rows::edge_nodes(conn).cloned());
        run.logger
            .info(
                &format!("Page {page}: {} {name}", nodes.len() - before),
                store,
                component,
            )
            .await;

        if conn["pageInfo"]["hasNextPage"].as_bool() != Some(true) {
            break;
        }
        match conn["pageInfo"]["endCursor"].as_str() {
            Some(next) => cursor = Some(next.to_string()),
            None => break,
        }
        page += 1;
    }

    if nodes.is_empty()
        && let Some(msg) = failure
    {
        anyhow::bail!(msg);
    }
    if failure.is_some() {
        run.logger
            .warning(
                &format!("Continuing with {} {name} fetched before the failure", nodes.len()),
                store,
                component,
            )
            .await;
    }
    Ok(nodes)
}
