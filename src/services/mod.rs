pub mod bigquery;
pub mod cloud_run;
pub mod gcp_auth;
pub mod shopify;
pub mod store_repository;

pub use bigquery::{BigQuerySink, Row, TableRef, TableSink};
pub use cloud_run::{CloudRunConfig, CloudRunDelegate};
pub use gcp_auth::{TokenSource, token_source_from_env};
pub use shopify::{ShopifyApi, ShopifyClient};
pub use store_repository::{MemoryStoreRepository, PgStoreRepository, StoreRepository};
