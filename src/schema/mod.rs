pub mod job;
pub mod log_entry;
pub mod store_config;

pub use job::*;
pub use log_entry::*;
pub use store_config::*;
