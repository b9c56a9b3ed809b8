pub mod aggregate;
pub mod classify;
pub mod clock;
pub mod error;
pub mod manager;
pub mod postgres;
pub mod registry;
pub mod runner;
pub mod store;

pub use aggregate::{ActiveJob, JobAggregate, JobState, RecentJob};
pub use clock::{Clock, SystemClock};
pub use error::{JobError, JobResult};
pub use manager::{ErrorSummary, JobManager, JobManagerConfig, StatusUpdate};
pub use postgres::PgJobStore;
pub use registry::{CancellationHandle, JobRegistry};
pub use runner::{BackgroundRunner, JobDelegate, RunnerConfig};
pub use store::{AppendOutcome, JobScope, JobStore, MemoryJobStore};
