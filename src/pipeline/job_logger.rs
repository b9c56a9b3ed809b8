use crate::jobs::{JobManager, StatusUpdate};
use crate::jobs::runner::{ENV_CAPTURED, ENV_JOB_ID};
use crate::schema::{Component, JobStatus, LogLevel};

/// Pipeline-side logger. Every line is printed as `[LEVEL] message`; with a
/// job id it is also appended to the job's log, unless a parent process is
/// capturing stdout and will record the printed line itself.
pub struct JobLogger {
    job_id: Option<String>,
    manager: Option<JobManager>,
    captured: bool,
}

impl JobLogger {
    pub fn new(job_id: Option<String>, manager: Option<JobManager>, captured: bool) -> Self {
        Self {
            job_id,
            manager,
            captured,
        }
    }

    pub fn from_env(manager: Option<JobManager>) -> Self {
        let job_id = std::env::var(ENV_JOB_ID).ok().filter(|s| !s.is_empty());
        let captured = std::env::var(ENV_CAPTURED).is_ok_and(|v| v == "1");
        Self::new(job_id, manager, captured)
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    pub async fn log(
        &self,
        level: LogLevel,
        message: &str,
        store_url: Option<&str>,
        component: Option<Component>,
    ) {
        println!("[{level}] {message}");
        if self.captured {
            return;
        }
        if let (Some(job_id), Some(manager)) = (&self.job_id, &self.manager)
            && let Err(e) = manager
                .log_message(job_id, level, message, store_url, component)
                .await
        {
            tracing::warn!(job_id = %job_id, error = %e, "pipeline: could not store log line");
        }
    }

    pub async fn info(&self, message: &str, store_url: Option<&str>, component: Component) {
        self.log(LogLevel::Info, message, store_url, Some(component)).await;
    }

    pub async fn warning(&self, message: &str, store_url: Option<&str>, component: Component) {
        self.log(LogLevel::Warning, message, store_url, Some(component)).await;
    }

    pub async fn error(&self, message: &str, store_url: Option<&str>, component: Component) {
        self.log(LogLevel::Error, message, store_url, Some(component)).await;
    }

    /// Record the run's terminal status. A no-op without a job id or store.
    pub async fn update_job_status(
        &self,
        status: JobStatus,
        error_message: Option<String>,
        records_processed: Option<i64>,
    ) {
        let (Some(job_id), Some(manager)) = (&self.job_id, &self.manager) else {
            tracing::warn!("pipeline: no job id or job store, status update skipped");
            return;
        };
        match manager
            .update_job_status(job_id, status, error_message, records_processed)
            .await
        {
            Ok(StatusUpdate::Applied) => {
                tracing::info!(job_id = %job_id, status = %status, "pipeline: job status updated");
            }
            Ok(StatusUpdate::AlreadyTerminal(current)) => {
                tracing::info!(job_id = %job_id, current = %current, "pipeline: job already terminal");
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "pipeline: failed to update job status");
            }
        }
    }
}
