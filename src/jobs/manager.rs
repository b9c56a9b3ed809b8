use super::aggregate::{
    ActiveJob, JobAggregate, RecentJob, active_jobs, finished_job_ids, fold_all, fold_job,
    recent_jobs, stuck_jobs, window_start,
};
use super::clock::{Clock, SystemClock};
use super::error::{JobError, JobResult};
use super::registry::JobRegistry;
use super::store::{AppendOutcome, JobScope, JobStore};
use crate::schema::{
    Component, JobEvent, JobStatus, JobType, LogLevel, LogLine, MAX_LOG_MESSAGE_CHARS,
    truncate_message,
};
use chrono::Duration;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    /// Jobs whose origin is older than this are never reported as active.
    pub active_window: Duration,
    pub max_log_chars: usize,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            active_window: Duration::hours(24),
            max_log_chars: MAX_LOG_MESSAGE_CHARS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum StatusUpdate {
    Applied,
    AlreadyTerminal(JobStatus),
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub error_count: i64,
    pub warning_count: i64,
    pub recent: Vec<LogLine>,
}

/// One async lock per store, held across "is a job active?" and "create it".
#[derive(Default)]
struct StoreLocks(Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>);

impl StoreLocks {
    fn for_store(&self, store_url: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.0
            .lock()
            .unwrap()
            .entry(store_url.to_string())
            .or_default()
            .clone()
    }
}

/// Lifecycle operations over the append-only job store.
#[derive(Clone)]
pub struct JobManager {
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    config: JobManagerConfig,
    store_locks: Arc<StoreLocks>,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
        clock: Arc<dyn Clock>,
        config: JobManagerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            config,
            store_locks: Arc::new(StoreLocks::default()),
        }
    }

    pub fn with_store(store: Arc<dyn JobStore>, config: JobManagerConfig) -> Self {
        Self::new(
            store,
            Arc::new(JobRegistry::new()),
            Arc::new(SystemClock),
            config,
        )
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub async fn create_job(
        &self,
        store_url: &str,
        dataset_name: &str,
        job_type: JobType,
        created_by: Option<&str>,
    ) -> JobResult<String> {
        if store_url.is_empty() || dataset_name.is_empty() {
            return Err(JobError::Validation(
                "store_url and dataset_name are required".to_string(),
            ));
        }
        if job_type == JobType::StatusUpdate {
            return Err(JobError::Validation(
                "a job cannot be created as a status_update".to_string(),
            ));
        }

        let job_id = Uuid::new_v4().to_string();
        self.store
            .append_event(JobEvent {
                job_id: job_id.clone(),
                store_url: store_url.to_string(),
                dataset_name: dataset_name.to_string(),
                job_type,
                status: JobStatus::Pending,
                started_at: self.clock.now(),
                completed_at: None,
                error_message: None,
                records_processed: None,
                duration_seconds: None,
                created_by: Some(created_by.unwrap_or("system").to_string()),
            })
            .await?;

        tracing::info!(job_id = %job_id, store_url, dataset_name, "job created");
        Ok(job_id)
    }

    /// Create a job unless the store already has an active one; `None` when
    /// skipped. Callers sharing this manager are serialized per store, other
    /// processes writing the same database are not.
    pub async fn create_job_if_idle(
        &self,
        store_url: &str,
        dataset_name: &str,
        job_type: JobType,
        created_by: Option<&str>,
    ) -> JobResult<Option<String>> {
        let lock = self.store_locks.for_store(store_url);
        let _guard = lock.lock().await;
        if self.has_active_job_for_store(store_url).await? {
            return Ok(None);
        }
        self.create_job(store_url, dataset_name, job_type, created_by)
            .await
            .map(Some)
    }

    pub async fn has_active_job_for_store(&self, store_url: &str) -> JobResult<bool> {
        Ok(self
            .get_active_jobs()
            .await?
            .iter()
            .any(|job| job.store_url == store_url))
    }

    async fn lookup(&self, job_id: &str) -> JobResult<JobAggregate> {
        let events = self.store.job_events(job_id).await?;
        Ok(fold_job(job_id, &events))
    }

    pub async fn current_status(&self, job_id: &str) -> JobResult<Option<JobStatus>> {
        Ok(self.lookup(job_id).await?.current_status())
    }

    /// Append a `status_update` event. Jobs that already reached a terminal
    /// status are left alone.
    pub async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error_message: Option<String>,
        records_processed: Option<i64>,
    ) -> JobResult<StatusUpdate> {
        let now = self.clock.now();

        let origin = match self.lookup(job_id).await {
            Ok(aggregate) => aggregate.origin().cloned(),
            Err(e) => {
                tracing::warn!(job_id, error = %e, "could not load origin job record");
                None
            }
        };

        let (store_url, dataset_name, duration_seconds) = match &origin {
            Some(o) => (
                o.store_url.clone(),
                o.dataset_name.clone(),
                status
                    .records_duration()
                    .then(|| (now - o.started_at).num_seconds()),
            ),
            None => (String::new(), String::new(), None),
        };

        let event = JobEvent {
            job_id: job_id.to_string(),
            store_url,
            dataset_name,
            job_type: JobType::StatusUpdate,
            status,
            started_at: now,
            completed_at: status.records_duration().then_some(now),
            error_message,
            records_processed,
            duration_seconds,
            created_by: Some("system".to_string()),
        };

        match self.store.append_event_if_open(event).await? {
            AppendOutcome::Appended => {
                tracing::info!(job_id, status = %status, "job status updated");
                Ok(StatusUpdate::Applied)
            }
            AppendOutcome::Rejected(current) => {
                tracing::info!(
                    job_id,
                    requested = %status,
                    current = %current,
                    "status update ignored, job already terminal"
                );
                Ok(StatusUpdate::AlreadyTerminal(current))
            }
        }
    }

    pub async fn log_message(
        &self,
        job_id: &str,
        level: LogLevel,
        message: &str,
        store_url: Option<&str>,
        component: Option<Component>,
    ) -> JobResult<()> {
        self.store
            .append_log(LogLine {
                log_id: Uuid::new_v4().to_string(),
                job_id: job_id.to_string(),
                timestamp: self.clock.now(),
                log_level: level,
                message: truncate_message(message, self.config.max_log_chars),
                store_url: store_url.map(str::to_string),
                component: component.map(|c| c.as_str().to_string()),
            })
            .await
    }

    pub async fn get_active_jobs(&self) -> JobResult<Vec<ActiveJob>> {
        let now = self.clock.now();
        let cutoff = window_start(now, self.config.active_window);
        let events = self
            .store
            .scoped_events(JobScope::StartedSince(cutoff))
            .await?;
        Ok(active_jobs(&fold_all(&events), now, self.config.active_window))
    }

    pub async fn get_recent_jobs(&self, limit: usize) -> JobResult<Vec<RecentJob>> {
        let aggregates = fold_all(&self.store.scoped_events(JobScope::Newest(limit)).await?);
        let job_ids: Vec<String> = aggregates.iter().map(|a| a.job_id().to_string()).collect();
        let error_counts = self.store.error_counts(&job_ids).await?;
        Ok(recent_jobs(&aggregates, &error_counts, limit))
    }

    pub async fn get_job_logs(&self, job_id: &str, limit: usize) -> JobResult<Vec<LogLine>> {
        self.store.job_logs(job_id, None, limit).await
    }

    pub async fn get_job_error_summary(&self, job_id: &str) -> JobResult<ErrorSummary> {
        let counts = self.store.level_counts(job_id).await?;
        let recent = self
            .store
            .job_logs(job_id, Some(&[LogLevel::Error, LogLevel::Warning]), 10)
            .await?;
        Ok(ErrorSummary {
            error_count: counts.get(&LogLevel::Error).copied().unwrap_or(0),
            warning_count: counts.get(&LogLevel::Warning).copied().unwrap_or(0),
            recent,
        })
    }

    /// Every event recorded for the job, newest first.
    pub async fn job_history(&self, job_id: &str) -> JobResult<Vec<JobEvent>> {
        let mut events = self.store.job_events(job_id).await?;
        events.sort_by_key(|e| std::cmp::Reverse((e.event.started_at, e.seq)));
        Ok(events.into_iter().map(|e| e.event).collect())
    }

    /// Record a cancellation and signal the live work if this process owns it.
    ///
    /// Returns whether the `cancelled` event was written. Stopping the work is
    /// best effort: without a registry entry the job keeps running elsewhere.
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        let origin = match self.lookup(job_id).await {
            Ok(aggregate) => aggregate.origin().cloned(),
            Err(e) => {
                tracing::warn!(job_id, error = %e, "could not load job before cancel");
                None
            }
        };
        let (store_url, dataset_name) = origin
            .map(|o| (o.store_url, o.dataset_name))
            .unwrap_or_else(|| ("unknown".to_string(), "unknown".to_string()));

        let now = self.clock.now();
        let event = JobEvent {
            job_id: job_id.to_string(),
            store_url: store_url.clone(),
            dataset_name,
            job_type: JobType::StatusUpdate,
            status: JobStatus::Cancelled,
            started_at: now,
            completed_at: Some(now),
            error_message: Some("Cancelled by user".to_string()),
            records_processed: None,
            duration_seconds: None,
            created_by: Some("user_cancel".to_string()),
        };

        match self.store.append_event_if_open(event).await {
            Ok(AppendOutcome::Appended) => {}
            Ok(AppendOutcome::Rejected(current)) => {
                tracing::info!(job_id, current = %current, "cancel ignored, job already terminal");
                return false;
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "failed to record cancellation");
                return false;
            }
        }

        if let Err(e) = self
            .log_message(
                job_id,
                LogLevel::Warning,
                "Job cancelled by user",
                Some(&store_url),
                Some(Component::Main),
            )
            .await
        {
            tracing::error!(job_id, error = %e, "failed to log cancellation");
        }

        let signalled = self.registry.cancel(job_id);
        tracing::info!(job_id, signalled, "job cancelled");
        true
    }

    /// Fail every job still `pending` whose origin is older than `hours`.
    /// Returns `(cleaned, total_stuck)`.
    pub async fn force_clean_stuck_jobs(&self, hours: i64) -> JobResult<(usize, usize)> {
        if hours <= 0 {
            return Err(JobError::Validation("hours must be positive".to_string()));
        }
        let older_than = Duration::try_hours(hours)
            .ok_or_else(|| JobError::Validation(format!("hours out of range: {hours}")))?;
        let now = self.clock.now();
        let events = self
            .store
            .scoped_events(JobScope::OpenStartedBefore(window_start(now, older_than)))
            .await?;
        let stuck = stuck_jobs(&fold_all(&events), now, older_than);

        let mut cleaned = 0;
        for job in &stuck {
            let event = JobEvent {
                job_id: job.job_id.clone(),
                store_url: job.store_url.clone(),
                dataset_name: job.dataset_name.clone(),
                job_type: JobType::StatusUpdate,
                status: JobStatus::Failed,
                started_at: now,
                completed_at: Some(now),
                error_message: Some(format!("Job timeout - stuck for over {hours} hours")),
                records_processed: None,
                duration_seconds: Some((now - job.started_at).num_seconds()),
                created_by: Some("system_cleanup".to_string()),
            };
            match self.store.append_event_if_open(event).await {
                Ok(AppendOutcome::Appended) => {
                    cleaned += 1;
                    tracing::info!(job_id = %job.job_id, "cleaned stuck job");
                }
                Ok(AppendOutcome::Rejected(_)) => {}
                Err(e) => {
                    tracing::error!(job_id = %job.job_id, error = %e, "failed to clean stuck job");
                }
            }
        }
        Ok((cleaned, stuck.len()))
    }

    /// Delete every job whose current status is terminal, with its log lines.
    pub async fn clear_finished_jobs(&self) -> JobResult<usize> {
        let events = self.store.scoped_events(JobScope::Terminal).await?;
        let finished = finished_job_ids(&fold_all(&events));
        if finished.is_empty() {
            return Ok(0);
        }
        self.store.delete_jobs(&finished).await?;
        tracing::info!(count = finished.len(), "cleared finished jobs");
        Ok(finished.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::clock::ManualClock;
    use crate::jobs::store::MemoryJobStore;
    use crate::schema::StoredJobEvent;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    fn setup() -> (JobManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        ));
        let manager = JobManager::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(JobRegistry::new()),
            clock.clone(),
            JobManagerConfig::default(),
        );
        (manager, clock)
    }

    async fn create(manager: &JobManager, store: &str) -> String {
        manager
            .create_job(store, "shopify_ds", JobType::HistoricalLoad, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_requires_target() {
        let (manager, _) = setup();
        let err = manager
            .create_job("", "ds", JobType::HistoricalLoad, None)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[tokio::test]
    async fn recent_jobs_report_status_and_error_count() {
        let (manager, clock) = setup();
        let job = create(&manager, "x.myshopify.com").await;
        clock.advance(Duration::seconds(5));
        manager
            .update_job_status(&job, JobStatus::Running, None, None)
            .await
            .unwrap();
        for (level, msg) in [
            (LogLevel::Error, "boom"),
            (LogLevel::Info, "page 1"),
            (LogLevel::Info, "page 2"),
        ] {
            manager
                .log_message(&job, level, msg, Some("x.myshopify.com"), None)
                .await
                .unwrap();
        }

        let recent = manager.get_recent_jobs(20).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].job_id, job);
        assert_eq!(recent[0].status, JobStatus::Running);
        assert_eq!(recent[0].error_count, 1);
    }

    #[tokio::test]
    async fn active_jobs_exclude_abandoned_pending_jobs() {
        let (manager, clock) = setup();
        let job = create(&manager, "b.myshopify.com").await;
        assert_eq!(manager.get_active_jobs().await.unwrap().len(), 1);

        clock.advance(Duration::hours(25));
        let active = manager.get_active_jobs().await.unwrap();
        assert!(active.iter().all(|j| j.job_id != job));
        assert_eq!(manager.current_status(&job).await.unwrap(), Some(JobStatus::Pending));
    }

    #[tokio::test]
    async fn active_jobs_never_include_terminal_jobs() {
        let (manager, clock) = setup();
        let mut ids = Vec::new();
        for (i, status) in [
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Running,
        ]
        .into_iter()
        .enumerate()
        {
            let job = create(&manager, &format!("s{i}.myshopify.com")).await;
            clock.advance(Duration::seconds(1));
            manager.update_job_status(&job, status, None, None).await.unwrap();
            ids.push(job);
        }
        assert!(manager.cancel_job(&ids[2]).await);

        assert!(manager.get_active_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duration_runs_from_origin_start() {
        let (manager, clock) = setup();
        let job = create(&manager, "c.myshopify.com").await;
        clock.advance(Duration::minutes(10));
        manager
            .update_job_status(&job, JobStatus::Running, None, None)
            .await
            .unwrap();
        clock.advance(Duration::minutes(50));
        manager
            .update_job_status(&job, JobStatus::Completed, None, Some(500))
            .await
            .unwrap();

        let recent = manager.get_recent_jobs(5).await.unwrap();
        assert_eq!(recent[0].status, JobStatus::Completed);
        assert_eq!(recent[0].records_processed, Some(500));
        assert_eq!(recent[0].duration_seconds, Some(3600));
        assert_eq!(recent[0].completed_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn repeated_running_updates_keep_origin() {
        let (manager, clock) = setup();
        let job = create(&manager, "x.myshopify.com").await;
        let started = clock.now();
        for _ in 0..2 {
            clock.advance(Duration::seconds(1));
            let outcome = manager
                .update_job_status(&job, JobStatus::Running, None, None)
                .await
                .unwrap();
            assert_eq!(outcome, StatusUpdate::Applied);
        }

        let active = manager.get_active_jobs().await.unwrap();
        assert_eq!(active[0].status, JobStatus::Running);
        assert_eq!(active[0].store_url, "x.myshopify.com");
        assert_eq!(active[0].dataset_name, "shopify_ds");
        assert_eq!(active[0].started_at, started);
    }

    #[tokio::test]
    async fn terminal_status_is_locked() {
        let (manager, clock) = setup();
        let job = create(&manager, "x.myshopify.com").await;
        clock.advance(Duration::seconds(1));
        manager
            .update_job_status(&job, JobStatus::Completed, None, Some(10))
            .await
            .unwrap();
        clock.advance(Duration::seconds(1));

        assert!(!manager.cancel_job(&job).await);
        let outcome = manager
            .update_job_status(&job, JobStatus::Failed, Some("late".into()), None)
            .await
            .unwrap();
        assert_eq!(outcome, StatusUpdate::AlreadyTerminal(JobStatus::Completed));
        assert_eq!(
            manager.current_status(&job).await.unwrap(),
            Some(JobStatus::Completed)
        );
        assert_eq!(manager.job_history(&job).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cancel_records_event_and_warning() {
        let (manager, clock) = setup();
        let job = create(&manager, "x.myshopify.com").await;
        let handle = manager.registry().register(&job);
        clock.advance(Duration::seconds(1));

        assert!(manager.cancel_job(&job).await);
        tokio::time::timeout(std::time::Duration::from_secs(1), handle.cancelled())
            .await
            .unwrap();

        let history = manager.job_history(&job).await.unwrap();
        assert_eq!(history[0].status, JobStatus::Cancelled);
        assert_eq!(history[0].error_message.as_deref(), Some("Cancelled by user"));
        assert_eq!(history[0].created_by.as_deref(), Some("user_cancel"));
        assert_eq!(history[0].store_url, "x.myshopify.com");

        let logs = manager.get_job_logs(&job, 10).await.unwrap();
        assert_eq!(logs[0].log_level, LogLevel::Warning);
    }

    #[tokio::test]
    async fn cancel_unknown_job_uses_placeholders() {
        let (manager, _) = setup();
        assert!(manager.cancel_job("nope").await);
        let history = manager.job_history("nope").await.unwrap();
        assert_eq!(history[0].store_url, "unknown");
    }

    #[tokio::test]
    async fn clean_stuck_only_touches_old_pending_jobs() {
        let (manager, clock) = setup();
        let old_pending = create(&manager, "a.myshopify.com").await;
        let old_running = create(&manager, "b.myshopify.com").await;
        manager
            .update_job_status(&old_running, JobStatus::Running, None, None)
            .await
            .unwrap();
        clock.advance(Duration::minutes(150));
        let young_pending = create(&manager, "c.myshopify.com").await;
        clock.advance(Duration::minutes(30));

        let (cleaned, total) = manager.force_clean_stuck_jobs(1).await.unwrap();
        assert_eq!((cleaned, total), (1, 1));
        assert_eq!(
            manager.current_status(&old_pending).await.unwrap(),
            Some(JobStatus::Failed)
        );
        assert_eq!(
            manager.current_status(&old_running).await.unwrap(),
            Some(JobStatus::Running)
        );
        assert_eq!(
            manager.current_status(&young_pending).await.unwrap(),
            Some(JobStatus::Pending)
        );

        let history = manager.job_history(&old_pending).await.unwrap();
        assert_eq!(history[0].created_by.as_deref(), Some("system_cleanup"));
        assert_eq!(
            history[0].error_message.as_deref(),
            Some("Job timeout - stuck for over 1 hours")
        );
    }

    #[tokio::test]
    async fn clean_stuck_rejects_non_positive_and_out_of_range_hours() {
        let (manager, _) = setup();
        let job = create(&manager, "a.myshopify.com").await;

        for hours in [0, -1, 10_000_000_000_000] {
            let err = manager.force_clean_stuck_jobs(hours).await.unwrap_err();
            assert!(matches!(err, JobError::Validation(_)), "hours={hours}");
        }
        assert_eq!(
            manager.current_status(&job).await.unwrap(),
            Some(JobStatus::Pending)
        );

        // representable, but older than any instant
        assert_eq!(
            manager.force_clean_stuck_jobs(1_000_000_000_000).await.unwrap(),
            (0, 0)
        );
    }

    #[tokio::test]
    async fn recent_jobs_only_count_errors_of_listed_jobs() {
        let (manager, clock) = setup();
        let old = create(&manager, "a.myshopify.com").await;
        manager
            .log_message(&old, LogLevel::Error, "old failure", None, None)
            .await
            .unwrap();
        clock.advance(Duration::seconds(1));
        let new = create(&manager, "b.myshopify.com").await;

        let recent = manager.get_recent_jobs(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].job_id, new);
        assert_eq!(recent[0].error_count, 0);
    }

    #[tokio::test]
    async fn long_messages_are_truncated_not_rejected() {
        let (manager, _) = setup();
        let job = create(&manager, "x.myshopify.com").await;
        let message = "a".repeat(2500);
        manager
            .log_message(&job, LogLevel::Info, &message, None, Some(Component::Orders))
            .await
            .unwrap();
        let logs = manager.get_job_logs(&job, 1).await.unwrap();
        assert_eq!(logs[0].message.chars().count(), 1000);
        assert_eq!(logs[0].component.as_deref(), Some("orders"));
    }

    #[tokio::test]
    async fn has_active_job_for_store_follows_status() {
        let (manager, clock) = setup();
        let job = create(&manager, "x.myshopify.com").await;
        assert!(manager.has_active_job_for_store("x.myshopify.com").await.unwrap());
        assert!(!manager.has_active_job_for_store("y.myshopify.com").await.unwrap());

        clock.advance(Duration::seconds(1));
        manager
            .update_job_status(&job, JobStatus::Failed, Some("boom".into()), None)
            .await
            .unwrap();
        assert!(!manager.has_active_job_for_store("x.myshopify.com").await.unwrap());
    }

    #[tokio::test]
    async fn clear_finished_removes_terminal_jobs_and_logs() {
        let (manager, clock) = setup();
        let done = create(&manager, "a.myshopify.com").await;
        let live = create(&manager, "b.myshopify.com").await;
        manager
            .log_message(&done, LogLevel::Error, "bad", None, None)
            .await
            .unwrap();
        clock.advance(Duration::seconds(1));
        manager
            .update_job_status(&done, JobStatus::Completed, None, None)
            .await
            .unwrap();

        assert_eq!(manager.clear_finished_jobs().await.unwrap(), 1);
        assert!(manager.job_history(&done).await.unwrap().is_empty());
        assert!(manager.get_job_logs(&done, 10).await.unwrap().is_empty());
        assert_eq!(manager.job_history(&live).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn error_summary_counts_levels() {
        let (manager, _) = setup();
        let job = create(&manager, "x.myshopify.com").await;
        for level in [LogLevel::Error, LogLevel::Warning, LogLevel::Warning, LogLevel::Info] {
            manager.log_message(&job, level, "m", None, None).await.unwrap();
        }
        let summary = manager.get_job_error_summary(&job).await.unwrap();
        assert_eq!(summary.error_count, 1);
        assert_eq!(summary.warning_count, 2);
        assert_eq!(summary.recent.len(), 3);
    }

    struct UnreadableStore(MemoryJobStore);

    #[async_trait::async_trait]
    impl JobStore for UnreadableStore {
        async fn append_event(&self, event: JobEvent) -> JobResult<()> {
            self.0.append_event(event).await
        }
        async fn append_event_if_open(&self, event: JobEvent) -> JobResult<AppendOutcome> {
            self.0.append_event_if_open(event).await
        }
        async fn job_events(&self, _job_id: &str) -> JobResult<Vec<StoredJobEvent>> {
            Err(JobError::Unavailable("read timeout".into()))
        }
        async fn scoped_events(&self, scope: JobScope) -> JobResult<Vec<StoredJobEvent>> {
            self.0.scoped_events(scope).await
        }
        async fn append_log(&self, line: LogLine) -> JobResult<()> {
            self.0.append_log(line).await
        }
        async fn job_logs(
            &self,
            job_id: &str,
            levels: Option<&[LogLevel]>,
            limit: usize,
        ) -> JobResult<Vec<LogLine>> {
            self.0.job_logs(job_id, levels, limit).await
        }
        async fn level_counts(&self, job_id: &str) -> JobResult<HashMap<LogLevel, i64>> {
            self.0.level_counts(job_id).await
        }
        async fn error_counts(&self, job_ids: &[String]) -> JobResult<HashMap<String, i64>> {
            self.0.error_counts(job_ids).await
        }
        async fn delete_jobs(&self, job_ids: &[String]) -> JobResult<u64> {
            self.0.delete_jobs(job_ids).await
        }
        async fn ping(&self) -> JobResult<()> {
            Ok(())
        }
    }

    /// Reads that take a while, so concurrent callers overlap.
    struct SlowReads(MemoryJobStore);

    #[async_trait::async_trait]
    impl JobStore for SlowReads {
        async fn append_event(&self, event: JobEvent) -> JobResult<()> {
            self.0.append_event(event).await
        }
        async fn append_event_if_open(&self, event: JobEvent) -> JobResult<AppendOutcome> {
            self.0.append_event_if_open(event).await
        }
        async fn job_events(&self, job_id: &str) -> JobResult<Vec<StoredJobEvent>> {
            self.0.job_events(job_id).await
        }
        async fn scoped_events(&self, scope: JobScope) -> JobResult<Vec<StoredJobEvent>> {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.0.scoped_events(scope).await
        }
        async fn append_log(&self, line: LogLine) -> JobResult<()> {
            self.0.append_log(line).await
        }
        async fn job_logs(
            &self,
            job_id: &str,
            levels: Option<&[LogLevel]>,
            limit: usize,
        ) -> JobResult<Vec<LogLine>> {
            self.0.job_logs(job_id, levels, limit).await
        }
        async fn level_counts(&self, job_id: &str) -> JobResult<HashMap<LogLevel, i64>> {
            self.0.level_counts(job_id).await
        }
        async fn error_counts(&self, job_ids: &[String]) -> JobResult<HashMap<String, i64>> {
            self.0.error_counts(job_ids).await
        }
        async fn delete_jobs(&self, job_ids: &[String]) -> JobResult<u64> {
            self.0.delete_jobs(job_ids).await
        }
        async fn ping(&self) -> JobResult<()> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_for_one_store_create_one_job() {
        let store = Arc::new(SlowReads(MemoryJobStore::new()));
        let manager = JobManager::with_store(store.clone(), JobManagerConfig::default());

        let tasks: Vec<_> = (0..6)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .create_job_if_idle(
                            "x.myshopify.com",
                            "shopify_ds",
                            JobType::HistoricalLoad,
                            Some(if i % 2 == 0 { "user" } else { "scheduler" }),
                        )
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut created = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.0.events().len(), 1);

        // other stores are not blocked
        assert!(
            manager
                .create_job_if_idle("y.myshopify.com", "shopify_ds", JobType::HistoricalLoad, None)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn update_degrades_when_origin_lookup_fails() {
        let store = Arc::new(UnreadableStore(MemoryJobStore::new()));
        let manager = JobManager::with_store(store.clone(), JobManagerConfig::default());
        let job = create(&manager, "x.myshopify.com").await;

        let outcome = manager
            .update_job_status(&job, JobStatus::Running, None, None)
            .await
            .unwrap();
        assert_eq!(outcome, StatusUpdate::Applied);

        let events = store.0.events();
        let update = &events.last().unwrap().event;
        assert_eq!(update.store_url, "");
        assert_eq!(update.status, JobStatus::Running);

        let recent = manager.get_recent_jobs(5).await.unwrap();
        assert_eq!(recent[0].store_url, "x.myshopify.com");
    }
}
