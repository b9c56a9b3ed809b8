//! Event-sourced view of a job.
//!
//! A job is never updated in place. Every transition is appended as a new
//! [`JobEvent`] and the current state is recovered by folding the events in
//! `(started_at, seq)` order:
//!
//! - the *origin* is the first event that is not a `status_update`; it owns
//!   `store_url`, `dataset_name` and the true start time;
//! - the *current* record is the newest event, except that the first terminal
//!   event locks the job and later events no longer move its status.

use crate::schema::{JobEvent, JobStatus, JobType, StoredJobEvent};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct JobAggregate {
    job_id: String,
    origin: Option<JobEvent>,
    latest: Option<JobEvent>,
    terminal: Option<JobEvent>,
}

/// Origin identity joined with the current status record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobState {
    pub job_id: String,
    pub store_url: String,
    pub dataset_name: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub records_processed: Option<i64>,
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveJob {
    pub job_id: String,
    pub store_url: String,
    pub dataset_name: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub running_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentJob {
    pub job_id: String,
    pub store_url: String,
    pub dataset_name: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub duration_seconds: Option<i64>,
    pub records_processed: Option<i64>,
    pub error_count: i64,
}

impl JobAggregate {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            origin: None,
            latest: None,
            terminal: None,
        }
    }

    /// Fold one event in. Callers must apply events in `(started_at, seq)` order.
    pub fn apply(&mut self, event: &JobEvent) {
        if self.origin.is_none() && !event.is_status_update() {
            self.origin = Some(event.clone());
        }
        if self.terminal.is_none() && event.status.is_terminal() {
            self.terminal = Some(event.clone());
        }
        self.latest = Some(event.clone());
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn origin(&self) -> Option<&JobEvent> {
        self.origin.as_ref()
    }

    /// The record that decides the job's status.
    pub fn current(&self) -> Option<&JobEvent> {
        self.terminal.as_ref().or(self.latest.as_ref())
    }

    pub fn current_status(&self) -> Option<JobStatus> {
        self.current().map(|e| e.status)
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    /// Joined view, or `None` when the job has no usable origin record.
    pub fn current_state(&self) -> Option<JobState> {
        let origin = self.origin.as_ref()?;
        if origin.store_url.is_empty() || origin.dataset_name.is_empty() {
            return None;
        }
        let current = self.current()?;
        Some(JobState {
            job_id: self.job_id.clone(),
            store_url: origin.store_url.clone(),
            dataset_name: origin.dataset_name.clone(),
            job_type: origin.job_type,
            status: current.status,
            started_at: origin.started_at,
            completed_at: current.completed_at,
            error_message: current.error_message.clone(),
            records_processed: current.records_processed,
            duration_seconds: current.duration_seconds,
        })
    }
}

/// Fold a single job's events, in whatever order the store returned them.
pub fn fold_job(job_id: &str, events: &[StoredJobEvent]) -> JobAggregate {
    let mut sorted: Vec<&StoredJobEvent> = events.iter().collect();
    sorted.sort_by_key(|e| (e.event.started_at, e.seq));
    let mut aggregate = JobAggregate::new(job_id);
    for stored in sorted {
        aggregate.apply(&stored.event);
    }
    aggregate
}

/// Partition events by job id and fold every partition.
pub fn fold_all(events: &[StoredJobEvent]) -> Vec<JobAggregate> {
    let mut sorted: Vec<&StoredJobEvent> = events.iter().collect();
    sorted.sort_by_key(|e| (e.event.started_at, e.seq));

    let mut by_job: HashMap<&str, JobAggregate> = HashMap::new();
    for stored in sorted {
        by_job
            .entry(stored.event.job_id.as_str())
            .or_insert_with(|| JobAggregate::new(stored.event.job_id.clone()))
            .apply(&stored.event);
    }
    by_job.into_values().collect()
}

/// `now - window`, clamped to the earliest representable instant.
pub fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn newest_first(states: &mut [JobState]) {
    states.sort_by(|a, b| {
        b.started_at
            .cmp(&a.started_at)
            .then_with(|| a.job_id.cmp(&b.job_id))
    });
}

pub fn active_jobs(
    aggregates: &[JobAggregate],
    now: DateTime<Utc>,
    window: Duration,
) -> Vec<ActiveJob> {
    let cutoff = window_start(now, window);
    let mut states: Vec<JobState> = aggregates
        .iter()
        .filter_map(JobAggregate::current_state)
        .filter(|s| s.status.is_active() && !s.status.is_terminal())
        .filter(|s| s.started_at >= cutoff)
        .collect();
    newest_first(&mut states);

    states
        .into_iter()
        .map(|s| ActiveJob {
            running_seconds: (now - s.started_at).num_seconds(),
            job_id: s.job_id,
            store_url: s.store_url,
            dataset_name: s.dataset_name,
            job_type: s.job_type,
            status: s.status,
            started_at: s.started_at,
        })
        .collect()
}

pub fn recent_jobs(
    aggregates: &[JobAggregate],
    error_counts: &HashMap<String, i64>,
    limit: usize,
) -> Vec<RecentJob> {
    let mut states: Vec<JobState> = aggregates
        .iter()
        .filter_map(JobAggregate::current_state)
        .collect();
    newest_first(&mut states);

    states
        .into_iter()
        .take(limit)
        .map(|s| RecentJob {
            error_count: error_counts.get(&s.job_id).copied().unwrap_or(0),
            job_id: s.job_id,
            store_url: s.store_url,
            dataset_name: s.dataset_name,
            job_type: s.job_type,
            status: s.status,
            started_at: s.started_at,
            completed_at: s.completed_at,
            error_message: s.error_message,
            duration_seconds: s.duration_seconds,
            records_processed: s.records_processed,
        })
        .collect()
}

/// Jobs still `pending` whose origin is strictly older than `older_than`.
pub fn stuck_jobs(
    aggregates: &[JobAggregate],
    now: DateTime<Utc>,
    older_than: Duration,
) -> Vec<JobState> {
    let cutoff = window_start(now, older_than);
    let mut states: Vec<JobState> = aggregates
        .iter()
        .filter_map(JobAggregate::current_state)
        .filter(|s| s.status == JobStatus::Pending && s.started_at < cutoff)
        .collect();
    newest_first(&mut states);
    states
}

/// Job ids whose current status is terminal, including jobs without a usable origin.
pub fn finished_job_ids(aggregates: &[JobAggregate]) -> Vec<String> {
    aggregates
        .iter()
        .filter(|a| a.current_status().is_some_and(JobStatus::is_terminal))
        .map(|a| a.job_id().to_string())
        .collect()
}
