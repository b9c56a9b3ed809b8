use super::aggregate::{JobAggregate, fold_all, fold_job};
use super::error::JobResult;
use crate::schema::{JobEvent, JobStatus, LogLevel, LogLine, StoredJobEvent};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The job already carries a terminal event; nothing was written.
    Rejected(JobStatus),
}

/// Which jobs a bulk read covers. Stores return every event of the selected
/// jobs and may over-select; callers fold and filter again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobScope {
    /// Jobs whose origin started at or after the instant.
    StartedSince(DateTime<Utc>),
    /// Jobs whose origin started before the instant and that carry no terminal event.
    OpenStartedBefore(DateTime<Utc>),
    /// The `n` newest jobs with a usable origin, by origin start.
    Newest(usize),
    /// Jobs that carry a terminal event.
    Terminal,
}

fn origin_start(aggregate: &JobAggregate) -> Option<DateTime<Utc>> {
    aggregate.origin().map(|o| o.started_at)
}

impl JobScope {
    fn select(&self, aggregates: &[JobAggregate]) -> HashSet<String> {
        match *self {
            JobScope::StartedSince(cutoff) => aggregates
                .iter()
                .filter(|a| origin_start(a).is_some_and(|t| t >= cutoff))
                .map(|a| a.job_id().to_string())
                .collect(),
            JobScope::OpenStartedBefore(cutoff) => aggregates
                .iter()
                .filter(|a| !a.is_terminal() && origin_start(a).is_some_and(|t| t < cutoff))
                .map(|a| a.job_id().to_string())
                .collect(),
            JobScope::Newest(limit) => {
                let mut states: Vec<_> = aggregates
                    .iter()
                    .filter_map(JobAggregate::current_state)
                    .collect();
                states.sort_by(|a, b| {
                    b.started_at
                        .cmp(&a.started_at)
                        .then_with(|| a.job_id.cmp(&b.job_id))
                });
                states.into_iter().take(limit).map(|s| s.job_id).collect()
            }
            JobScope::Terminal => aggregates
                .iter()
                .filter(|a| a.is_terminal())
                .map(|a| a.job_id().to_string())
                .collect(),
        }
    }
}

/// Append-only persistence for job events and log lines.
///
/// Nothing is ever updated in place. The only destructive operation is
/// [`JobStore::delete_jobs`], used by the bulk clear of finished jobs.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    async fn append_event(&self, event: JobEvent) -> JobResult<()>;

    /// Compare-and-set append: writes `event` only while the job has no
    /// terminal event. Check and write are atomic with respect to other
    /// callers of this method.
    async fn append_event_if_open(&self, event: JobEvent) -> JobResult<AppendOutcome>;

    async fn job_events(&self, job_id: &str) -> JobResult<Vec<StoredJobEvent>>;

    /// Every event of the jobs in `scope`, in `(started_at, seq)` order.
    async fn scoped_events(&self, scope: JobScope) -> JobResult<Vec<StoredJobEvent>>;

    async fn append_log(&self, line: LogLine) -> JobResult<()>;

    /// Newest first. `levels = None` returns every level.
    async fn job_logs(
        &self,
        job_id: &str,
        levels: Option<&[LogLevel]>,
        limit: usize,
    ) -> JobResult<Vec<LogLine>>;

    async fn level_counts(&self, job_id: &str) -> JobResult<HashMap<LogLevel, i64>>;

    /// Number of ERROR lines per job id, for the given jobs only.
    async fn error_counts(&self, job_ids: &[String]) -> JobResult<HashMap<String, i64>>;

    /// Remove all events and log lines of the given jobs. Returns the number of events removed.
    async fn delete_jobs(&self, job_ids: &[String]) -> JobResult<u64>;

    async fn ping(&self) -> JobResult<()>;
}

#[derive(Default)]
struct MemoryInner {
    next_seq: i64,
    events: Vec<StoredJobEvent>,
    logs: Vec<(i64, LogLine)>,
}

impl MemoryInner {
    fn push_event(&mut self, event: JobEvent) {
        self.next_seq += 1;
        self.events.push(StoredJobEvent {
            seq: self.next_seq,
            event,
        });
    }
}

/// Process-local store. State is lost on restart and is not visible to a
/// pipeline subprocess, which is why the runner always settles the final
/// status itself.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn events(&self) -> Vec<StoredJobEvent> {
        self.inner.lock().unwrap().events.clone()
    }
}

#[async_trait::async_trait]
impl JobStore for MemoryJobStore {
    async fn append_event(&self, event: JobEvent) -> JobResult<()> {
        self.inner.lock().unwrap().push_event(event);
        Ok(())
    }

    async fn append_event_if_open(&self, event: JobEvent) -> JobResult<AppendOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let existing: Vec<StoredJobEvent> = inner
            .events
            .iter()
            .filter(|e| e.event.job_id == event.job_id)
            .cloned()
            .collect();
        let aggregate = fold_job(&event.job_id, &existing);
        if aggregate.is_terminal()
            && let Some(status) = aggregate.current_status()
        {
            return Ok(AppendOutcome::Rejected(status));
        }
        inner.push_event(event);
        Ok(AppendOutcome::Appended)
    }

    async fn job_events(&self, job_id: &str) -> JobResult<Vec<StoredJobEvent>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .events
            .iter()
            .filter(|e| e.event.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn scoped_events(&self, scope: JobScope) -> JobResult<Vec<StoredJobEvent>> {
        let inner = self.inner.lock().unwrap();
        let selected = scope.select(&fold_all(&inner.events));
        let mut events: Vec<StoredJobEvent> = inner
            .events
            .iter()
            .filter(|e| selected.contains(&e.event.job_id))
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.event.started_at, e.seq));
        Ok(events)
    }

    async fn append_log(&self, line: LogLine) -> JobResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.logs.push((seq, line));
        Ok(())
    }

    async fn job_logs(
        &self,
        job_id: &str,
        levels: Option<&[LogLevel]>,
        limit: usize,
    ) -> JobResult<Vec<LogLine>> {
        let inner = self.inner.lock().unwrap();
        let mut matching: Vec<&(i64, LogLine)> = inner
            .logs
            .iter()
            .filter(|(_, l)| l.job_id == job_id)
            .filter(|(_, l)| levels.is_none_or(|lv| lv.contains(&l.log_level)))
            .collect();
        matching.sort_by(|(sa, a), (sb, b)| b.timestamp.cmp(&a.timestamp).then(sb.cmp(sa)));
        Ok(matching
            .into_iter()
            .take(limit)
            .map(|(_, l)| l.clone())
            .collect())
    }

    async fn level_counts(&self, job_id: &str) -> JobResult<HashMap<LogLevel, i64>> {
        let inner = self.inner.lock().unwrap();
        let mut counts = HashMap::new();
        for (_, line) in inner.logs.iter().filter(|(_, l)| l.job_id == job_id) {
            *counts.entry(line.log_level).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn error_counts(&self, job_ids: &[String]) -> JobResult<HashMap<String, i64>> {
        let inner = self.inner.lock().unwrap();
        let mut counts = HashMap::new();
        for (_, line) in inner
            .logs
            .iter()
            .filter(|(_, l)| l.log_level == LogLevel::Error && job_ids.contains(&l.job_id))
        {
            *counts.entry(line.job_id.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn delete_jobs(&self, job_ids: &[String]) -> JobResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.events.len();
        inner.events.retain(|e| !job_ids.contains(&e.event.job_id));
        inner.logs.retain(|(_, l)| !job_ids.contains(&l.job_id));
        Ok((before - inner.events.len()) as u64)
    }

    async fn ping(&self) -> JobResult<()> {
        Ok(())
    }
}
