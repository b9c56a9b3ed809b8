use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Statuses that close out a run and get a duration attached.
    pub fn records_duration(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    HistoricalLoad,
    ScheduledLoad,
    StatusUpdate,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HistoricalLoad => "historical_load",
            Self::ScheduledLoad => "scheduled_load",
            Self::StatusUpdate => "status_update",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "historical_load" => Ok(Self::HistoricalLoad),
            "scheduled_load" => Ok(Self::ScheduledLoad),
            "status_update" => Ok(Self::StatusUpdate),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// One immutable row in the job event log.
///
/// `started_at` is the time this event was written, not the time the job
/// began; the original start lives on the job's origin event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
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
    pub created_by: Option<String>,
}

impl JobEvent {
    pub fn is_status_update(&self) -> bool {
        self.job_type == JobType::StatusUpdate
    }
}

/// A persisted event together with its insertion sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredJobEvent {
    pub seq: i64,
    pub event: JobEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn only_pending_and_running_are_active() {
        assert!(JobStatus::Pending.is_active());
        assert!(JobStatus::Running.is_active());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Cancelled.records_duration());
        assert!(JobStatus::Failed.records_duration());
    }

    #[test]
    fn job_type_serializes_snake_case() {
        let json = serde_json::to_string(&JobType::StatusUpdate).unwrap();
        assert_eq!(json, "\"status_update\"");
    }
}
