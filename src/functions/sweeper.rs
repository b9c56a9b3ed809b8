use super::start_load;
use crate::jobs::BackgroundRunner;
use crate::schema::JobType;
use crate::services::StoreRepository;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// the `cron` crate requires 6-field (second-granularity) expressions,
// so we prepend "0" to standard 5-field minute-granularity inputs
fn normalize_schedule(schedule: &str) -> String {
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    let normalized = fields.join(" ");
    if fields.len() == 5 {
        format!("0 {normalized}")
    } else {
        normalized
    }
}

/// Cron expression evaluated in a named timezone.
#[derive(Debug, Clone)]
pub struct SyncSchedule {
    schedule: cron::Schedule,
    timezone: chrono_tz::Tz,
}

impl SyncSchedule {
    pub fn parse(schedule: &str, timezone: &str) -> anyhow::Result<Self> {
        let timezone: chrono_tz::Tz = timezone
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid timezone: {timezone}"))?;
        let normalized = normalize_schedule(schedule);
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| anyhow::anyhow!("invalid cron expression `{normalized}`: {e}"))?;
        Ok(Self { schedule, timezone })
    }

    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let from_local = from.with_timezone(&self.timezone);
        self.schedule
            .after(&from_local)
            .next()
            .map(|next| next.with_timezone(&Utc))
    }
}

/// Periodic maintenance: fails stuck jobs and starts scheduled loads.
pub struct Sweeper {
    runner: BackgroundRunner,
    stores: Arc<dyn StoreRepository>,
    stuck_job_hours: i64,
    interval: Duration,
    schedule: Option<SyncSchedule>,
    next_sync: Option<DateTime<Utc>>,
}

impl Sweeper {
    pub fn new(
        runner: BackgroundRunner,
        stores: Arc<dyn StoreRepository>,
        stuck_job_hours: i64,
        interval: Duration,
        schedule: Option<SyncSchedule>,
    ) -> Self {
        let next_sync = schedule.as_ref().and_then(|s| s.next_after(Utc::now()));
        Self {
            runner,
            stores,
            stuck_job_hours,
            interval,
            schedule,
            next_sync,
        }
    }

    pub fn next_sync(&self) -> Option<DateTime<Utc>> {
        self.next_sync
    }

    pub async fn sweep_stuck(&self) -> usize {
        match self
            .runner
            .manager()
            .force_clean_stuck_jobs(self.stuck_job_hours)
            .await
        {
            Ok((cleaned, total)) => {
                if total > 0 {
                    tracing::info!(cleaned, total, "sweeper: failed stuck jobs");
                }
                cleaned
            }
            Err(e) => {
                tracing::error!(error = %e, "sweeper: stuck job cleanup failed");
                0
            }
        }
    }

    /// Start a `scheduled_load` for every active store without an active job.
    pub async fn start_scheduled_loads(&self) -> usize {
        let stores = match self.stores.list(true).await {
            Ok(stores) => stores,
            Err(e) => {
                tracing::error!(error = %e, "sweeper: could not list stores");
                return 0;
            }
        };
        let mut started = 0;
        for store in stores {
            let merchant = store.merchant.clone();
            match start_load(&self.runner, store, JobType::ScheduledLoad, "scheduler").await {
                Ok(Some(_)) => started += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(store = %merchant, error = %e, "sweeper: scheduled load failed to start");
                }
            }
        }
        started
    }

    pub async fn tick(&mut self, now: DateTime<Utc>) {
        self.sweep_stuck().await;
        let Some(due) = self.next_sync else {
            return;
        };
        if now < due {
            return;
        }
        let started = self.start_scheduled_loads().await;
        tracing::info!(started, "sweeper: scheduled sync fired");
        self.next_sync = self.schedule.as_ref().and_then(|s| s.next_after(now));
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            next_sync = ?self.next_sync,
            "sweeper: started"
        );
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.interval) => {
                    self.tick(Utc::now()).await;
                }
            }
        }
        tracing::info!("sweeper: stopped");
    }
}
