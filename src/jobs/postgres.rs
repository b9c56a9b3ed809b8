use super::aggregate::fold_job;
use super::error::{JobError, JobResult};
use super::store::{AppendOutcome, JobScope, JobStore};
use crate::schema::{JobEvent, LogLevel, LogLine, StoredJobEvent};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;

const ALL_LEVELS: [LogLevel; 3] = [LogLevel::Info, LogLevel::Warning, LogLevel::Error];

#[derive(sqlx::FromRow)]
struct JobEventRow {
    seq: i64,
    job_id: String,
    store_url: String,
    dataset_name: String,
    job_type: String,
    status: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    records_processed: Option<i64>,
    duration_seconds: Option<i64>,
    created_by: Option<String>,
}

impl TryFrom<JobEventRow> for StoredJobEvent {
    type Error = JobError;

    fn try_from(row: JobEventRow) -> Result<Self, Self::Error> {
        Ok(StoredJobEvent {
            seq: row.seq,
            event: JobEvent {
                job_type: row.job_type.parse().map_err(JobError::Corrupt)?,
                status: row.status.parse().map_err(JobError::Corrupt)?,
                job_id: row.job_id,
                store_url: row.store_url,
                dataset_name: row.dataset_name,
                started_at: row.started_at,
                completed_at: row.completed_at,
                error_message: row.error_message,
                records_processed: row.records_processed,
                duration_seconds: row.duration_seconds,
                created_by: row.created_by,
            },
        })
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    log_id: String,
    job_id: String,
    timestamp: DateTime<Utc>,
    log_level: String,
    message: String,
    store_url: Option<String>,
    component: Option<String>,
}

impl TryFrom<LogRow> for LogLine {
    type Error = JobError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        Ok(LogLine {
            log_level: row.log_level.parse().map_err(JobError::Corrupt)?,
            log_id: row.log_id,
            job_id: row.job_id,
            timestamp: row.timestamp,
            message: row.message,
            store_url: row.store_url,
            component: row.component,
        })
    }
}

const EVENT_COLUMNS: &str = "seq, job_id, store_url, dataset_name, job_type, status, started_at, \
     completed_at, error_message, records_processed, duration_seconds, created_by";

fn rows_to_events(rows: Vec<JobEventRow>) -> JobResult<Vec<StoredJobEvent>> {
    rows.into_iter().map(StoredJobEvent::try_from).collect()
}

/// Postgres-backed event log over `pipeline_jobs` / `pipeline_logs`.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> JobResult<Self> {
        let pool = PgPool::connect(database_url).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| JobError::Unavailable(format!("migration failed: {e}")))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn insert_event<'e, E>(exe: E, event: &JobEvent) -> JobResult<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO pipeline_jobs
            (job_id, store_url, dataset_name, job_type, status, started_at,
             completed_at, error_message, records_processed, duration_seconds, created_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(&event.job_id)
    .bind(&event.store_url)
    .bind(&event.dataset_name)
    .bind(event.job_type.as_str())
    .bind(event.status.as_str())
    .bind(event.started_at)
    .bind(event.completed_at)
    .bind(&event.error_message)
    .bind(event.records_processed)
    .bind(event.duration_seconds)
    .bind(&event.created_by)
    .execute(exe)
    .await?;
    Ok(())
}

#[async_trait::async_trait]
impl JobStore for PgJobStore {
    async fn append_event(&self, event: JobEvent) -> JobResult<()> {
        insert_event(&self.pool, &event).await
    }

    async fn append_event_if_open(&self, event: JobEvent) -> JobResult<AppendOutcome> {
        let mut tx = self.pool.begin().await?;

        // serializes writers per job for the rest of the transaction
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&event.job_id)
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query_as::<_, JobEventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM pipeline_jobs WHERE job_id = $1"
        ))
        .bind(&event.job_id)
        .fetch_all(&mut *tx)
        .await?;
        let aggregate = fold_job(&event.job_id, &rows_to_events(rows)?);

        if aggregate.is_terminal()
            && let Some(status) = aggregate.current_status()
        {
            tx.rollback().await?;
            return Ok(AppendOutcome::Rejected(status));
        }

        insert_event(&mut *tx, &event).await?;
        tx.commit().await?;
        Ok(AppendOutcome::Appended)
    }

    async fn job_events(&self, job_id: &str) -> JobResult<Vec<StoredJobEvent>> {
        let rows = sqlx::query_as::<_, JobEventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM pipeline_jobs WHERE job_id = $1 ORDER BY started_at, seq"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows_to_events(rows)
    }

    async fn scoped_events(&self, scope: JobScope) -> JobResult<Vec<StoredJobEvent>> {
        // any non-status_update row counts as an origin here; the fold picks the real one
        let selection = match scope {
            JobScope::StartedSince(_) => {
                "SELECT job_id FROM pipeline_jobs \
                 WHERE job_type <> 'status_update' AND started_at >= $1"
            }
            JobScope::OpenStartedBefore(_) => {
                "SELECT job_id FROM pipeline_jobs \
                 WHERE job_type <> 'status_update' AND started_at < $1 \
                 AND job_id NOT IN (SELECT job_id FROM pipeline_jobs \
                     WHERE status IN ('completed', 'failed', 'cancelled'))"
            }
            JobScope::Newest(_) => {
                "SELECT job_id FROM ( \
                     SELECT DISTINCT ON (job_id) job_id, started_at, store_url, dataset_name \
                     FROM pipeline_jobs WHERE job_type <> 'status_update' \
                     ORDER BY job_id, started_at, seq \
                 ) origins \
                 WHERE store_url <> '' AND dataset_name <> '' \
                 ORDER BY started_at DESC, job_id \
                 LIMIT $1"
            }
            JobScope::Terminal => {
                "SELECT job_id FROM pipeline_jobs \
                 WHERE status IN ('completed', 'failed', 'cancelled')"
            }
        };
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM pipeline_jobs \
             WHERE job_id IN ({selection}) ORDER BY started_at, seq"
        );

        let query = sqlx::query_as::<_, JobEventRow>(&sql);
        let query = match scope {
            JobScope::StartedSince(cutoff) | JobScope::OpenStartedBefore(cutoff) => {
                query.bind(cutoff)
            }
            JobScope::Newest(limit) => query.bind(limit as i64),
            JobScope::Terminal => query,
        };
        rows_to_events(query.fetch_all(&self.pool).await?)
    }

    async fn append_log(&self, line: LogLine) -> JobResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_logs
                (log_id, job_id, timestamp, log_level, message, store_url, component)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&line.log_id)
        .bind(&line.job_id)
        .bind(line.timestamp)
        .bind(line.log_level.as_str())
        .bind(&line.message)
        .bind(&line.store_url)
        .bind(&line.component)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job_logs(
        &self,
        job_id: &str,
        levels: Option<&[LogLevel]>,
        limit: usize,
    ) -> JobResult<Vec<LogLine>> {
        let levels: Vec<String> = levels
            .unwrap_or(&ALL_LEVELS)
            .iter()
            .map(|l| l.as_str().to_string())
            .collect();

        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT log_id, job_id, timestamp, log_level, message, store_url, component
            FROM pipeline_logs
            WHERE job_id = $1 AND log_level = ANY($2)
            ORDER BY timestamp DESC, seq DESC
            LIMIT $3
            "#,
        )
        .bind(job_id)
        .bind(levels)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LogLine::try_from).collect()
    }

    async fn level_counts(&self, job_id: &str) -> JobResult<HashMap<LogLevel, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT log_level, COUNT(*)::bigint
            FROM pipeline_logs
            WHERE job_id = $1
            GROUP BY log_level
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(level, count)| Ok((level.parse().map_err(JobError::Corrupt)?, count)))
            .collect()
    }

    async fn error_counts(&self, job_ids: &[String]) -> JobResult<HashMap<String, i64>> {
        if job_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT job_id, COUNT(*)::bigint
            FROM pipeline_logs
            WHERE log_level = 'ERROR' AND job_id = ANY($1)
            GROUP BY job_id
            "#,
        )
        .bind(job_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn delete_jobs(&self, job_ids: &[String]) -> JobResult<u64> {
        if job_ids.is_empty() {
            return Ok(0);
        }
        let ids = job_ids.to_vec();
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM pipeline_jobs WHERE job_id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM pipeline_logs WHERE job_id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn ping(&self) -> JobResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
