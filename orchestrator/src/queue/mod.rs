//! Durable typed work queue with per-type FIFO ordering and
//! at-least-once delivery.
//!
//! Jobs live in their own SQLite database, separate from the state
//! store. A dequeue does not remove the row; it takes a time-limited
//! claim on it. `mark_complete` is the removal. A worker that dies
//! mid-job simply lets the claim lapse and the job becomes visible
//! again, which is what gives handlers their at-least-once contract.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use skyhook_common::{Job, JobType};
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{Sqlite, SqlitePool, SqlitePoolOptions};
use tokio::sync::Notify;
use uuid::Uuid;

/// How long a claim shields a job from other workers. Must exceed the
/// longest handler deadline.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(45 * 60);

/// How often a blocked dequeue re-polls for due retries and expired
/// leases that no enqueue signal announces.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Errors possible when interacting with the queue. All of them are
/// retryable from the caller's point of view.
#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("queue store interaction failed: {0}")]
    Store(#[from] sqlx::Error),
    #[error("failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Clone)]
pub struct Queue {
    pool: SqlitePool,
    signals: Arc<HashMap<JobType, Notify>>,
    claim_lease: Duration,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    job_type: JobType,
    deployment_id: Uuid,
    payload: serde_json::Value,
    created_at: i64,
    attempts: u32,
    max_attempts: u32,
    last_error: Option<String>,
    next_retry_at: Option<i64>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.id,
            job_type: row.job_type,
            deployment_id: row.deployment_id,
            payload: row.payload,
            created_at: millis_to_datetime(row.created_at),
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            last_error: row.last_error,
            next_retry_at: row.next_retry_at.map(millis_to_datetime),
        }
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

impl Queue {
    pub async fn new(db_path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}", db_path.display());

        if !Sqlite::database_exists(&url).await.unwrap_or(false) {
            Sqlite::create_database(&url).await?;
        }

        Self::from_pool(SqlitePool::connect(&url).await?).await
    }

    /// A throwaway queue for tests, pinned to a single connection.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::from_pool(pool).await
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT, -- FIFO position within a type.
                id TEXT UNIQUE,        -- Stable job identity across attempts.
                job_type TEXT,
                deployment_id TEXT,
                payload TEXT,          -- Opaque JSON payload map.
                created_at INTEGER,    -- Unix epoch millis.
                attempts INTEGER,      -- Incremented when a worker claims the job.
                max_attempts INTEGER,
                last_error TEXT,
                next_retry_at INTEGER, -- Scheduled-delivery time for retries, epoch millis.
                claimed_at INTEGER,    -- Set while a worker holds the job.
                claim_expires_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_claim
                ON jobs(job_type, seq);

            CREATE TABLE IF NOT EXISTS processing (
                job_id TEXT PRIMARY KEY, -- Visibility marker, not a delivery mechanism.
                job_type TEXT,
                deployment_id TEXT,
                started_at INTEGER,
                expires_at INTEGER       -- Self-expiring TTL.
            );

            CREATE TABLE IF NOT EXISTS failed_jobs (
                job_id TEXT PRIMARY KEY, -- Jobs that exhausted their attempts.
                job_type TEXT,
                deployment_id TEXT,
                error TEXT,              -- Terminal error, kept for operators.
                failed_at INTEGER
            );
            ",
        )
        .execute(&pool)
        .await?;

        let signals = JobType::ALL
            .into_iter()
            .map(|job_type| (job_type, Notify::new()))
            .collect();

        Ok(Self {
            pool,
            signals: Arc::new(signals),
            claim_lease: DEFAULT_CLAIM_LEASE,
        })
    }

    fn signal(&self, job_type: JobType) -> &Notify {
        &self.signals[&job_type]
    }

    /// Appends a job to the tail of its type's list. Durable once this
    /// returns.
    pub async fn enqueue(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs
                (id, job_type, deployment_id, payload, created_at, attempts, max_attempts,
                 last_error, next_retry_at, claimed_at, claim_expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL)",
        )
        .bind(job.id)
        .bind(job.job_type)
        .bind(job.deployment_id)
        .bind(&job.payload)
        .bind(job.created_at.timestamp_millis())
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(&job.last_error)
        .bind(job.next_retry_at.map(|at| at.timestamp_millis()))
        .execute(&self.pool)
        .await?;

        self.signal(job.job_type).notify_one();

        Ok(())
    }

    /// Blocks up to `timeout` for the head of the named type's list.
    ///
    /// Each job is returned to exactly one caller; the claim taken
    /// here also increments the job's attempt counter, so the returned
    /// job carries the number of the attempt about to run.
    pub async fn dequeue(&self, job_type: JobType, timeout: Duration) -> Result<Option<Job>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(job) = self.claim(job_type).await? {
                return Ok(Some(job));
            }

            let notified = self.signal(job_type).notified();
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            // Wake on a fresh enqueue, or re-poll for due retries and
            // expired leases.
            let wait = CLAIM_POLL_INTERVAL.min(deadline - now);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn claim(&self, job_type: JobType) -> Result<Option<Job>> {
        let now = Utc::now().timestamp_millis();
        let expires = now + self.claim_lease.as_millis() as i64;

        let row: Option<JobRow> = sqlx::query_as(
            "UPDATE jobs
             SET attempts = attempts + 1, claimed_at = ?, claim_expires_at = ?
             WHERE seq = (
                 SELECT seq FROM jobs
                 WHERE job_type = ?
                   AND (claimed_at IS NULL OR claim_expires_at <= ?)
                   AND (next_retry_at IS NULL OR next_retry_at <= ?)
                 ORDER BY seq
                 LIMIT 1
             )
             RETURNING id, job_type, deployment_id, payload, created_at, attempts,
                       max_attempts, last_error, next_retry_at",
        )
        .bind(now)
        .bind(expires)
        .bind(job_type)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Job::from))
    }

    /// Schedules a failed job for another attempt no earlier than its
    /// `next_retry_at`, releasing the claim. The job keeps its
    /// identity and its incremented attempt counter.
    pub async fn requeue(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "UPDATE jobs
             SET attempts = ?, last_error = ?, next_retry_at = ?,
                 claimed_at = NULL, claim_expires_at = NULL
             WHERE id = ?",
        )
        .bind(job.attempts)
        .bind(&job.last_error)
        .bind(job.next_retry_at.map(|at| at.timestamp_millis()))
        .bind(job.id)
        .execute(&self.pool)
        .await?;

        self.drop_processing(&job.id).await
    }

    /// Records a short-lived in-flight marker for visibility and crash
    /// detection. Not part of the delivery contract.
    pub async fn mark_processing(&self, job: &Job, ttl: Duration) -> Result<()> {
        let now = Utc::now().timestamp_millis();

        sqlx::query(
            "INSERT OR REPLACE INTO processing (job_id, job_type, deployment_id, started_at, expires_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(job.id)
        .bind(job.job_type)
        .bind(job.deployment_id)
        .bind(now)
        .bind(now + ttl.as_millis() as i64)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(QueueError::from)
    }

    /// Removes a finished job and its in-flight marker.
    pub async fn mark_complete(&self, job_id: &Uuid) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        self.drop_processing(job_id).await
    }

    /// Removes a job that exhausted its attempts, keeping the terminal
    /// error for operators.
    pub async fn mark_failed(&self, job_id: &Uuid, error: &str) -> Result<()> {
        let row: Option<(JobType, Uuid)> =
            sqlx::query_as("SELECT job_type, deployment_id FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;

        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        if let Some((job_type, deployment_id)) = row {
            sqlx::query(
                "INSERT OR REPLACE INTO failed_jobs (job_id, job_type, deployment_id, error, failed_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(job_id)
            .bind(job_type)
            .bind(deployment_id)
            .bind(error)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        }

        self.drop_processing(job_id).await
    }

    /// The terminal error of a dead-lettered job, if any.
    pub async fn get_failed_error(&self, job_id: &Uuid) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT error FROM failed_jobs WHERE job_id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(error,)| error))
    }

    /// Jobs waiting (or scheduled) for a worker, excluding ones
    /// currently held under a live claim.
    pub async fn queue_length(&self, job_type: JobType) -> Result<i64> {
        let now = Utc::now().timestamp_millis();

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs
             WHERE job_type = ? AND (claimed_at IS NULL OR claim_expires_at <= ?)",
        )
        .bind(job_type)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn queue_lengths(&self) -> Result<HashMap<JobType, i64>> {
        let mut lengths = HashMap::new();

        for job_type in JobType::ALL {
            lengths.insert(job_type, self.queue_length(job_type).await?);
        }

        Ok(lengths)
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;

        Ok(())
    }

    async fn drop_processing(&self, job_id: &Uuid) -> Result<()> {
        sqlx::query("DELETE FROM processing WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(QueueError::from)
    }
}
