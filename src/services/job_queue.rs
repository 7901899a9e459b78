//! src/services/job_queue.rs
//!
//! Durable job queue on SQLite. The file server enqueues and returns at once;
//! workers claim rows with a single `UPDATE ... RETURNING` so several worker
//! processes can share one database. Delivery is at-least-once.

use crate::models::job::Job;
use chrono::Utc;
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("job payload: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("job `{0}` not found")]
    JobNotFound(Uuid),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Default attempt budget for a job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Ceiling on the delay between two attempts of one job.
pub const MAX_RETRY_BACKOFF_SECS: u64 = 300;

/// Delay before the next attempt after `attempts` failures, doubling and capped.
pub fn retry_backoff(attempts: u32) -> Duration {
    let secs = 2_u64
        .checked_pow(attempts)
        .unwrap_or(u64::MAX)
        .min(MAX_RETRY_BACKOFF_SECS);
    Duration::from_secs(secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A row of the `jobs` table. Times are Unix epoch milliseconds.
#[derive(Debug, Clone, FromRow)]
pub struct JobRecord {
    pub id: Uuid,
    pub name: String,
    pub payload: String,
    pub status: JobStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub run_at: i64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub result: Option<String>,
    pub last_error: Option<String>,
}

impl JobRecord {
    /// Decode the payload. Fails for job names this build does not know.
    pub fn job(&self) -> Result<Job, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// What `fail` decided for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled; runs again no earlier than `run_at` (epoch ms).
    Retrying { run_at: i64 },
    /// Attempt budget spent.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapOutcome {
    pub requeued: u64,
    pub failed: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Clone, Debug)]
pub struct JobQueue {
    pool: SqlitePool,
    max_attempts: u32,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl JobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Persist a job for the workers. Returns its id.
    pub async fn enqueue(&self, job: &Job) -> QueueResult<Uuid> {
        let id = Uuid::new_v4();
        let now = now_millis();
        sqlx::query(
            "INSERT INTO jobs (id, name, payload, status, attempts, max_attempts, run_at, created_at) \
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?5)",
        )
        .bind(id)
        .bind(job.name())
        .bind(serde_json::to_string(job)?)
        .bind(self.max_attempts as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(job.id = %id, job.name = job.name(), "enqueued job");
        Ok(id)
    }

    /// Atomically move the oldest due pending job to `running`.
    pub async fn claim_next(&self) -> QueueResult<Option<JobRecord>> {
        let record = sqlx::query_as::<_, JobRecord>(
            "UPDATE jobs SET status = 'running', attempts = attempts + 1, started_at = ?1 \
             WHERE id = ( \
                 SELECT id FROM jobs WHERE status = 'pending' AND run_at <= ?1 \
                 ORDER BY run_at, created_at, rowid LIMIT 1 \
             ) \
             RETURNING *",
        )
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Mark a job done and keep its result for inspection.
    pub async fn complete(&self, id: Uuid, result: &serde_json::Value) -> QueueResult<()> {
        let done = sqlx::query(
            "UPDATE jobs SET status = 'completed', finished_at = ?2, result = ?3, last_error = NULL \
             WHERE id = ?1",
        )
        .bind(id)
        .bind(now_millis())
        .bind(result.to_string())
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(QueueError::JobNotFound(id));
        }
        Ok(())
    }

    /// Record a failed attempt: reschedule with backoff, or give up once the
    /// attempt budget is spent.
    pub async fn fail(&self, id: Uuid, error: &str) -> QueueResult<FailOutcome> {
        let (attempts, max_attempts): (i64, i64) =
            sqlx::query_as("SELECT attempts, max_attempts FROM jobs WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(QueueError::JobNotFound(id))?;

        let now = now_millis();
        if attempts >= max_attempts {
            sqlx::query(
                "UPDATE jobs SET status = 'failed', finished_at = ?2, last_error = ?3 WHERE id = ?1",
            )
            .bind(id)
            .bind(now)
            .bind(error)
            .execute(&self.pool)
            .await?;
            return Ok(FailOutcome::Failed);
        }

        let delay = retry_backoff(attempts.max(0) as u32);
        let run_at = now + delay.as_millis() as i64;
        sqlx::query(
            "UPDATE jobs SET status = 'pending', run_at = ?2, started_at = NULL, last_error = ?3 \
             WHERE id = ?1",
        )
        .bind(id)
        .bind(run_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(FailOutcome::Retrying { run_at })
    }

    /// Hand a claimed job back untouched; the claim does not count as an attempt.
    pub async fn release(&self, id: Uuid) -> QueueResult<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'pending', started_at = NULL, \
             attempts = MAX(attempts - 1, 0) WHERE id = ?1 AND status = 'running'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Sweep jobs stuck in `running` for longer than `older_than`, e.g. after
    /// a worker crash. Jobs with attempts left go back to `pending`; the rest
    /// are marked `failed`.
    pub async fn reap_stale(&self, older_than: Duration) -> QueueResult<ReapOutcome> {
        let now = now_millis();
        let cutoff = now - older_than.as_millis() as i64;
        let failed = sqlx::query(
            "UPDATE jobs SET status = 'failed', finished_at = ?2, \
             last_error = 'abandoned by worker after ' || attempts || ' attempts' \
             WHERE status = 'running' AND started_at < ?1 AND attempts >= max_attempts",
        )
        .bind(cutoff)
        .bind(now)
        .execute(&self.pool)
        .await?;
        let requeued = sqlx::query(
            "UPDATE jobs SET status = 'pending', started_at = NULL \
             WHERE status = 'running' AND started_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(ReapOutcome {
            requeued: requeued.rows_affected(),
            failed: failed.rows_affected(),
        })
    }

    /// Jobs in `status`, oldest first.
    pub async fn list(&self, status: JobStatus, limit: u32) -> QueueResult<Vec<JobRecord>> {
        let records = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE status = ?1 ORDER BY created_at, rowid LIMIT ?2",
        )
        .bind(status)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Payloads of every pending job, oldest first.
    pub async fn pending_jobs(&self) -> QueueResult<Vec<Job>> {
        self.list(JobStatus::Pending, u32::MAX)
            .await?
            .iter()
            .map(|record| record.job().map_err(QueueError::from))
            .collect()
    }

    pub async fn counts(&self) -> QueueResult<JobCounts> {
        let rows: Vec<(JobStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = JobCounts::default();
        for (status, n) in rows {
            let n = n.max(0) as u64;
            match status {
                JobStatus::Pending => counts.pending = n,
                JobStatus::Running => counts.running = n,
                JobStatus::Completed => counts.completed = n,
                JobStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn queue() -> (tempfile::TempDir, JobQueue) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());
        let pool = db::connect(&url).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        (dir, JobQueue::new(pool))
    }

    #[test]
    fn retry_backoff_exponential_then_capped() {
        assert_eq!(retry_backoff(0), Duration::from_secs(1));
        assert_eq!(retry_backoff(3), Duration::from_secs(8));
        assert_eq!(retry_backoff(9), Duration::from_secs(MAX_RETRY_BACKOFF_SECS));
        assert_eq!(retry_backoff(200), Duration::from_secs(MAX_RETRY_BACKOFF_SECS));
    }

    #[tokio::test]
    async fn enqueue_claim_complete() {
        let (_dir, queue) = queue().await;
        let job = Job::upload("foo/bar/readme.txt", "B");
        let id = queue.enqueue(&job).await.unwrap();
        assert_eq!(queue.pending_jobs().await.unwrap(), vec![job.clone()]);

        let record = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.name, "s3:upload");
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.job().unwrap(), job);
        assert!(queue.claim_next().await.unwrap().is_none());

        queue
            .complete(id, &serde_json::json!({"ok": true}))
            .await
            .unwrap();
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.pending + counts.running, 0);
    }

    #[tokio::test]
    async fn claims_oldest_first() {
        let (_dir, queue) = queue().await;
        let first = queue.enqueue(&Job::delete("a", "B")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = queue.enqueue(&Job::delete("b", "B")).await.unwrap();

        assert_eq!(queue.claim_next().await.unwrap().unwrap().id, first);
        assert_eq!(queue.claim_next().await.unwrap().unwrap().id, second);
    }

    #[tokio::test]
    async fn fail_reschedules_then_gives_up() {
        let (_dir, queue) = queue().await;
        let queue = queue.with_max_attempts(2);
        let id = queue.enqueue(&Job::delete("a", "B")).await.unwrap();

        queue.claim_next().await.unwrap().unwrap();
        let outcome = queue.fail(id, "boom").await.unwrap();
        assert!(matches!(outcome, FailOutcome::Retrying { run_at } if run_at > now_millis()));
        // Not due yet.
        assert!(queue.claim_next().await.unwrap().is_none());

        sqlx::query("UPDATE jobs SET run_at = 0")
            .execute(queue.pool())
            .await
            .unwrap();
        let record = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.last_error.as_deref(), Some("boom"));

        assert_eq!(queue.fail(id, "boom again").await.unwrap(), FailOutcome::Failed);
        let failed = queue.list(JobStatus::Failed, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("boom again"));
    }

    #[tokio::test]
    async fn release_and_reap_return_jobs_to_pending() {
        let (_dir, queue) = queue().await;
        let id = queue.enqueue(&Job::delete("a", "B")).await.unwrap();

        queue.claim_next().await.unwrap().unwrap();
        queue.release(id).await.unwrap();
        let record = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(record.attempts, 1);

        assert_eq!(
            queue.reap_stale(Duration::from_secs(60)).await.unwrap(),
            ReapOutcome::default()
        );
        sqlx::query("UPDATE jobs SET started_at = 0")
            .execute(queue.pool())
            .await
            .unwrap();
        let reaped = queue.reap_stale(Duration::from_secs(60)).await.unwrap();
        assert_eq!(reaped, ReapOutcome { requeued: 1, failed: 0 });
        assert_eq!(queue.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn reap_fails_jobs_that_spent_their_attempts() {
        let (_dir, queue) = queue().await;
        let queue = queue.with_max_attempts(2);
        let id = queue.enqueue(&Job::delete("a", "B")).await.unwrap();

        // The worker dies mid-job on every attempt.
        for _ in 0..2 {
            queue.claim_next().await.unwrap().unwrap();
            sqlx::query("UPDATE jobs SET started_at = 0")
                .execute(queue.pool())
                .await
                .unwrap();
            queue.reap_stale(Duration::from_secs(60)).await.unwrap();
        }

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.pending + counts.running, 0);
        assert!(queue.claim_next().await.unwrap().is_none());
        let failed = queue.list(JobStatus::Failed, 10).await.unwrap();
        assert_eq!(failed[0].id, id);
        assert_eq!(
            failed[0].last_error.as_deref(),
            Some("abandoned by worker after 2 attempts")
        );
    }
}
