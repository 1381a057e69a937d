//! SQLite-backed job queue implementation.
//!
//! This module provides the durable store behind the job processor: inserting
//! jobs, leasing the next ready one, and recording how each attempt ended.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::error::{JobError, JobResult};
use super::job::{Job, JobStatus, NewJob};
use crate::common::SharedClock;

/// Default lease length for a claimed job, in seconds.
pub const DEFAULT_LEASE_SECS: i64 = 600;

/// Error recorded on jobs whose lease ran out.
pub const LEASE_EXPIRED_ERROR: &str = "lease expired";

macro_rules! job_columns {
    () => {
        "id, type, payload, status, attempts, max_attempts, scheduled_at, started_at, \
         completed_at, error, lease_expires_at, worker_id, created_at"
    };
}

/// Outcome of a lease reclaim sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimSummary {
    /// Abandoned jobs put back in line.
    pub requeued: u64,
    /// Abandoned jobs that had no attempts left.
    pub failed: u64,
}

impl ReclaimSummary {
    pub fn is_empty(&self) -> bool {
        self.requeued == 0 && self.failed == 0
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

impl JobStats {
    pub fn total(&self) -> i64 {
        self.pending + self.running + self.completed + self.failed
    }
}

/// Trait for job queue operations.
///
/// Every status change goes through one of these calls; implementations must
/// make `lease_next_ready` atomic so two leasers never both get the same row.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a `pending` job. A missing `scheduled_at` means now.
    async fn enqueue(&self, job: NewJob) -> JobResult<Job>;

    /// Claim the oldest ready job, or `None` when nothing is due.
    ///
    /// The claimed row is `running`, has `started_at` stamped and its
    /// `attempts` already incremented.
    async fn lease_next_ready(&self, worker_id: &str) -> JobResult<Option<Job>>;

    /// `running -> completed`.
    ///
    /// This and the other settle calls only apply while `worker_id` still
    /// holds the lease; otherwise they fail with [`JobError::LeaseLost`].
    async fn complete(&self, job_id: i64, worker_id: &str) -> JobResult<()>;

    /// `running -> failed`, recording `error`.
    async fn fail_permanently(&self, job_id: i64, worker_id: &str, error: &str) -> JobResult<()>;

    /// `running -> pending` at `next_attempt_at`, recording `error`.
    async fn reschedule_for_retry(
        &self,
        job_id: i64,
        worker_id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> JobResult<()>;

    /// Extend the lease `worker_id` holds on a running job.
    async fn heartbeat(&self, job_id: i64, worker_id: &str) -> JobResult<()>;

    /// Release running jobs whose lease has expired.
    async fn reclaim_expired_leases(&self) -> JobResult<ReclaimSummary>;

    async fn find_by_id(&self, job_id: i64) -> JobResult<Job>;

    /// Most recent jobs first, optionally filtered by status.
    async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> JobResult<Vec<Job>>;

    async fn count_by_status(&self) -> JobResult<JobStats>;
}

/// SQLite-backed job queue.
#[derive(Clone)]
pub struct SqliteJobQueue {
    pool: SqlitePool,
    clock: SharedClock,
    lease_duration: Duration,
}

impl SqliteJobQueue {
    /// Create a queue with the default lease duration.
    pub fn new(pool: SqlitePool, clock: SharedClock) -> Self {
        Self {
            pool,
            clock,
            lease_duration: Duration::seconds(DEFAULT_LEASE_SECS),
        }
    }

    /// Create with a custom lease duration.
    pub fn with_lease_duration(
        pool: SqlitePool,
        clock: SharedClock,
        lease_duration: Duration,
    ) -> Self {
        Self {
            pool,
            clock,
            lease_duration,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Guard a write against the transition table.
    fn check_edge(job_id: i64, from: JobStatus, to: JobStatus) -> JobResult<()> {
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(JobError::IllegalTransition { id: job_id, from, to })
        }
    }

    /// Turn a zero-row transition update into the reason it matched nothing.
    ///
    /// A row held by someone else (or by nobody) means the caller's lease is
    /// gone; a row still attributed to the caller is in the wrong state.
    async fn rejected(&self, job_id: i64, worker_id: &str, to: JobStatus) -> JobError {
        match self.find_by_id(job_id).await {
            Ok(job) if job.worker_id.as_deref() != Some(worker_id) => JobError::LeaseLost {
                id: job_id,
                worker_id: worker_id.to_string(),
            },
            Ok(job) => JobError::IllegalTransition {
                id: job_id,
                from: job.status,
                to,
            },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, job: NewJob) -> JobResult<Job> {
        let now = self.clock.now();
        let scheduled_at = job.scheduled_at.unwrap_or(now);

        let inserted = sqlx::query_as::<_, Job>(concat!(
            "INSERT INTO jobs (type, payload, status, attempts, max_attempts, scheduled_at, created_at) \
             VALUES (?, ?, ?, 0, ?, ?, ?) \
             RETURNING ",
            job_columns!()
        ))
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(JobStatus::Pending)
        .bind(job.max_attempts)
        .bind(scheduled_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        debug!(
            job_id = inserted.id,
            job_type = %inserted.job_type,
            scheduled_at = %inserted.scheduled_at,
            "enqueued job"
        );

        Ok(inserted)
    }

    async fn lease_next_ready(&self, worker_id: &str) -> JobResult<Option<Job>> {
        let now = self.clock.now();

        // A single UPDATE .. RETURNING is one write transaction in SQLite, so
        // the select and the state flip cannot interleave with another leaser.
        let job = sqlx::query_as::<_, Job>(concat!(
            "UPDATE jobs \
             SET status = ?, started_at = ?, lease_expires_at = ?, worker_id = ?, \
                 attempts = attempts + 1 \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE status = ? AND scheduled_at <= ? \
                 ORDER BY scheduled_at ASC, id ASC \
                 LIMIT 1 \
             ) \
             AND status = ? \
             RETURNING ",
            job_columns!()
        ))
        .bind(JobStatus::Running)
        .bind(now)
        .bind(now + self.lease_duration)
        .bind(worker_id)
        .bind(JobStatus::Pending)
        .bind(now)
        .bind(JobStatus::Pending)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn complete(&self, job_id: i64, worker_id: &str) -> JobResult<()> {
        Self::check_edge(job_id, JobStatus::Running, JobStatus::Completed)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, completed_at = ?, lease_expires_at = NULL
            WHERE id = ? AND status = ? AND worker_id = ?
            "#,
        )
        .bind(JobStatus::Completed)
        .bind(self.clock.now())
        .bind(job_id)
        .bind(JobStatus::Running)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected(job_id, worker_id, JobStatus::Completed).await);
        }
        Ok(())
    }

    async fn fail_permanently(&self, job_id: i64, worker_id: &str, error: &str) -> JobResult<()> {
        Self::check_edge(job_id, JobStatus::Running, JobStatus::Failed)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, completed_at = ?, error = ?, lease_expires_at = NULL
            WHERE id = ? AND status = ? AND worker_id = ?
            "#,
        )
        .bind(JobStatus::Failed)
        .bind(self.clock.now())
        .bind(error)
        .bind(job_id)
        .bind(JobStatus::Running)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected(job_id, worker_id, JobStatus::Failed).await);
        }
        Ok(())
    }

    async fn reschedule_for_retry(
        &self,
        job_id: i64,
        worker_id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> JobResult<()> {
        Self::check_edge(job_id, JobStatus::Running, JobStatus::Pending)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, scheduled_at = ?, error = ?, lease_expires_at = NULL, worker_id = NULL
            WHERE id = ? AND status = ? AND worker_id = ?
            "#,
        )
        .bind(JobStatus::Pending)
        .bind(next_attempt_at)
        .bind(error)
        .bind(job_id)
        .bind(JobStatus::Running)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected(job_id, worker_id, JobStatus::Pending).await);
        }
        Ok(())
    }

    async fn heartbeat(&self, job_id: i64, worker_id: &str) -> JobResult<()> {
        let result = sqlx::query(
            "UPDATE jobs SET lease_expires_at = ? WHERE id = ? AND status = ? AND worker_id = ?",
        )
        .bind(self.clock.now() + self.lease_duration)
        .bind(job_id)
        .bind(JobStatus::Running)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::LeaseLost {
                id: job_id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    async fn reclaim_expired_leases(&self) -> JobResult<ReclaimSummary> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let failed = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, completed_at = ?, error = ?, lease_expires_at = NULL, worker_id = NULL
            WHERE status = ? AND lease_expires_at < ? AND attempts >= max_attempts
            "#,
        )
        .bind(JobStatus::Failed)
        .bind(now)
        .bind(LEASE_EXPIRED_ERROR)
        .bind(JobStatus::Running)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let requeued = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, scheduled_at = ?, error = ?, lease_expires_at = NULL, worker_id = NULL
            WHERE status = ? AND lease_expires_at < ? AND attempts < max_attempts
            "#,
        )
        .bind(JobStatus::Pending)
        .bind(now)
        .bind(LEASE_EXPIRED_ERROR)
        .bind(JobStatus::Running)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        let summary = ReclaimSummary { requeued, failed };
        if !summary.is_empty() {
            info!(requeued, failed, "reclaimed jobs with expired leases");
        }
        Ok(summary)
    }

    async fn find_by_id(&self, job_id: i64) -> JobResult<Job> {
        sqlx::query_as::<_, Job>(concat!("SELECT ", job_columns!(), " FROM jobs WHERE id = ?"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(JobError::NotFound(job_id))
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> JobResult<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs \
             WHERE (? IS NULL OR status = ?) \
             ORDER BY id DESC \
             LIMIT ?"
        ))
        .bind(status)
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn count_by_status(&self) -> JobResult<JobStats> {
        let rows = sqlx::query_as::<_, (JobStatus, i64)>(
            "SELECT status, COUNT(*) FROM jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = JobStats::default();
        for (status, count) in rows {
            match status {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Running => stats.running = count,
                JobStatus::Completed => stats.completed = count,
                JobStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}
