//! Built-in housekeeping jobs.
//!
//! The processor enqueues these itself (at startup and then once per
//! maintenance interval). They are ordinary jobs: leased, retried and failed
//! like anything else. Both are idempotent, so a retry after a partial run or
//! an overlapping enqueue is harmless.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{error, info};

use super::job::NewJob;
use super::queue::JobQueue;
use super::registry::JobRegistry;
use crate::common::SharedClock;
use crate::domains::analytics::models::UsageEvent;
use crate::domains::auth::models::Session;

pub const CLEANUP_SESSIONS: &str = "cleanup_sessions";
pub const CLEANUP_USAGE_EVENTS: &str = "cleanup_usage_events";

/// Job types the maintenance loop enqueues each interval.
pub const MAINTENANCE_JOB_TYPES: [&str; 2] = [CLEANUP_SESSIONS, CLEANUP_USAGE_EVENTS];

/// Delete sessions whose expiry has passed.
pub async fn cleanup_sessions(pool: &SqlitePool, clock: &SharedClock) -> Result<u64> {
    let deleted = Session::delete_expired(clock.now(), pool).await?;
    info!(deleted, "cleaned up expired sessions");
    Ok(deleted)
}

/// Delete usage events older than the retention window.
pub async fn cleanup_usage_events(pool: &SqlitePool, clock: &SharedClock) -> Result<u64> {
    let cutoff = UsageEvent::retention_cutoff(clock.now());
    let deleted = UsageEvent::delete_older_than(cutoff, pool).await?;
    info!(deleted, cutoff = %cutoff, "cleaned up old usage events");
    Ok(deleted)
}

/// Register both cleanup handlers. Their payloads are ignored.
pub fn register_maintenance_handlers(
    registry: &mut JobRegistry,
    pool: SqlitePool,
    clock: SharedClock,
) {
    let sessions_pool = pool.clone();
    let sessions_clock = clock.clone();
    registry.register(CLEANUP_SESSIONS, move |_payload| {
        let pool = sessions_pool.clone();
        let clock = sessions_clock.clone();
        async move { cleanup_sessions(&pool, &clock).await.map(|_| ()) }
    });

    registry.register(CLEANUP_USAGE_EVENTS, move |_payload| {
        let pool = pool.clone();
        let clock = clock.clone();
        async move { cleanup_usage_events(&pool, &clock).await.map(|_| ()) }
    });
}

/// Enqueue one of each maintenance job. Failures are logged, not returned.
pub async fn enqueue_maintenance_jobs(queue: &dyn JobQueue, max_attempts: i32) {
    for job_type in MAINTENANCE_JOB_TYPES {
        let job = NewJob::builder()
            .job_type(job_type)
            .max_attempts(max_attempts)
            .build();

        match queue.enqueue(job).await {
            Ok(job) => info!(job_id = job.id, job_type, "scheduled maintenance job"),
            Err(e) => error!(job_type, error = %e, "failed to schedule maintenance job"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registers_both_cleanup_types() {
        // A lazy pool never opens a connection until used.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .connect_lazy("sqlite::memory:")
            .unwrap();
        let clock: SharedClock = std::sync::Arc::new(crate::common::SystemClock);

        let mut registry = JobRegistry::new();
        register_maintenance_handlers(&mut registry, pool, clock);

        assert_eq!(
            registry.registered_types(),
            vec![CLEANUP_SESSIONS.to_string(), CLEANUP_USAGE_EVENTS.to_string()]
        );
    }
}
