//! Integration tests for the built-in cleanup jobs.

mod common;

use chrono::Duration;
use scaffold_core::domains::analytics::models::{UsageEvent, USAGE_EVENT_RETENTION_DAYS};
use scaffold_core::domains::auth::models::Session;
use scaffold_core::kernel::jobs::maintenance::{
    cleanup_sessions, cleanup_usage_events, enqueue_maintenance_jobs, CLEANUP_SESSIONS,
    CLEANUP_USAGE_EVENTS,
};
use scaffold_core::kernel::jobs::{JobOutcome, JobQueue, JobStatus};
use test_context::test_context;

use crate::common::TestHarness;

async fn count_sessions(ctx: &TestHarness) -> i64 {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sessions")
        .fetch_one(&ctx.db_pool)
        .await
        .unwrap()
}

// =============================================================================
// cleanup_sessions
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn cleanup_sessions_removes_only_expired(ctx: &TestHarness) {
    let now = ctx.now();
    Session::create("expired", 1, now - Duration::days(2), now - Duration::hours(1), &ctx.db_pool)
        .await
        .unwrap();
    Session::create("live", 1, now - Duration::hours(1), now + Duration::hours(1), &ctx.db_pool)
        .await
        .unwrap();

    let deleted = cleanup_sessions(&ctx.db_pool, &ctx.shared_clock()).await.unwrap();

    assert_eq!(deleted, 1);
    assert!(Session::find_by_token("expired", &ctx.db_pool).await.unwrap().is_none());
    assert!(Session::find_by_token("live", &ctx.db_pool).await.unwrap().is_some());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn cleanup_sessions_on_empty_table_is_a_no_op(ctx: &TestHarness) {
    let deleted = cleanup_sessions(&ctx.db_pool, &ctx.shared_clock()).await.unwrap();
    assert_eq!(deleted, 0);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn session_expiring_exactly_now_is_kept(ctx: &TestHarness) {
    let now = ctx.now();
    Session::create("edge", 1, now - Duration::hours(1), now, &ctx.db_pool)
        .await
        .unwrap();

    cleanup_sessions(&ctx.db_pool, &ctx.shared_clock()).await.unwrap();
    assert_eq!(count_sessions(ctx).await, 1);

    ctx.advance(Duration::seconds(1));
    cleanup_sessions(&ctx.db_pool, &ctx.shared_clock()).await.unwrap();
    assert_eq!(count_sessions(ctx).await, 0);
}

// =============================================================================
// cleanup_usage_events
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn cleanup_usage_events_honors_retention(ctx: &TestHarness) {
    let now = ctx.now();
    let retention = Duration::days(USAGE_EVENT_RETENTION_DAYS);

    UsageEvent::record(7, Some(1), "login", None, now - retention - Duration::days(1), &ctx.db_pool)
        .await
        .unwrap();
    let recent = now - Duration::days(89);
    UsageEvent::record(7, None, "export", Some(r#"{"rows":10}"#), recent, &ctx.db_pool)
        .await
        .unwrap();
    UsageEvent::record(7, Some(2), "login", None, now, &ctx.db_pool)
        .await
        .unwrap();

    let deleted = cleanup_usage_events(&ctx.db_pool, &ctx.shared_clock()).await.unwrap();

    assert_eq!(deleted, 1);
    assert_eq!(UsageEvent::count_for_tenant(7, &ctx.db_pool).await.unwrap(), 2);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn cleanup_usage_events_is_idempotent(ctx: &TestHarness) {
    let now = ctx.now();
    for days in [100, 120, 365] {
        UsageEvent::record(3, None, "page_view", None, now - Duration::days(days), &ctx.db_pool)
            .await
            .unwrap();
    }

    let first = cleanup_usage_events(&ctx.db_pool, &ctx.shared_clock()).await.unwrap();
    let second = cleanup_usage_events(&ctx.db_pool, &ctx.shared_clock()).await.unwrap();

    assert_eq!(first, 3);
    assert_eq!(second, 0);
}

// =============================================================================
// As jobs
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn maintenance_jobs_run_through_the_processor(ctx: &TestHarness) {
    let now = ctx.now();
    Session::create("stale", 9, now - Duration::days(30), now - Duration::days(1), &ctx.db_pool)
        .await
        .unwrap();
    UsageEvent::record(9, None, "login", None, now - Duration::days(200), &ctx.db_pool)
        .await
        .unwrap();

    let runner = ctx.processor().into_runner();
    assert!(runner.registry().is_registered(CLEANUP_SESSIONS));
    assert!(runner.registry().is_registered(CLEANUP_USAGE_EVENTS));

    enqueue_maintenance_jobs(runner.queue().as_ref(), 3).await;

    let first = runner.process_next_job().await.unwrap().unwrap();
    let second = runner.process_next_job().await.unwrap().unwrap();
    assert_eq!(first.job_type, CLEANUP_SESSIONS);
    assert_eq!(second.job_type, CLEANUP_USAGE_EVENTS);
    assert_eq!(first.outcome, JobOutcome::Completed);
    assert_eq!(second.outcome, JobOutcome::Completed);

    assert_eq!(count_sessions(ctx).await, 0);
    assert_eq!(UsageEvent::count_for_tenant(9, &ctx.db_pool).await.unwrap(), 0);

    let stats = runner.queue().count_by_status().await.unwrap();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.total(), 2);
    let jobs = runner.queue().list_jobs(Some(JobStatus::Completed), 10).await.unwrap();
    assert!(jobs.iter().all(|j| j.max_attempts == 3));
}
