//! Test harness for integration testing.
//!
//! Every test gets its own SQLite file in the temp directory with migrations
//! applied, plus a manual clock pinned to [`TestHarness::start_time`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use scaffold_core::common::{ManualClock, SharedClock};
use scaffold_core::kernel::db;
use scaffold_core::kernel::jobs::{JobProcessor, JobRunnerConfig, SqliteJobQueue};
use sqlx::SqlitePool;
use test_context::AsyncTestContext;
use uuid::Uuid;

/// Test harness that manages test infrastructure.
///
/// # Example using test-context
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let queue = ctx.queue();
///     // ... test code
/// }
/// ```
pub struct TestHarness {
    /// Database pool - use this for test fixtures.
    pub db_pool: SqlitePool,
    /// Clock shared by the queue, the processor and the cleanup handlers.
    pub clock: Arc<ManualClock>,
    db_path: PathBuf,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new()
            .await
            .expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
        for suffix in ["", "-wal", "-shm"] {
            let mut path = self.db_path.clone().into_os_string();
            path.push(suffix);
            let _ = std::fs::remove_file(path);
        }
    }
}

impl TestHarness {
    /// Creates a fresh database with the schema applied.
    pub async fn new() -> Result<Self> {
        // Run tests with: RUST_LOG=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let db_path = std::env::temp_dir().join(format!("scaffold-test-{}.db", Uuid::new_v4()));
        let db_url = format!("sqlite://{}", db_path.display());

        let db_pool = db::connect(&db_url, 4).await?;
        db::run_migrations(&db_pool).await?;

        Ok(Self {
            db_pool,
            clock: Arc::new(ManualClock::new(Self::start_time())),
            db_path,
        })
    }

    /// Where every test's clock starts.
    pub fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    pub fn now(&self) -> DateTime<Utc> {
        use scaffold_core::common::Clock;
        self.clock.now()
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.clock.advance(by);
    }

    pub fn shared_clock(&self) -> SharedClock {
        self.clock.clone()
    }

    /// Queue over the test database with the default lease.
    pub fn queue(&self) -> SqliteJobQueue {
        SqliteJobQueue::new(self.db_pool.clone(), self.shared_clock())
    }

    /// Queue with a custom lease duration.
    pub fn queue_with_lease(&self, lease: chrono::Duration) -> SqliteJobQueue {
        SqliteJobQueue::with_lease_duration(self.db_pool.clone(), self.shared_clock(), lease)
    }

    /// Fast-polling runner config with the maintenance loop off.
    pub fn runner_config() -> JobRunnerConfig {
        JobRunnerConfig {
            poll_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(50),
            schedule_maintenance: false,
            ..JobRunnerConfig::with_worker_id("test-runner")
        }
    }

    /// Processor with the built-in handlers registered.
    pub fn processor(&self) -> JobProcessor {
        self.processor_with_config(Self::runner_config())
    }

    pub fn processor_with_config(&self, config: JobRunnerConfig) -> JobProcessor {
        JobProcessor::with_builtin_handlers(self.db_pool.clone(), self.shared_clock(), config)
    }
}
