//! Job runner service for processing background jobs.
//!
//! The `JobRunner` is a background service that:
//! - Reclaims jobs whose lease expired (crashed or stalled workers)
//! - Leases the oldest ready job from the queue
//! - Dispatches it to the registered handler
//! - Records the outcome (completed, retry with backoff, or failed)
//!
//! # Architecture
//!
//! ```text
//! JobProcessor (setup: register handlers, enqueue)
//!     │
//!     └─► start() ─► ProcessorHandle
//!             ├─► poll loop (every poll_interval)
//!             │       ├─► reclaim_expired_leases()
//!             │       ├─► lease_next_ready()
//!             │       ├─► JobRegistry.dispatch(type, payload) + heartbeat
//!             │       └─► complete / reschedule_for_retry / fail_permanently
//!             └─► maintenance loop (every maintenance_interval)
//!                     └─► enqueue cleanup_sessions, cleanup_usage_events
//! ```
//!
//! # Example
//!
//! ```ignore
//! let mut processor = JobProcessor::with_builtin_handlers(pool, clock, config);
//! processor.register_handler("send_digest", |payload| async move { send(payload).await });
//!
//! let handle = processor.start();
//! handle.enqueue("send_digest", &digest).await?;
//! // ...
//! handle.stop().await;
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backoff::retry_delay;
use super::error::{JobError, JobResult};
use super::job::{Job, NewJob, DEFAULT_MAX_ATTEMPTS};
use super::maintenance;
use super::queue::{JobQueue, SqliteJobQueue, DEFAULT_LEASE_SECS};
use super::registry::{panic_message, HandlerFuture, JobRegistry};
use crate::common::SharedClock;

/// Configuration for the job runner.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Time between poll ticks
    pub poll_interval: Duration,
    /// Time between maintenance job enqueues
    pub maintenance_interval: Duration,
    /// Whether to run the maintenance loop at all
    pub schedule_maintenance: bool,
    /// How long a lease lasts without a heartbeat
    pub lease_duration: Duration,
    /// How often to extend the lease of a running job
    pub heartbeat_interval: Duration,
    /// Maximum number of jobs run (one after another) per tick
    pub batch_size: usize,
    /// Attempts allowed for jobs enqueued through the runner
    pub max_attempts: i32,
    /// Worker ID for this instance
    pub worker_id: String,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            maintenance_interval: Duration::from_secs(24 * 60 * 60),
            schedule_maintenance: true,
            lease_duration: Duration::from_secs(DEFAULT_LEASE_SECS as u64),
            heartbeat_interval: Duration::from_secs(60),
            batch_size: 1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            worker_id: format!("runner-{}", Uuid::new_v4()),
        }
    }
}

impl JobRunnerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// How a leased job ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Retrying {
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    Failed {
        error: String,
    },
    /// The lease expired and was reclaimed before the result could be
    /// recorded; the result was dropped.
    LeaseLost,
}

/// A job the runner leased and settled.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedJob {
    pub job_id: i64,
    pub job_type: String,
    pub attempts: i32,
    pub outcome: JobOutcome,
}

/// Leases jobs and runs them through the registry.
pub struct JobRunner {
    queue: Arc<dyn JobQueue>,
    registry: JobRegistry,
    clock: SharedClock,
    config: JobRunnerConfig,
}

impl JobRunner {
    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn config(&self) -> &JobRunnerConfig {
        &self.config
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Enqueue a job to run as soon as a tick picks it up.
    pub async fn enqueue<P>(&self, job_type: &str, payload: &P) -> JobResult<Job>
    where
        P: Serialize + ?Sized,
    {
        let mut job = NewJob::with_payload(job_type, payload)?;
        job.max_attempts = self.config.max_attempts;
        self.queue.enqueue(job).await
    }

    /// Enqueue a job that becomes eligible after `delay`.
    pub async fn enqueue_delayed<P>(
        &self,
        job_type: &str,
        payload: &P,
        delay: Duration,
    ) -> JobResult<Job>
    where
        P: Serialize + ?Sized,
    {
        let chrono_delay =
            chrono::Duration::from_std(delay).map_err(|e| JobError::InvalidDelay(e.to_string()))?;
        let scheduled_at = self
            .clock
            .now()
            .checked_add_signed(chrono_delay)
            .ok_or_else(|| {
                JobError::InvalidDelay(format!("{:?} is too far in the future", delay))
            })?;

        let mut job = NewJob::with_payload(job_type, payload)?;
        job.max_attempts = self.config.max_attempts;
        job.scheduled_at = Some(scheduled_at);
        self.queue.enqueue(job).await
    }

    /// Lease and run one job.
    ///
    /// Returns `Ok(None)` when nothing is ready. Handler failures are
    /// recorded on the job, not returned; only store errors surface here.
    pub async fn process_next_job(&self) -> JobResult<Option<ProcessedJob>> {
        let Some(job) = self.queue.lease_next_ready(&self.config.worker_id).await? else {
            return Ok(None);
        };

        debug!(
            job_id = job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            "executing job"
        );

        let worker_id = self.config.worker_id.as_str();
        let outcome = match self.registry.dispatch(&job.job_type, job.payload.clone()) {
            None => {
                let message = format!("no handler registered for job type: {}", job.job_type);
                warn!(job_id = job.id, job_type = %job.job_type, "{}", message);
                let settled = self.queue.fail_permanently(job.id, worker_id, &message).await;
                settle(&job, settled, JobOutcome::Failed { error: message })?
            }
            Some(handler) => match self.execute_with_heartbeat(job.id, handler).await {
                Ok(()) => {
                    info!(job_id = job.id, job_type = %job.job_type, "job succeeded");
                    let settled = self.queue.complete(job.id, worker_id).await;
                    settle(&job, settled, JobOutcome::Completed)?
                }
                Err(e) => self.record_failure(&job, e).await?,
            },
        };

        Ok(Some(ProcessedJob {
            job_id: job.id,
            job_type: job.job_type,
            attempts: job.attempts,
            outcome,
        }))
    }

    /// One poll tick: reclaim stale leases, then run up to `batch_size` jobs.
    ///
    /// Store errors end the tick early; the next tick starts over.
    pub async fn run_tick(&self, shutdown: &CancellationToken) -> usize {
        if let Err(e) = self.queue.reclaim_expired_leases().await {
            error!(error = %e, "failed to reclaim expired leases");
            return 0;
        }

        let mut processed = 0;
        while processed < self.config.batch_size.max(1) {
            if shutdown.is_cancelled() {
                break;
            }

            match self.process_next_job().await {
                Ok(Some(_)) => processed += 1,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "job tick aborted");
                    break;
                }
            }
        }

        processed
    }

    async fn record_failure(&self, job: &Job, error: anyhow::Error) -> JobResult<JobOutcome> {
        let message = format!("{:#}", error);

        if job.attempts_exhausted() {
            warn!(
                job_id = job.id,
                job_type = %job.job_type,
                attempts = job.attempts,
                error = %message,
                "job failed permanently"
            );
            let settled = self
                .queue
                .fail_permanently(job.id, &self.config.worker_id, &message)
                .await;
            return settle(job, settled, JobOutcome::Failed { error: message });
        }

        let next_attempt_at = self.clock.now() + retry_delay(job.attempts);
        warn!(
            job_id = job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            next_attempt_at = %next_attempt_at,
            error = %message,
            "job failed, retry scheduled"
        );
        let settled = self
            .queue
            .reschedule_for_retry(job.id, &self.config.worker_id, &message, next_attempt_at)
            .await;

        settle(
            job,
            settled,
            JobOutcome::Retrying {
                next_attempt_at,
                error: message,
            },
        )
    }

    /// Run a handler to completion while keeping its lease alive.
    ///
    /// A panicking handler is reported as an ordinary failure.
    async fn execute_with_heartbeat(
        &self,
        job_id: i64,
        handler: HandlerFuture,
    ) -> anyhow::Result<()> {
        let queue = Arc::clone(&self.queue);
        let worker_id = self.config.worker_id.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_cancel = CancellationToken::new();

        let cancel = heartbeat_cancel.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match queue.heartbeat(job_id, &worker_id).await {
                            Ok(()) => {}
                            Err(JobError::LeaseLost { .. }) => {
                                warn!(
                                    job_id,
                                    worker_id = %worker_id,
                                    "lease lost while job was running"
                                );
                                break;
                            }
                            Err(e) => warn!(job_id, error = %e, "heartbeat failed"),
                        }
                    }
                }
            }
        });

        let result = AssertUnwindSafe(handler)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(anyhow!("handler panicked: {}", panic_message(&*panic))));

        heartbeat_cancel.cancel();
        if let Err(e) = heartbeat_handle.await {
            error!(job_id, error = %e, "heartbeat task ended abnormally");
        }

        result
    }

    async fn run_poll_loop(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            handlers = ?self.registry.registered_types(),
            "job runner starting"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            self.run_tick(&shutdown).await;
        }

        info!(worker_id = %self.config.worker_id, "job runner stopped");
    }

    async fn run_maintenance_loop(self: Arc<Self>, shutdown: CancellationToken) {
        // The first tick fires immediately, so maintenance is enqueued at startup.
        let mut interval = tokio::time::interval(self.config.maintenance_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            maintenance::enqueue_maintenance_jobs(self.queue.as_ref(), self.config.max_attempts)
                .await;
        }

        debug!("maintenance scheduler stopped");
    }
}

/// Map a settle call's result to the outcome, absorbing a lost lease.
fn settle(job: &Job, settled: JobResult<()>, outcome: JobOutcome) -> JobResult<JobOutcome> {
    match settled {
        Ok(()) => Ok(outcome),
        Err(JobError::LeaseLost { worker_id, .. }) => {
            warn!(
                job_id = job.id,
                job_type = %job.job_type,
                worker_id = %worker_id,
                ?outcome,
                "lease lost before the result was recorded, dropping it"
            );
            Ok(JobOutcome::LeaseLost)
        }
        Err(e) => Err(e),
    }
}

/// Setup phase of the job processor.
///
/// Handlers can only be registered here; [`JobProcessor::start`] consumes the
/// processor, so the registry is never mutated while jobs are running.
pub struct JobProcessor {
    runner: JobRunner,
}

impl JobProcessor {
    /// Create a processor with an empty registry.
    pub fn new(queue: Arc<dyn JobQueue>, clock: SharedClock, config: JobRunnerConfig) -> Self {
        Self {
            runner: JobRunner {
                queue,
                registry: JobRegistry::new(),
                clock,
                config,
            },
        }
    }

    /// Create a processor over SQLite with the maintenance handlers registered.
    pub fn with_builtin_handlers(
        pool: SqlitePool,
        clock: SharedClock,
        config: JobRunnerConfig,
    ) -> Self {
        let lease_duration = chrono::Duration::from_std(config.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_LEASE_SECS));
        let queue =
            SqliteJobQueue::with_lease_duration(pool.clone(), clock.clone(), lease_duration);

        let mut processor = Self::new(Arc::new(queue), clock.clone(), config);
        maintenance::register_maintenance_handlers(&mut processor.runner.registry, pool, clock);
        processor
    }

    /// Register a handler for `job_type`, replacing any earlier one.
    pub fn register_handler<F, Fut>(&mut self, job_type: impl Into<String>, handler: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.runner.registry.register(job_type, handler);
    }

    /// Direct access to the registry, e.g. for typed handlers.
    pub fn registry_mut(&mut self) -> &mut JobRegistry {
        &mut self.runner.registry
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    /// Finish setup without spawning loops; useful for driving ticks by hand.
    pub fn into_runner(self) -> JobRunner {
        self.runner
    }

    pub async fn enqueue<P>(&self, job_type: &str, payload: &P) -> JobResult<Job>
    where
        P: Serialize + ?Sized,
    {
        self.runner.enqueue(job_type, payload).await
    }

    pub async fn enqueue_delayed<P>(
        &self,
        job_type: &str,
        payload: &P,
        delay: Duration,
    ) -> JobResult<Job>
    where
        P: Serialize + ?Sized,
    {
        self.runner.enqueue_delayed(job_type, payload, delay).await
    }

    /// Spawn the poll loop (and maintenance loop, if enabled).
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> ProcessorHandle {
        let runner = Arc::new(self.runner);
        let shutdown = CancellationToken::new();

        let mut tasks = vec![tokio::spawn(
            Arc::clone(&runner).run_poll_loop(shutdown.clone()),
        )];
        if runner.config.schedule_maintenance {
            tasks.push(tokio::spawn(
                Arc::clone(&runner).run_maintenance_loop(shutdown.clone()),
            ));
        }

        ProcessorHandle {
            runner,
            shutdown,
            tasks,
        }
    }
}

/// Handle to a started processor.
pub struct ProcessorHandle {
    runner: Arc<JobRunner>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ProcessorHandle {
    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    pub async fn enqueue<P>(&self, job_type: &str, payload: &P) -> JobResult<Job>
    where
        P: Serialize + ?Sized,
    {
        self.runner.enqueue(job_type, payload).await
    }

    pub async fn enqueue_delayed<P>(
        &self,
        job_type: &str,
        payload: &P,
        delay: Duration,
    ) -> JobResult<Job>
    where
        P: Serialize + ?Sized,
    {
        self.runner.enqueue_delayed(job_type, payload, delay).await
    }

    /// Signal both loops to exit and wait for them.
    ///
    /// A handler that is already running finishes first; no job is leased
    /// after this returns.
    pub async fn stop(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "job processor task ended abnormally");
            }
        }
    }

    /// Run until Ctrl+C, then stop.
    pub async fn run_until_shutdown(self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("received shutdown signal");
        self.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = JobRunnerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.maintenance_interval, Duration::from_secs(86_400));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_attempts, 3);
        assert!(config.worker_id.starts_with("runner-"));
    }

    #[test]
    fn test_config_with_worker_id() {
        let config = JobRunnerConfig::with_worker_id("my-runner");
        assert_eq!(config.worker_id, "my-runner");
    }
}
