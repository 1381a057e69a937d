//! Job infrastructure for background work.
//!
//! This module provides the kernel-level infrastructure for job execution:
//! - [`SqliteJobQueue`] - Database-backed job queue (lease, complete, retry, fail)
//! - [`JobRegistry`] - Job type to handler mapping
//! - [`JobProcessor`] / [`ProcessorHandle`] - Poll loop and maintenance loop lifecycle
//! - [`Job`] - Job model and status transition table
//!
//! # Architecture
//!
//! ```text
//! Caller calls handle.enqueue(type, payload)
//!     │
//!     └─► SqliteJobQueue.enqueue()  (status = pending)
//!
//! JobRunner (every poll_interval)
//!     │
//!     ├─► reclaim_expired_leases()
//!     ├─► lease_next_ready()        (pending -> running, attempts + 1)
//!     ├─► JobRegistry.dispatch()
//!     └─► complete / reschedule_for_retry / fail_permanently
//! ```

mod backoff;
mod error;
mod job;
pub mod maintenance;
mod queue;
mod registry;
mod runner;

pub use backoff::retry_delay;
pub use error::{JobError, JobResult};
pub use job::{Job, JobStatus, NewJob, DEFAULT_MAX_ATTEMPTS};
pub use queue::{
    JobQueue, JobStats, ReclaimSummary, SqliteJobQueue, DEFAULT_LEASE_SECS, LEASE_EXPIRED_ERROR,
};
pub use registry::{HandlerFuture, JobRegistry, SharedJobRegistry};
pub use runner::{
    JobOutcome, JobProcessor, JobRunner, JobRunnerConfig, ProcessedJob, ProcessorHandle,
};
