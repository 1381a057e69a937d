use thiserror::Error;

use super::job::JobStatus;

/// Errors raised by the job store.
///
/// Handler failures are not represented here; they are `anyhow::Error`s that
/// the runner turns into state transitions.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job {0} not found")]
    NotFound(i64),

    #[error("Job {id} cannot move from {from} to {to}")]
    IllegalTransition {
        id: i64,
        from: JobStatus,
        to: JobStatus,
    },

    /// The row is no longer leased to this worker (reclaimed and possibly
    /// re-leased elsewhere).
    #[error("Job {id} is no longer leased to {worker_id}")]
    LeaseLost { id: i64, worker_id: String },

    #[error("Invalid delay: {0}")]
    InvalidDelay(String),
}

pub type JobResult<T> = std::result::Result<T, JobError>;
