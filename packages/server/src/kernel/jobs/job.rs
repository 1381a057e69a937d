//! Job model for background work.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use super::error::JobResult;

/// Attempts allowed before a job is failed permanently.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Completed and failed jobs never move again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Transition table: `pending -> running`, `running -> completed | pending | failed`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Pending)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

// ============================================================================
// Job Model
// ============================================================================

/// A persisted job row.
#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,

    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub job_type: String,

    /// Opaque JSON document handed to the handler verbatim.
    pub payload: String,

    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,

    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,

    // Lease management
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Whether the job may be leased at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    /// Whether another failure should fail the job permanently.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// A job about to be inserted.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewJob {
    pub job_type: String,

    #[builder(default = "null".to_string())]
    pub payload: String,

    /// `None` means "now" according to the queue's clock.
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,

    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: i32,
}

impl NewJob {
    /// Immediate job with a JSON-serialized payload.
    pub fn with_payload<P: Serialize + ?Sized>(job_type: &str, payload: &P) -> JobResult<Self> {
        Ok(Self::builder()
            .job_type(job_type)
            .payload(serde_json::to_string(payload)?)
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn sample_job(now: DateTime<Utc>) -> Job {
        Job {
            id: 1,
            job_type: "test_job".to_string(),
            payload: "null".to_string(),
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            lease_expires_at: None,
            worker_id: None,
            created_at: now,
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn pending_job_due_now_is_ready() {
        assert!(sample_job(noon()).is_ready(noon()));
    }

    #[test]
    fn future_job_is_not_ready() {
        let job = sample_job(noon() + Duration::seconds(1));
        assert!(!job.is_ready(noon()));
    }

    #[test]
    fn running_job_is_not_ready() {
        let mut job = sample_job(noon());
        job.status = JobStatus::Running;
        assert!(!job.is_ready(noon()));
    }

    #[test]
    fn attempts_exhausted_at_max() {
        let mut job = sample_job(noon());
        job.attempts = 2;
        assert!(!job.attempts_exhausted());
        job.attempts = 3;
        assert!(job.attempts_exhausted());
    }

    #[test]
    fn transition_table_allows_lifecycle_edges() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Pending));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [JobStatus::Completed, JobStatus::Failed] {
            assert!(terminal.is_terminal());
            for next in JobStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn pending_cannot_skip_running() {
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("RUNNING".parse::<JobStatus>(), Ok(JobStatus::Running));
        assert!("dead_letter".parse::<JobStatus>().is_err());
    }

    #[test]
    fn new_job_defaults() {
        let job = NewJob::builder().job_type("cleanup_sessions").build();
        assert_eq!(job.payload, "null");
        assert_eq!(job.max_attempts, 3);
        assert!(job.scheduled_at.is_none());
    }

    #[test]
    fn with_payload_serializes_json() {
        let job = NewJob::with_payload("send_email", &serde_json::json!({"to": "a@b.c"})).unwrap();
        assert_eq!(job.payload, r#"{"to":"a@b.c"}"#);
    }

    #[test]
    fn job_serializes_type_field() {
        let value = serde_json::to_value(sample_job(noon())).unwrap();
        assert_eq!(value["type"], "test_job");
        assert_eq!(value["status"], "pending");
    }
}
