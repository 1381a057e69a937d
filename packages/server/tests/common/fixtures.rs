//! Test fixtures for creating test data.

use std::time::Duration;

use anyhow::Result;
use scaffold_core::kernel::jobs::{Job, JobQueue, JobStatus};

/// Poll `queue` until job `id` reaches `status` or `timeout` passes.
pub async fn wait_for_status(
    queue: &dyn JobQueue,
    id: i64,
    status: JobStatus,
    timeout: Duration,
) -> Result<Job> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = queue.find_by_id(id).await?;
        if job.status == status {
            return Ok(job);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "job {} still {} after {:?} (wanted {})",
                id,
                job.status,
                timeout,
                status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
