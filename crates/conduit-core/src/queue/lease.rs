//! JobLease - worker が job を実行している間だけ持つ権利
//!
//! Design intent:
//! - Queue manages state transitions (waiting -> active -> ...).
//! - Worker executes side effects and reports the result through the lease.
//! - Reports are checked against the persisted state: a report for a job that is
//!   no longer `active` (e.g. cancelled meanwhile) is stale and discarded.

use tokio_util::sync::CancellationToken;

use super::job_queue::JobQueue;
use crate::domain::{FailDisposition, HandlerError, JobId, JobOutput, JobRecord, Result};
use crate::typed::JobContext;

pub struct JobLease {
    queue: JobQueue,
    job: JobRecord,
    token: CancellationToken,
    lease_seq: u64,
}

impl JobLease {
    pub(super) fn new(queue: JobQueue, job: JobRecord, token: CancellationToken, lease_seq: u64) -> Self {
        Self {
            queue,
            job,
            token,
            lease_seq,
        }
    }

    /// Snapshot of the job as it was claimed.
    pub fn job(&self) -> &JobRecord {
        &self.job
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    /// Context handed to the handler; carries the cancellation signal.
    pub fn context(&self) -> JobContext {
        JobContext::new(
            self.job.id,
            self.job.attempts,
            self.job.max_attempts,
            self.token.clone(),
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Mark success. `false` if the report was stale.
    pub async fn complete(self, output: JobOutput) -> Result<bool> {
        self.queue.complete_job(self.job.id, output).await
    }

    /// Mark failure; the queue decides between retry and `failed`.
    /// `None` if the report was stale.
    pub async fn fail(self, error: &HandlerError) -> Result<Option<FailDisposition>> {
        self.queue.fail_job(self.job.id, error).await
    }

    /// The handler stopped on cancellation. Returns whether the job is now `cancelled`.
    pub async fn report_cancelled(self) -> Result<bool> {
        self.queue.cancelled_by_handler(self.job.id).await
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        self.queue.forget_lease(self.job.id, self.lease_seq);
    }
}

impl std::fmt::Debug for JobLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLease")
            .field("job_id", &self.job.id)
            .field("queue", &self.job.queue)
            .field("attempt", &self.job.attempts)
            .finish()
    }
}
