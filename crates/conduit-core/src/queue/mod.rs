//! Queue module: job queue, leases, scheduling, and retry policy.

mod job_queue;
mod lease;
mod retry;
mod schedule;

pub use job_queue::{JobQueue, QueueSettings, RecoveryReport};
pub use lease::JobLease;
pub use retry::RetryPolicy;

