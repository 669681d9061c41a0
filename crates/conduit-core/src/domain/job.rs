//! Job record and state transitions.
//!
//! Design:
//! - `JobRecord` is the single source of truth for a job and is persisted as one
//!   store record (`job:{id}`).
//! - State transitions happen through methods that return whether they applied,
//!   so the queue can perform them inside a compare-and-swap loop.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::JobId;
use super::outcome::{HandlerError, JobOutput};
use super::payload::JobPayload;
use crate::queue::RetryPolicy;

/// Job state.
///
/// State transitions:
/// - waiting -> active -> completed
/// - waiting -> active -> waiting (retry with backoff, until max_attempts)
/// - waiting -> active -> failed (retry budget exhausted / permanent failure)
/// - waiting | active -> cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible for claim once `run_at` has passed.
    Waiting,

    /// Claimed by a worker.
    Active,

    Completed,

    /// Retry budget exhausted, or the handler reported a permanent failure.
    Failed,

    Cancelled,
}

impl JobState {
    /// Live jobs hold their dedup key.
    pub fn is_live(self) -> bool {
        matches!(self, JobState::Waiting | JobState::Active)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }
}

/// Per-enqueue overrides. Anything left unset falls back to the queue defaults.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub max_attempts: Option<u32>,
    pub backoff: Option<RetryPolicy>,
    /// Delay before the first attempt becomes claimable.
    pub delay: Duration,
}

impl EnqueueOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// What happened to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Back to `waiting`; claimable again after `delay`.
    Retrying { attempts: u32, delay: Duration },

    /// Moved to `failed`.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub dedup_key: String,
    pub payload: JobPayload,
    pub state: JobState,

    /// Number of attempts started (including the current one while active).
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: RetryPolicy,

    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    pub last_error: Option<String>,
    pub output: Option<JobOutput>,
}

impl JobRecord {
    pub fn new(
        id: JobId,
        dedup_key: impl Into<String>,
        payload: JobPayload,
        max_attempts: u32,
        backoff: RetryPolicy,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            queue: payload.queue_name().to_string(),
            dedup_key: dedup_key.into(),
            payload,
            state: JobState::Waiting,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            backoff,
            enqueued_at: now,
            run_at: now + to_chrono(delay),
            started_at: None,
            finished_at: None,
            updated_at: now,
            last_error: None,
            output: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Waiting && self.run_at <= now
    }

    /// waiting -> active. Counts the attempt.
    pub fn claim(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_due(now) || self.attempts >= self.max_attempts {
            return false;
        }
        self.state = JobState::Active;
        self.attempts += 1;
        self.started_at = Some(now);
        self.updated_at = now;
        true
    }

    /// active -> completed.
    pub fn complete(&mut self, output: JobOutput, now: DateTime<Utc>) -> bool {
        if self.state != JobState::Active {
            return false;
        }
        self.state = JobState::Completed;
        self.output = Some(output);
        self.last_error = None;
        self.finished_at = Some(now);
        self.updated_at = now;
        true
    }

    /// active -> waiting (backoff) or failed. `None` if the job is no longer active.
    pub fn fail(&mut self, error: &HandlerError, now: DateTime<Utc>) -> Option<FailDisposition> {
        if self.state != JobState::Active {
            return None;
        }
        self.last_error = Some(error.message());
        self.updated_at = now;

        if error.is_retryable() && self.attempts < self.max_attempts {
            let delay = self.backoff.next_delay(self.attempts);
            self.state = JobState::Waiting;
            self.run_at = now + to_chrono(delay);
            Some(FailDisposition::Retrying {
                attempts: self.attempts,
                delay,
            })
        } else {
            self.state = JobState::Failed;
            self.finished_at = Some(now);
            Some(FailDisposition::Exhausted {
                attempts: self.attempts,
            })
        }
    }

    /// waiting | active -> cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if !self.state.is_live() {
            return false;
        }
        self.state = JobState::Cancelled;
        self.finished_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Return an orphaned active job (its worker is gone) to the queue.
    ///
    /// The lost attempt stays counted; if it was the last one the job fails.
    pub fn release_lost_lease(&mut self, now: DateTime<Utc>) -> bool {
        if self.state != JobState::Active {
            return false;
        }
        self.updated_at = now;
        if self.attempts >= self.max_attempts {
            self.state = JobState::Failed;
            self.last_error = Some("lease lost during final attempt".to_string());
            self.finished_at = Some(now);
        } else {
            self.state = JobState::Waiting;
            self.run_at = now;
        }
        true
    }

    pub fn handle(&self, coalesced: bool) -> JobHandle {
        JobHandle {
            id: self.id,
            queue: self.queue.clone(),
            dedup_key: self.dedup_key.clone(),
            state: self.state,
            coalesced,
        }
    }
}

/// Reference returned by `enqueue`.
///
/// Enqueue is fire-and-forget: the handle identifies the job but completion is
/// only observable through the entity status machine or the task recorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: JobId,
    pub queue: String,
    pub dedup_key: String,
    pub state: JobState,
    /// True when the enqueue matched an existing live job instead of creating one.
    pub coalesced: bool,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    // Out-of-range delays are clamped to ten years.
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}
