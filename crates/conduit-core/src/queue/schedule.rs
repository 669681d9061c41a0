//! Per-queue wake-up schedule.
//!
//! The store holds the truth about every job; this is only the in-process index of
//! "which job ids may be claimable, and when". Entries can be stale (cancelled,
//! claimed elsewhere, rescheduled); the claim itself re-checks the record.
//!
//! A job id is held at most once until it is popped, so periodic rescans of the
//! store do not pile up duplicates.

use std::collections::{BinaryHeap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::domain::JobId;

/// Scheduled entry for the priority queue.
///
/// We use Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Scheduled {
    run_at: DateTime<Utc>,
    job_id: JobId,
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering: earlier times have higher priority
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.job_id.cmp(&self.job_id))
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Scheduled>,
    pending: HashSet<JobId>,
    last_scan: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub(crate) struct Schedule {
    state: Mutex<State>,
    notify: Notify,
}

impl Schedule {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false if the job is already scheduled here.
    pub fn push(&self, job_id: JobId, run_at: DateTime<Utc>) -> bool {
        let mut state = self.state();
        if !state.pending.insert(job_id) {
            return false;
        }
        state.heap.push(Scheduled { run_at, job_id });
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Pop the earliest entry whose time has come.
    pub fn pop_due(&self, now: DateTime<Utc>) -> Option<JobId> {
        let mut state = self.state();
        match state.heap.peek() {
            Some(entry) if entry.run_at <= now => {
                let job_id = state.heap.pop()?.job_id;
                state.pending.remove(&job_id);
                Some(job_id)
            }
            _ => None,
        }
    }

    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        self.state().heap.peek().map(|e| e.run_at)
    }

    pub fn len(&self) -> usize {
        self.state().heap.len()
    }

    /// Claim the right to rescan the store, at most once per `every`.
    pub fn begin_scan(&self, now: DateTime<Utc>, every: Duration) -> bool {
        let mut state = self.state();
        let due = state.last_scan.is_none_or(|last| {
            (now - last).to_std().is_ok_and(|elapsed| elapsed >= every)
        });
        if due {
            state.last_scan = Some(now);
        }
        due
    }

    /// Sleep until something is pushed, the next entry is due, or `max_wait` passes.
    pub async fn wait(&self, now: DateTime<Utc>, max_wait: Duration) {
        let wait = self
            .next_run_at()
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
            .map_or(max_wait, |until_due| until_due.min(max_wait));

        if wait.is_zero() {
            tokio::task::yield_now().await;
            return;
        }
        tokio::select! {
            _ = self.notify.notified() => {},
            _ = tokio::time::sleep(wait) => {},
        }
    }
}
