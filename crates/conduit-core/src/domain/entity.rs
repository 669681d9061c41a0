//! Entity indexing-status record.
//!
//! State transitions:
//! - none | indexed | error -> queued            (retry)
//! - queued -> indexing                           (worker claimed the job)
//! - indexing -> queued                           (transient failure, backoff)
//! - queued | indexing -> indexed | error         (job finished)
//! - queued | indexing -> none                    (job cancelled)
//!
//! Every worker-driven transition names the job it comes from. A record linked to
//! a different job ignores it, so late reports from an old job cannot clobber a
//! newer attempt. Only `attach_job` and `mark_indexing` accept a record that is
//! not linked yet; finishing transitions need the exact job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{EntityId, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexingStatus {
    /// A record exists but no indexing is pending or has finished.
    None,
    Queued,
    Indexing,
    Indexed,
    Error,
}

impl IndexingStatus {
    /// A job is (supposed to be) waiting or running for this entity.
    pub fn is_in_flight(self) -> bool {
        matches!(self, IndexingStatus::Queued | IndexingStatus::Indexing)
    }
}

impl std::fmt::Display for IndexingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IndexingStatus::None => "none",
            IndexingStatus::Queued => "queued",
            IndexingStatus::Indexing => "indexing",
            IndexingStatus::Indexed => "indexed",
            IndexingStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStatusRecord {
    pub entity_id: EntityId,
    pub indexing_status: IndexingStatus,
    pub indexing_attempts: u32,
    /// Set only while the status is `error`.
    pub indexing_error: Option<String>,
    /// Job currently driving this entity. `None` between "marked queued" and
    /// "job created", and whenever nothing is in flight.
    pub job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl EntityStatusRecord {
    pub fn new(entity_id: EntityId, now: DateTime<Utc>) -> Self {
        Self {
            entity_id,
            indexing_status: IndexingStatus::None,
            indexing_attempts: 0,
            indexing_error: None,
            job_id: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    fn owned_by(&self, job_id: JobId) -> bool {
        self.job_id.is_none_or(|current| current == job_id)
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
    }

    /// Enter `queued` for a fresh attempt. Refused (returns the current status)
    /// while something is in flight.
    pub fn mark_queued(&mut self, now: DateTime<Utc>) -> Result<(), IndexingStatus> {
        if self.indexing_status.is_in_flight() {
            return Err(self.indexing_status);
        }
        self.requeue(now);
        Ok(())
    }

    /// Enter `queued` regardless of the current status. Used only after the
    /// caller has established that the in-flight job no longer exists.
    pub fn requeue_orphan(&mut self, now: DateTime<Utc>) {
        self.requeue(now);
    }

    fn requeue(&mut self, now: DateTime<Utc>) {
        self.indexing_status = IndexingStatus::Queued;
        self.indexing_attempts += 1;
        self.indexing_error = None;
        self.job_id = None;
        self.touch(now);
    }

    /// Link the job created for the current attempt.
    pub fn attach_job(&mut self, job_id: JobId, now: DateTime<Utc>) -> bool {
        if !self.indexing_status.is_in_flight() || !self.owned_by(job_id) {
            return false;
        }
        self.job_id = Some(job_id);
        self.touch(now);
        true
    }

    /// queued -> indexing.
    pub fn mark_indexing(&mut self, job_id: JobId, now: DateTime<Utc>) -> bool {
        if self.indexing_status != IndexingStatus::Queued || !self.owned_by(job_id) {
            return false;
        }
        self.indexing_status = IndexingStatus::Indexing;
        self.job_id = Some(job_id);
        self.touch(now);
        true
    }

    /// indexing -> queued after a transient failure; the next attempt is counted.
    pub fn mark_retrying(&mut self, job_id: JobId, now: DateTime<Utc>) -> bool {
        if self.indexing_status != IndexingStatus::Indexing || self.job_id != Some(job_id) {
            return false;
        }
        self.indexing_status = IndexingStatus::Queued;
        self.indexing_attempts += 1;
        self.job_id = Some(job_id);
        self.touch(now);
        true
    }

    pub fn mark_indexed(&mut self, job_id: JobId, now: DateTime<Utc>) -> bool {
        self.finish(job_id, IndexingStatus::Indexed, None, now)
    }

    pub fn mark_error(&mut self, job_id: JobId, error: String, now: DateTime<Utc>) -> bool {
        self.finish(job_id, IndexingStatus::Error, Some(error), now)
    }

    /// queued | indexing -> none, so a future retry is possible.
    pub fn mark_cancelled(&mut self, job_id: JobId, now: DateTime<Utc>) -> bool {
        self.finish(job_id, IndexingStatus::None, None, now)
    }

    fn finish(
        &mut self,
        job_id: JobId,
        status: IndexingStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        // 未紐づけの record は終わらせない（前の attempt の遅い報告かもしれない）
        if !self.indexing_status.is_in_flight() || self.job_id != Some(job_id) {
            return false;
        }
        self.indexing_status = status;
        self.indexing_error = error;
        self.job_id = None;
        self.touch(now);
        true
    }

    pub fn view(&self) -> StatusView {
        StatusView {
            indexing_status: self.indexing_status,
            indexing_error: self.indexing_error.clone(),
            indexing_attempts: self.indexing_attempts,
        }
    }
}

/// The externally visible part of a status record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub indexing_status: IndexingStatus,
    pub indexing_error: Option<String>,
    pub indexing_attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    fn job() -> JobId {
        JobId::from_ulid(Ulid::new())
    }

    fn record(status: IndexingStatus) -> EntityStatusRecord {
        let mut rec = EntityStatusRecord::new(EntityId::new("conv-1"), Utc::now());
        rec.indexing_status = status;
        rec
    }

    #[rstest]
    #[case::none(IndexingStatus::None, true)]
    #[case::queued(IndexingStatus::Queued, false)]
    #[case::indexing(IndexingStatus::Indexing, false)]
    #[case::indexed(IndexingStatus::Indexed, true)]
    #[case::error(IndexingStatus::Error, true)]
    fn mark_queued_is_refused_while_in_flight(
        #[case] status: IndexingStatus,
        #[case] allowed: bool,
    ) {
        let mut rec = record(status);
        let result = rec.mark_queued(Utc::now());
        assert_eq!(result.is_ok(), allowed);
        if allowed {
            assert_eq!(rec.indexing_status, IndexingStatus::Queued);
            assert_eq!(rec.indexing_attempts, 1);
        } else {
            assert_eq!(result, Err(status));
            assert_eq!(rec.indexing_attempts, 0);
        }
    }

    #[test]
    fn full_attempt_cycle() {
        let now = Utc::now();
        let id = job();
        let mut rec = record(IndexingStatus::None);

        rec.mark_queued(now).unwrap();
        assert!(rec.attach_job(id, now));
        assert!(rec.mark_indexing(id, now));
        assert!(rec.mark_retrying(id, now));
        assert_eq!(rec.indexing_attempts, 2);
        assert!(rec.mark_indexing(id, now));
        assert!(rec.mark_error(id, "embedder down".into(), now));

        assert_eq!(
            rec.view(),
            StatusView {
                indexing_status: IndexingStatus::Error,
                indexing_error: Some("embedder down".into()),
                indexing_attempts: 2,
            }
        );
        assert_eq!(rec.job_id, None);
    }

    #[test]
    fn worker_may_claim_before_the_job_is_attached() {
        let now = Utc::now();
        let id = job();
        let mut rec = record(IndexingStatus::None);
        rec.mark_queued(now).unwrap();

        assert!(rec.mark_indexing(id, now));
        assert!(rec.attach_job(id, now));
        assert_eq!(rec.job_id, Some(id));
    }

    #[test]
    fn reports_from_a_foreign_job_are_ignored() {
        let now = Utc::now();
        let mut rec = record(IndexingStatus::None);
        rec.mark_queued(now).unwrap();
        rec.attach_job(job(), now);

        let stale = job();
        assert!(!rec.mark_indexing(stale, now));
        assert!(!rec.mark_indexed(stale, now));
        assert!(!rec.mark_cancelled(stale, now));
        assert_eq!(rec.indexing_status, IndexingStatus::Queued);
    }

    #[test]
    fn late_report_cannot_finish_an_unlinked_attempt() {
        let now = Utc::now();
        let mut rec = record(IndexingStatus::None);
        rec.mark_queued(now).unwrap();

        assert!(!rec.mark_cancelled(job(), now));
        assert!(!rec.mark_indexed(job(), now));
        assert_eq!(rec.indexing_status, IndexingStatus::Queued);
    }

    #[test]
    fn cancellation_returns_to_none() {
        let now = Utc::now();
        let id = job();
        let mut rec = record(IndexingStatus::None);
        rec.mark_queued(now).unwrap();
        rec.attach_job(id, now);
        rec.mark_indexing(id, now);

        assert!(rec.mark_cancelled(id, now));
        assert_eq!(rec.indexing_status, IndexingStatus::None);
        assert_eq!(rec.indexing_error, None);
        assert!(rec.mark_queued(now).is_ok());
    }

    #[test]
    fn view_serializes_camel_case() {
        let v = serde_json::to_value(record(IndexingStatus::Indexed).view()).unwrap();
        assert_eq!(v["indexingStatus"], "indexed");
        assert_eq!(v["indexingAttempts"], 0);
        assert!(v["indexingError"].is_null());
    }
}
