//! EntityStatusMachine - entity ごとの indexing status（single-flight）
//!
//! # 不変条件
//! - `queued | indexing` の間は新しい attempt を受け付けない（Conflict。エラーではない）
//! - 遷移は 1 レコードに対する条件付き read-modify-write。retry と enqueue は
//!   キーをまたぐトランザクションではない
//!
//! # 孤児（orphan）の修復
//! enqueue の途中でプロセスが落ちると、job のない `queued` が残りうる。
//! `get_status` / `retry` / `reconcile` がこれを検出して直す:
//! - 紐づく job が終端状態: その結果（indexed / error / none）を反映
//! - 紐づく job が存在しない: すぐに再 enqueue
//! - job 未紐づけ: live job があれば紐づけ、なければ repair_grace 経過後に再 enqueue

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::domain::{
    EnqueueOptions, EntityId, EntityStatusRecord, IndexConversation, JobHandle, JobId, JobRecord,
    JobState, PipelineError, Result, StatusView,
};
use crate::ports::{Clock, SharedStore};
use crate::queue::JobQueue;
use crate::store::record::{Update, read_record, update_record};
use crate::store::{StorePool, keys};
use crate::typed::JobKind;

/// Result of [`EntityStatusMachine::retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The entity is `queued` and a job has been enqueued for it.
    Accepted { status: StatusView, job: JobHandle },

    /// An attempt is already in flight; nothing changed.
    Conflict { current: StatusView },
}

impl RetryOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn status(&self) -> &StatusView {
        match self {
            Self::Accepted { status, .. } => status,
            Self::Conflict { current } => current,
        }
    }
}

/// What an in-flight record needs.
enum Diagnosis {
    Healthy,
    /// A live job exists but the record does not name it yet.
    Attach(JobId),
    /// The linked job finished without the record hearing about it.
    Settle(JobRecord),
    /// No job will ever move this record.
    Requeue,
}

enum Step {
    Queued { record: EntityStatusRecord, created: bool },
    Conflict(EntityStatusRecord),
}

#[derive(Clone)]
pub struct EntityStatusMachine {
    pool: StorePool,
    queue: JobQueue,
    clock: Arc<dyn Clock>,
    repair_grace: Duration,
}

impl EntityStatusMachine {
    pub fn new(pool: StorePool, queue: JobQueue, clock: Arc<dyn Clock>, repair_grace: Duration) -> Self {
        Self {
            pool,
            queue,
            clock,
            repair_grace,
        }
    }

    /// Start a new indexing attempt for `entity_id`.
    ///
    /// Creates the record on first reference. Refused with
    /// [`RetryOutcome::Conflict`] while an attempt is queued or running.
    pub async fn retry(&self, entity_id: &EntityId) -> Result<RetryOutcome> {
        self.retry_with(entity_id, EnqueueOptions::default()).await
    }

    /// [`retry`](Self::retry) with per-job overrides for the enqueued job.
    ///
    /// An id the job would be rejected for leaves the store untouched.
    pub async fn retry_with(
        &self,
        entity_id: &EntityId,
        options: EnqueueOptions,
    ) -> Result<RetryOutcome> {
        index_job(entity_id).validate()?;

        let conn = self.pool.acquire().await?;
        let store: &dyn SharedStore = &*conn;
        let key = keys::entity(entity_id);

        if let Some(current) = read_record::<EntityStatusRecord>(store, &key).await?
            && current.indexing_status.is_in_flight()
            && let Some((record, job)) = self.repair(store, &current).await?
        {
            return Ok(RetryOutcome::Accepted {
                status: record.view(),
                job,
            });
        }

        let now = self.clock.now();
        let step = update_record(store, &key, |current: Option<EntityStatusRecord>| {
            let created = current.is_none();
            let mut record =
                current.unwrap_or_else(|| EntityStatusRecord::new(entity_id.clone(), now));
            match record.mark_queued(now) {
                Ok(()) => Update::write(record.clone(), Step::Queued { record, created }),
                Err(_) => Update::skip(Step::Conflict(record)),
            }
        })
        .await?;

        let record = match step {
            Step::Conflict(record) => {
                debug!(entity_id = %entity_id, status = %record.indexing_status, "retry rejected: attempt already in flight");
                return Ok(RetryOutcome::Conflict {
                    current: record.view(),
                });
            }
            Step::Queued { record, created } => {
                if created {
                    store.list_push(keys::ENTITIES, entity_id.as_str()).await?;
                }
                record
            }
        };

        let (record, job) = self.enqueue_and_attach(store, record, options).await?;
        info!(entity_id = %entity_id, attempts = record.indexing_attempts, job_id = %job.id, "indexing queued");
        Ok(RetryOutcome::Accepted {
            status: record.view(),
            job,
        })
    }

    /// Current record, or `None` if the entity was never referenced.
    ///
    /// An orphaned in-flight record is repaired before it is returned.
    pub async fn get_status(&self, entity_id: &EntityId) -> Result<Option<EntityStatusRecord>> {
        let conn = self.pool.acquire().await?;
        let store: &dyn SharedStore = &*conn;
        let key = keys::entity(entity_id);

        let Some(record) = read_record::<EntityStatusRecord>(store, &key).await? else {
            return Ok(None);
        };
        if !record.indexing_status.is_in_flight() {
            return Ok(Some(record));
        }
        if let Some((repaired, _)) = self.repair(store, &record).await? {
            return Ok(Some(repaired));
        }
        read_record(store, &key).await
    }

    /// Scan every entity and repair orphaned in-flight records. Returns how many
    /// records needed attention.
    pub async fn reconcile(&self) -> Result<usize> {
        let conn = self.pool.acquire().await?;
        let store: &dyn SharedStore = &*conn;

        let mut repaired = 0;
        for raw in store.list_range(keys::ENTITIES).await? {
            let entity_id = EntityId::new(raw);
            let Some(record) =
                read_record::<EntityStatusRecord>(store, &keys::entity(&entity_id)).await?
            else {
                continue;
            };
            if !record.indexing_status.is_in_flight() {
                continue;
            }
            if !matches!(self.diagnose(&record).await?, Diagnosis::Healthy) {
                self.repair(store, &record).await?;
                repaired += 1;
            }
        }
        if repaired > 0 {
            info!(repaired, "reconciliation repaired orphaned statuses");
        }
        Ok(repaired)
    }

    /// Release the pooled store connection if it has been idle long enough.
    pub async fn close_if_idle(&self) -> bool {
        self.pool.close_if_idle().await
    }

    /// Every record with an attempt queued or running.
    pub async fn in_flight(&self) -> Result<Vec<EntityStatusRecord>> {
        let conn = self.pool.acquire().await?;
        let store: &dyn SharedStore = &*conn;

        let mut active = Vec::new();
        for raw in store.list_range(keys::ENTITIES).await? {
            let key = keys::entity(&EntityId::new(raw));
            if let Some(record) = read_record::<EntityStatusRecord>(store, &key).await?
                && record.indexing_status.is_in_flight()
            {
                active.push(record);
            }
        }
        Ok(active)
    }

    // ------------------------------------------------------------------
    // worker-driven transitions
    //
    // Each names the job it comes from; reports from a job the record is no
    // longer linked to are ignored and return false.
    // ------------------------------------------------------------------

    pub async fn mark_indexing(&self, entity_id: &EntityId, job_id: JobId) -> Result<bool> {
        self.transition(entity_id, "indexing", |r, now| r.mark_indexing(job_id, now))
            .await
    }

    pub async fn mark_retrying(&self, entity_id: &EntityId, job_id: JobId) -> Result<bool> {
        self.transition(entity_id, "queued", |r, now| r.mark_retrying(job_id, now))
            .await
    }

    pub async fn mark_indexed(&self, entity_id: &EntityId, job_id: JobId) -> Result<bool> {
        self.transition(entity_id, "indexed", |r, now| r.mark_indexed(job_id, now))
            .await
    }

    pub async fn mark_error(&self, entity_id: &EntityId, job_id: JobId, error: &str) -> Result<bool> {
        self.transition(entity_id, "error", |r, now| {
            r.mark_error(job_id, error.to_string(), now)
        })
        .await
    }

    pub async fn mark_cancelled(&self, entity_id: &EntityId, job_id: JobId) -> Result<bool> {
        self.transition(entity_id, "none", |r, now| r.mark_cancelled(job_id, now))
            .await
    }

    /// The caller cancelled `job_id`, which was live until now. An attempt that
    /// has not linked its job yet is linked to it first, so the record settles
    /// to `none` instead of waiting for orphan repair.
    pub async fn cancel_attempt(&self, entity_id: &EntityId, job_id: JobId) -> Result<bool> {
        self.transition(entity_id, "none", |r, now| {
            r.attach_job(job_id, now) && r.mark_cancelled(job_id, now)
        })
        .await
    }

    async fn transition<F>(&self, entity_id: &EntityId, target: &'static str, apply: F) -> Result<bool>
    where
        F: Fn(&mut EntityStatusRecord, DateTime<Utc>) -> bool,
    {
        let conn = self.pool.acquire().await?;
        let now = self.clock.now();
        let applied = update_record(
            &*conn,
            &keys::entity(entity_id),
            |current: Option<EntityStatusRecord>| {
                let Some(mut record) = current else {
                    return Update::skip(false);
                };
                if apply(&mut record, now) {
                    Update::write(record, true)
                } else {
                    Update::skip(false)
                }
            },
        )
        .await?;

        if applied {
            debug!(entity_id = %entity_id, status = target, "entity status updated");
        } else {
            debug!(entity_id = %entity_id, status = target, "stale status transition ignored");
        }
        Ok(applied)
    }

    // ------------------------------------------------------------------
    // orphan repair
    // ------------------------------------------------------------------

    async fn diagnose(&self, record: &EntityStatusRecord) -> Result<Diagnosis> {
        match record.job_id {
            Some(job_id) => match self.queue.get(job_id).await? {
                Some(job) if job.state.is_live() => Ok(Diagnosis::Healthy),
                Some(job) => Ok(Diagnosis::Settle(job)),
                None => Ok(Diagnosis::Requeue),
            },
            None => {
                let entity = record.entity_id.as_str();
                if let Some(job) = self.queue.find_live(IndexConversation::QUEUE, entity).await? {
                    return Ok(Diagnosis::Attach(job.id));
                }
                let idle = self.clock.now() - record.last_activity_at;
                let grace = chrono::Duration::from_std(self.repair_grace)
                    .unwrap_or(chrono::Duration::days(3650));
                if idle >= grace {
                    Ok(Diagnosis::Requeue)
                } else {
                    Ok(Diagnosis::Healthy)
                }
            }
        }
    }

    /// Repair `observed` if it is orphaned. Returns the record and job when the
    /// repair started a new attempt.
    async fn repair(
        &self,
        store: &dyn SharedStore,
        observed: &EntityStatusRecord,
    ) -> Result<Option<(EntityStatusRecord, JobHandle)>> {
        let entity_id = &observed.entity_id;
        match self.diagnose(observed).await? {
            Diagnosis::Healthy => Ok(None),
            Diagnosis::Attach(job_id) => {
                self.attach(store, entity_id, job_id).await?;
                Ok(None)
            }
            Diagnosis::Settle(job) => {
                match job.state {
                    JobState::Completed => self.mark_indexed(entity_id, job.id).await?,
                    JobState::Failed => {
                        let error = job.last_error.as_deref().unwrap_or("job failed");
                        self.mark_error(entity_id, job.id, error).await?
                    }
                    _ => self.mark_cancelled(entity_id, job.id).await?,
                };
                info!(entity_id = %entity_id, job_id = %job.id, job_state = ?job.state, "settled status from finished job");
                Ok(None)
            }
            Diagnosis::Requeue => {
                if let Err(e) = index_job(entity_id).validate() {
                    warn!(entity_id = %entity_id, error = %e, "orphaned status cannot be re-enqueued");
                    return Ok(None);
                }
                let now = self.clock.now();
                let requeued = update_record(
                    store,
                    &keys::entity(entity_id),
                    |current: Option<EntityStatusRecord>| match current {
                        // 観測時から変わっていなければ修復する
                        Some(mut record) if same_version(&record, observed) => {
                            record.requeue_orphan(now);
                            Update::write(record.clone(), Some(record))
                        }
                        _ => Update::skip(None),
                    },
                )
                .await?;
                let Some(record) = requeued else {
                    return Ok(None);
                };
                warn!(entity_id = %entity_id, attempts = record.indexing_attempts, "orphaned indexing status re-enqueued");
                let (record, job) = self
                    .enqueue_and_attach(store, record, EnqueueOptions::default())
                    .await?;
                Ok(Some((record, job)))
            }
        }
    }

    async fn enqueue_and_attach(
        &self,
        store: &dyn SharedStore,
        record: EntityStatusRecord,
        options: EnqueueOptions,
    ) -> Result<(EntityStatusRecord, JobHandle)> {
        let handle = self
            .queue
            .enqueue_job(index_job(&record.entity_id), options)
            .await?;
        let record = self.attach(store, &record.entity_id, handle.id).await?;
        Ok((record, handle))
    }

    /// Link `job_id` to the record. Returns the record as stored afterwards.
    async fn attach(
        &self,
        store: &dyn SharedStore,
        entity_id: &EntityId,
        job_id: JobId,
    ) -> Result<EntityStatusRecord> {
        let now = self.clock.now();
        let key = keys::entity(entity_id);
        let record = update_record(store, &key, |current: Option<EntityStatusRecord>| {
            let Some(mut record) = current else {
                return Update::skip(None);
            };
            if record.job_id == Some(job_id) {
                return Update::skip(Some(record));
            }
            if record.attach_job(job_id, now) {
                Update::write(record.clone(), Some(record))
            } else {
                Update::skip(Some(record))
            }
        })
        .await?;
        record.ok_or_else(|| PipelineError::not_found("entity", entity_id))
    }
}

fn index_job(entity_id: &EntityId) -> IndexConversation {
    IndexConversation {
        conversation_id: entity_id.clone(),
    }
}

fn same_version(a: &EntityStatusRecord, b: &EntityStatusRecord) -> bool {
    a.indexing_status == b.indexing_status
        && a.job_id == b.job_id
        && a.last_activity_at == b.last_activity_at
        && a.indexing_attempts == b.indexing_attempts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HandlerError, IndexingStatus, JobOutput};
    use crate::ports::IdGenerator;
    use crate::store::record::write_record;
    use crate::test_support::Harness;

    const INDEX: &str = IndexConversation::QUEUE;

    fn conv(id: &str) -> EntityId {
        EntityId::new(id)
    }

    /// An in-flight record with no job behind it, as left by a crash mid-retry.
    async fn plant_orphan(h: &Harness, entity: &EntityId) -> EntityStatusRecord {
        let mut record = EntityStatusRecord::new(entity.clone(), h.clock.now());
        record.mark_queued(h.clock.now()).unwrap();
        let conn = h.pool.acquire().await.unwrap();
        write_record(&*conn, &keys::entity(entity), &record)
            .await
            .unwrap();
        conn.list_push(keys::ENTITIES, entity.as_str()).await.unwrap();
        record
    }

    #[tokio::test]
    async fn second_retry_conflicts_while_queued() {
        let h = Harness::new();
        let machine = h.machine();

        let first = machine.retry(&conv("conv-1")).await.unwrap();
        assert!(first.is_accepted());
        assert_eq!(first.status().indexing_status, IndexingStatus::Queued);
        assert_eq!(first.status().indexing_attempts, 1);

        let second = machine.retry(&conv("conv-1")).await.unwrap();
        assert_eq!(
            second,
            RetryOutcome::Conflict {
                current: first.status().clone()
            }
        );
        assert_eq!(h.queue.stats(INDEX).await.unwrap().live(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_retries_admit_exactly_one_attempt() {
        let h = Harness::new();
        let machine = h.machine();
        let entity = conv("conv-1");

        let racers: Vec<_> = (0..8)
            .map(|_| {
                let machine = machine.clone();
                let entity = entity.clone();
                tokio::spawn(async move { machine.retry(&entity).await.unwrap() })
            })
            .collect();
        let mut outcomes = Vec::new();
        for racer in racers {
            outcomes.push(racer.await.unwrap());
        }

        let accepted = outcomes.iter().filter(|o| o.is_accepted()).count();
        assert_eq!((accepted, outcomes.len() - accepted), (1, 7));
        assert_eq!(h.queue.stats(INDEX).await.unwrap().live(), 1);
        let status = machine.get_status(&entity).await.unwrap().unwrap();
        assert_eq!(status.indexing_attempts, 1);
    }

    #[tokio::test]
    async fn rejected_id_leaves_no_status_behind() {
        let h = Harness::new();
        let machine = h.machine();
        let blank = conv("");

        let err = machine.retry(&blank).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidPayload(_)));
        assert!(machine.get_status(&blank).await.unwrap().is_none());
        assert_eq!(h.queue.stats(INDEX).await.unwrap().live(), 0);
        assert!(machine.retry(&blank).await.is_err());
    }

    #[tokio::test]
    async fn retry_with_passes_options_to_the_job() {
        let h = Harness::new();
        let options = EnqueueOptions::default()
            .with_max_attempts(7)
            .with_delay(Duration::from_secs(3600));

        let RetryOutcome::Accepted { job, .. } =
            h.machine().retry_with(&conv("conv-1"), options).await.unwrap()
        else {
            panic!("expected accepted retry");
        };
        let job = h.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.max_attempts, 7);
        assert_eq!(job.run_at - job.enqueued_at, chrono::Duration::hours(1));
        assert!(h.queue.try_claim(INDEX).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelling_before_the_job_is_linked_frees_the_entity() {
        let h = Harness::new();
        let machine = h.machine();
        let entity = conv("conv-1");
        plant_orphan(&h, &entity).await;
        let handle = h
            .queue
            .enqueue_job(index_job(&entity), EnqueueOptions::default())
            .await
            .unwrap();

        assert!(h.queue.cancel(handle.id).await.unwrap());
        assert!(machine.cancel_attempt(&entity, handle.id).await.unwrap());

        h.advance(h.config.repair_grace);
        let status = machine.get_status(&entity).await.unwrap().unwrap();
        assert_eq!(status.indexing_status, IndexingStatus::None);
        assert_eq!(status.indexing_attempts, 1);
        assert_eq!(h.queue.stats(INDEX).await.unwrap().live(), 0);
    }

    #[tokio::test]
    async fn cancel_attempt_ignores_a_record_linked_elsewhere() {
        let h = Harness::new();
        let machine = h.machine();
        let entity = conv("conv-1");
        machine.retry(&entity).await.unwrap();

        let foreign = h.ids.generate_job_id();
        assert!(!machine.cancel_attempt(&entity, foreign).await.unwrap());
        let status = machine.get_status(&entity).await.unwrap().unwrap();
        assert_eq!(status.indexing_status, IndexingStatus::Queued);
    }

    #[tokio::test]
    async fn transient_failure_then_success() {
        let h = Harness::new();
        let machine = h.machine();
        let entity = conv("conv-1");
        machine.retry(&entity).await.unwrap();

        let lease = h.queue.try_claim(INDEX).await.unwrap().unwrap();
        let job_id = lease.id();
        assert!(machine.mark_indexing(&entity, job_id).await.unwrap());
        let status = machine.get_status(&entity).await.unwrap().unwrap();
        assert_eq!(status.indexing_status, IndexingStatus::Indexing);

        lease.fail(&HandlerError::transient("embedder down")).await.unwrap();
        assert!(machine.mark_retrying(&entity, job_id).await.unwrap());
        let status = machine.get_status(&entity).await.unwrap().unwrap();
        assert_eq!(status.indexing_status, IndexingStatus::Queued);
        assert_eq!(status.indexing_attempts, 2);

        h.advance(Duration::from_secs(1));
        let lease = h.queue.try_claim(INDEX).await.unwrap().unwrap();
        assert!(machine.mark_indexing(&entity, lease.id()).await.unwrap());
        lease.complete(JobOutput::empty()).await.unwrap();
        assert!(machine.mark_indexed(&entity, job_id).await.unwrap());

        let view = machine.get_status(&entity).await.unwrap().unwrap().view();
        assert_eq!(
            view,
            StatusView {
                indexing_status: IndexingStatus::Indexed,
                indexing_error: None,
                indexing_attempts: 2,
            }
        );

        let again = machine.retry(&entity).await.unwrap();
        assert!(again.is_accepted());
        assert_eq!(again.status().indexing_attempts, 3);
    }

    #[tokio::test]
    async fn unknown_entity_has_no_status() {
        let h = Harness::new();
        assert!(h.machine().get_status(&conv("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reports_from_a_foreign_job_are_ignored() {
        let h = Harness::new();
        let machine = h.machine();
        let entity = conv("conv-1");
        machine.retry(&entity).await.unwrap();

        let foreign = h.ids.generate_job_id();
        assert!(!machine.mark_indexing(&entity, foreign).await.unwrap());
        assert!(!machine.mark_indexed(&entity, foreign).await.unwrap());
        assert!(!machine.mark_indexed(&conv("never-seen"), foreign).await.unwrap());

        let status = machine.get_status(&entity).await.unwrap().unwrap();
        assert_eq!(status.indexing_status, IndexingStatus::Queued);
    }

    #[tokio::test]
    async fn fresh_orphan_is_left_alone_until_the_grace_elapses() {
        let h = Harness::new();
        let machine = h.machine();
        let entity = conv("conv-1");
        plant_orphan(&h, &entity).await;

        let status = machine.get_status(&entity).await.unwrap().unwrap();
        assert_eq!(status.job_id, None);
        assert_eq!(status.indexing_attempts, 1);

        h.advance(h.config.repair_grace);
        let status = machine.get_status(&entity).await.unwrap().unwrap();
        assert_eq!(status.indexing_status, IndexingStatus::Queued);
        assert_eq!(status.indexing_attempts, 2);
        let job_id = status.job_id.expect("repair links a new job");
        assert!(h.queue.get(job_id).await.unwrap().unwrap().state.is_live());
    }

    #[tokio::test]
    async fn orphan_is_attached_to_a_live_job() {
        let h = Harness::new();
        let machine = h.machine();
        let entity = conv("conv-1");
        plant_orphan(&h, &entity).await;
        let job = h
            .queue
            .enqueue_job(
                IndexConversation {
                    conversation_id: entity.clone(),
                },
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let status = machine.get_status(&entity).await.unwrap().unwrap();
        assert_eq!(status.job_id, Some(job.id));
        assert_eq!(status.indexing_attempts, 1);
    }

    #[tokio::test]
    async fn finished_job_settles_a_stuck_status() {
        let h = Harness::new();
        let machine = h.machine();
        let entity = conv("conv-1");
        machine.retry(&entity).await.unwrap();

        // the worker completed the job but died before reporting
        let lease = h.queue.try_claim(INDEX).await.unwrap().unwrap();
        lease.complete(JobOutput::empty()).await.unwrap();

        let status = machine.get_status(&entity).await.unwrap().unwrap();
        assert_eq!(status.indexing_status, IndexingStatus::Indexed);
        assert_eq!(status.job_id, None);
    }

    #[tokio::test]
    async fn failed_job_settles_as_error() {
        let h = Harness::new();
        let machine = h.machine();
        let entity = conv("conv-1");
        machine.retry(&entity).await.unwrap();

        let lease = h.queue.try_claim(INDEX).await.unwrap().unwrap();
        lease.fail(&HandlerError::permanent("unsupported format")).await.unwrap();

        let view = machine.get_status(&entity).await.unwrap().unwrap().view();
        assert_eq!(view.indexing_status, IndexingStatus::Error);
        assert_eq!(view.indexing_error.as_deref(), Some("unsupported format"));
    }

    #[tokio::test]
    async fn reconcile_requeues_records_whose_job_vanished() {
        let h = Harness::new();
        let machine = h.machine();
        machine.retry(&conv("healthy")).await.unwrap();
        let outcome = machine.retry(&conv("orphaned")).await.unwrap();
        let RetryOutcome::Accepted { job, .. } = outcome else {
            panic!("expected accepted retry");
        };

        let conn = h.pool.acquire().await.unwrap();
        conn.delete(&keys::job(job.id)).await.unwrap();
        drop(conn);

        assert_eq!(machine.reconcile().await.unwrap(), 1);
        let status = machine.get_status(&conv("orphaned")).await.unwrap().unwrap();
        assert_eq!(status.indexing_attempts, 2);
        assert_ne!(status.job_id, Some(job.id));

        assert_eq!(machine.reconcile().await.unwrap(), 0);
        assert_eq!(machine.in_flight().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cancelled_attempt_can_be_retried() {
        let h = Harness::new();
        let machine = h.machine();
        let entity = conv("conv-1");
        let RetryOutcome::Accepted { job, .. } = machine.retry(&entity).await.unwrap() else {
            panic!("expected accepted retry");
        };

        assert!(h.queue.cancel(job.id).await.unwrap());
        assert!(machine.mark_cancelled(&entity, job.id).await.unwrap());
        let status = machine.get_status(&entity).await.unwrap().unwrap();
        assert_eq!(status.indexing_status, IndexingStatus::None);

        assert!(machine.retry(&entity).await.unwrap().is_accepted());
    }
}
