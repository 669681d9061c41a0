//! JobQueue - 重複排除つき・backoff 対応の job queue
//!
//! # 設計原則
//! - Job の正本は共有ストアの `job:{id}` レコード。状態遷移はすべて CAS で行う
//! - `dedup:{queue}:{key}` は live（waiting / active）な job の id を保持する。
//!   同じ key の enqueue は既存 job に合流（coalesce）する
//! - いつ claim できるかはプロセス内の `Schedule` が知っている。claim 時に
//!   レコードを再確認するので、古いエントリは単に捨てられる
//! - 手元に due な job が無いときは `poll_interval` ごとに queue index を走査し、
//!   他プロセスが enqueue した waiting job も schedule に取り込む
//! - 終端状態（completed / failed / cancelled）に入った job は dedup key を手放し、
//!   件数上限つきの retention リストに入る（古いものから削除）

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::lease::JobLease;
use super::retry::RetryPolicy;
use super::schedule::Schedule;
use crate::config::PipelineConfig;
use crate::domain::{
    EnqueueOptions, FailDisposition, HandlerError, JobHandle, JobId, JobOutput, JobPayload,
    JobRecord, JobState, Result,
};
use crate::observability::QueueStats;
use crate::ports::{Clock, IdGenerator, SharedStore, StoreError, Subscription};
use crate::store::record::{Update, parse_ids, read_record, update_record, write_record};
use crate::store::{StorePool, keys};
use crate::typed::JobKind;

/// Rounds of the enqueue loop before giving up on a contended dedup key.
const MAX_ENQUEUE_ROUNDS: usize = 16;

/// Queue-wide defaults and retention bounds.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub default_max_attempts: u32,
    pub default_backoff: RetryPolicy,
    pub completed_retention: usize,
    /// Bound for failed jobs, and separately for cancelled jobs.
    pub failed_retention: usize,
    pub completed_ttl: Option<Duration>,
    pub poll_interval: Duration,
}

impl From<&PipelineConfig> for QueueSettings {
    fn from(cfg: &PipelineConfig) -> Self {
        Self {
            default_max_attempts: cfg.default_max_attempts,
            default_backoff: cfg.default_backoff.clone(),
            completed_retention: cfg.completed_retention,
            failed_retention: cfg.failed_retention,
            completed_ttl: cfg.completed_ttl,
            poll_interval: cfg.poll_interval,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

/// What `recover` did to the persisted jobs of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Waiting jobs put back on the local schedule.
    pub rescheduled: usize,
    /// Orphaned active jobs returned to waiting.
    pub released: usize,
    /// Orphaned active jobs that were on their final attempt.
    pub failed: usize,
}

enum Claim {
    Claimed(JobRecord),
    NotYet(chrono::DateTime<chrono::Utc>),
    Gone,
}

enum CancelReport {
    Applied(JobRecord),
    AlreadyCancelled,
    NotCancelled,
}

struct Running {
    lease_seq: u64,
    token: CancellationToken,
}

struct QueueInner {
    pool: StorePool,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    settings: QueueSettings,
    schedules: Mutex<HashMap<String, Arc<Schedule>>>,
    running: Mutex<HashMap<JobId, Running>>,
    lease_seq: AtomicU64,
}

/// Shared job queue handle. Cloning is cheap and shares state.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    pub fn new(
        pool: StorePool,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                pool,
                clock,
                ids,
                settings,
                schedules: Mutex::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
                lease_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    fn schedule(&self, queue: &str) -> Arc<Schedule> {
        let mut schedules = self
            .inner
            .schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(schedules.entry(queue.to_string()).or_default())
    }

    fn running(&self) -> MutexGuard<'_, HashMap<JobId, Running>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // enqueue
    // ------------------------------------------------------------------

    /// Enqueue `payload` on `queue` under `dedup_key`.
    ///
    /// If a live job already holds the dedup key the call is coalesced and returns
    /// that job's handle (`coalesced = true`). Otherwise a `waiting` job is created.
    pub async fn enqueue(
        &self,
        queue: &str,
        dedup_key: &str,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<JobHandle> {
        payload.validate_for(queue)?;

        let conn = self.inner.pool.acquire().await?;
        let store: &dyn SharedStore = &*conn;
        let dedup = keys::dedup(queue, dedup_key);
        let settings = &self.inner.settings;

        for _ in 0..MAX_ENQUEUE_ROUNDS {
            if let Some(existing) = self.live_holder(store, &dedup).await? {
                debug!(job_id = %existing.id, queue, dedup_key, "enqueue coalesced into live job");
                return Ok(existing.handle(true));
            }

            let record = JobRecord::new(
                self.inner.ids.generate_job_id(),
                dedup_key,
                payload.clone(),
                options.max_attempts.unwrap_or(settings.default_max_attempts),
                options
                    .backoff
                    .clone()
                    .unwrap_or_else(|| settings.default_backoff.clone()),
                options.delay,
                self.inner.clock.now(),
            );
            let job_key = keys::job(record.id);
            let id = record.id.to_string();

            // レコードを先に書く: dedup key を見た他者が必ず job を読めるように
            write_record(store, &job_key, &record).await?;
            if store.set_if_absent(&dedup, &id, None).await? {
                store.list_push(&keys::queue_index(queue), &id).await?;
                self.schedule(queue).push(record.id, record.run_at);
                info!(job_id = %record.id, queue, dedup_key, max_attempts = record.max_attempts, "job enqueued");
                return Ok(record.handle(false));
            }

            // lost the dedup race; the winner's job is picked up next round
            store.delete(&job_key).await?;
        }

        Err(StoreError::Unavailable(format!("dedup key `{dedup}` is too contended")).into())
    }

    /// Enqueue a typed job on its own queue.
    pub async fn enqueue_job<T: JobKind>(&self, job: T, options: EnqueueOptions) -> Result<JobHandle> {
        let dedup_key = job.dedup_key();
        self.enqueue(T::QUEUE, &dedup_key, job.into_payload(), options)
            .await
    }

    /// Enqueue a payload on the queue its kind belongs to.
    pub async fn enqueue_payload(
        &self,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<JobHandle> {
        let dedup_key = payload.dedup_key();
        self.enqueue(payload.queue_name(), &dedup_key, payload, options)
            .await
    }

    /// The live job holding `dedup`, clearing the key if its job is gone or finished.
    async fn live_holder(&self, store: &dyn SharedStore, dedup: &str) -> Result<Option<JobRecord>> {
        let Some(raw) = store.get(dedup).await? else {
            return Ok(None);
        };
        if let Ok(id) = raw.parse::<JobId>()
            && let Some(job) = read_record::<JobRecord>(store, &keys::job(id)).await?
            && job.state.is_live()
        {
            return Ok(Some(job));
        }
        debug!(dedup, holder = %raw, "clearing stale dedup key");
        store.compare_and_delete(dedup, &raw).await?;
        Ok(None)
    }

    // ------------------------------------------------------------------
    // inspection
    // ------------------------------------------------------------------

    pub async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        let conn = self.inner.pool.acquire().await?;
        read_record(&*conn, &keys::job(job_id)).await
    }

    /// The live job holding `dedup_key` on `queue`, if any.
    pub async fn find_live(&self, queue: &str, dedup_key: &str) -> Result<Option<JobRecord>> {
        let conn = self.inner.pool.acquire().await?;
        let store: &dyn SharedStore = &*conn;
        let Some(raw) = store.get(&keys::dedup(queue, dedup_key)).await? else {
            return Ok(None);
        };
        let Ok(id) = raw.parse::<JobId>() else {
            return Ok(None);
        };
        let job = read_record::<JobRecord>(store, &keys::job(id)).await?;
        Ok(job.filter(|j| j.state.is_live()))
    }

    /// Counts by state, computed from the persisted records of `queue`.
    pub async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let conn = self.inner.pool.acquire().await?;
        let store: &dyn SharedStore = &*conn;
        let index = keys::queue_index(queue);

        let mut stats = QueueStats::default();
        for raw in store.list_range(&index).await? {
            let job = match raw.parse::<JobId>() {
                Ok(id) => read_record::<JobRecord>(store, &keys::job(id)).await?,
                Err(_) => None,
            };
            match job {
                Some(job) => stats.count(job.state),
                // expired by TTL; pruned by the next rescan
                None => {}
            }
        }
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // claim
    // ------------------------------------------------------------------

    /// Claim the next due job without waiting.
    ///
    /// Falls back to a rescan of the store (at most once per `poll_interval`)
    /// when nothing is due locally.
    pub async fn try_claim(&self, queue: &str) -> Result<Option<JobLease>> {
        let schedule = self.schedule(queue);
        if let Some(lease) = self.claim_due(&schedule).await? {
            return Ok(Some(lease));
        }
        let now = self.inner.clock.now();
        if schedule.begin_scan(now, self.inner.settings.poll_interval)
            && self.rescan(queue, &schedule).await? > 0
        {
            return self.claim_due(&schedule).await;
        }
        Ok(None)
    }

    async fn claim_due(&self, schedule: &Schedule) -> Result<Option<JobLease>> {
        while let Some(job_id) = schedule.pop_due(self.inner.clock.now()) {
            if let Some(lease) = self.claim_job(job_id, schedule).await? {
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }

    /// Pull waiting jobs this process has not seen into the local schedule, and
    /// drop index entries whose record is gone. Returns how many jobs were added.
    async fn rescan(&self, queue: &str, schedule: &Schedule) -> Result<usize> {
        let conn = self.inner.pool.acquire().await?;
        let store: &dyn SharedStore = &*conn;
        let index = keys::queue_index(queue);

        let mut added = 0;
        for raw in store.list_range(&index).await? {
            let job = match raw.parse::<JobId>() {
                Ok(id) => read_record::<JobRecord>(store, &keys::job(id)).await?,
                Err(_) => None,
            };
            match job {
                Some(job) if job.state == JobState::Waiting => {
                    if schedule.push(job.id, job.run_at) {
                        added += 1;
                    }
                }
                Some(_) => {}
                // expired by TTL or evicted elsewhere
                None => {
                    store.list_remove(&index, &raw).await?;
                }
            }
        }
        if added > 0 {
            debug!(queue, added, "rescan picked up waiting jobs");
        }
        Ok(added)
    }

    /// Wait for and claim the next due job.
    pub async fn claim_next(&self, queue: &str) -> Result<JobLease> {
        loop {
            if let Some(lease) = self.try_claim(queue).await? {
                return Ok(lease);
            }
            self.wait_for_work(queue).await;
        }
    }

    /// Sleep until a job of `queue` may be due, at most `poll_interval`.
    /// Safe to drop at any point.
    pub async fn wait_for_work(&self, queue: &str) {
        self.schedule(queue)
            .wait(self.inner.clock.now(), self.inner.settings.poll_interval)
            .await;
    }

    async fn claim_job(&self, job_id: JobId, schedule: &Schedule) -> Result<Option<JobLease>> {
        // token を先に登録: claim 直後の cancel() が必ず見つけられるように
        let lease_seq = self.inner.lease_seq.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.running().insert(
            job_id,
            Running {
                lease_seq,
                token: token.clone(),
            },
        );

        let claim = self.try_claim_record(job_id).await;
        match claim {
            Ok(Claim::Claimed(job)) => {
                info!(job_id = %job.id, queue = %job.queue, attempt = job.attempts, "job claimed");
                Ok(Some(JobLease::new(self.clone(), job, token, lease_seq)))
            }
            other => {
                self.forget_lease(job_id, lease_seq);
                match &other {
                    Ok(Claim::NotYet(run_at)) => {
                        schedule.push(job_id, *run_at);
                    }
                    // store failure: keep the job for the next round
                    Err(_) => {
                        schedule.push(job_id, self.inner.clock.now());
                    }
                    _ => {}
                }
                other.map(|_| None)
            }
        }
    }

    async fn try_claim_record(&self, job_id: JobId) -> Result<Claim> {
        let conn = self.inner.pool.acquire().await?;
        let now = self.inner.clock.now();
        update_record(&*conn, &keys::job(job_id), |current: Option<JobRecord>| {
            let Some(mut job) = current else {
                return Update::skip(Claim::Gone);
            };
            if job.claim(now) {
                return Update::write(job.clone(), Claim::Claimed(job));
            }
            if job.state == JobState::Waiting && job.run_at > now {
                return Update::skip(Claim::NotYet(job.run_at));
            }
            Update::skip(Claim::Gone)
        })
        .await
    }

    /// Drop the local cancellation token of a finished lease.
    pub(super) fn forget_lease(&self, job_id: JobId, lease_seq: u64) {
        let mut running = self.running();
        if running
            .get(&job_id)
            .is_some_and(|r| r.lease_seq == lease_seq)
        {
            running.remove(&job_id);
        }
    }

    // ------------------------------------------------------------------
    // outcomes (called through JobLease)
    // ------------------------------------------------------------------

    pub(super) async fn complete_job(&self, job_id: JobId, output: JobOutput) -> Result<bool> {
        let conn = self.inner.pool.acquire().await?;
        let store: &dyn SharedStore = &*conn;
        let now = self.inner.clock.now();

        let done = update_record(store, &keys::job(job_id), |current: Option<JobRecord>| {
            let Some(mut job) = current else {
                return Update::skip(None);
            };
            if job.complete(output.clone(), now) {
                Update::write(job.clone(), Some(job))
            } else {
                Update::skip(None)
            }
        })
        .await?;

        let Some(job) = done else {
            debug!(job_id = %job_id, "stale completion discarded");
            return Ok(false);
        };
        self.release_dedup(store, &job).await?;
        self.retain(
            store,
            &job,
            &keys::completed(&job.queue),
            self.inner.settings.completed_retention,
            self.inner.settings.completed_ttl,
        )
        .await?;
        info!(job_id = %job.id, queue = %job.queue, attempts = job.attempts, "job completed");
        Ok(true)
    }

    pub(super) async fn fail_job(
        &self,
        job_id: JobId,
        error: &HandlerError,
    ) -> Result<Option<FailDisposition>> {
        let conn = self.inner.pool.acquire().await?;
        let store: &dyn SharedStore = &*conn;
        let now = self.inner.clock.now();

        let failed = update_record(store, &keys::job(job_id), |current: Option<JobRecord>| {
            let Some(mut job) = current else {
                return Update::skip(None);
            };
            match job.fail(error, now) {
                Some(disposition) => Update::write(job.clone(), Some((job, disposition))),
                None => Update::skip(None),
            }
        })
        .await?;

        let Some((job, disposition)) = failed else {
            debug!(job_id = %job_id, "stale failure report discarded");
            return Ok(None);
        };
        match disposition {
            FailDisposition::Retrying { attempts, delay } => {
                self.schedule(&job.queue).push(job.id, job.run_at);
                warn!(job_id = %job.id, queue = %job.queue, attempt = attempts, ?delay, error = %error, "job attempt failed; retrying");
            }
            FailDisposition::Exhausted { attempts } => {
                self.release_dedup(store, &job).await?;
                self.retain(
                    store,
                    &job,
                    &keys::failed(&job.queue),
                    self.inner.settings.failed_retention,
                    None,
                )
                .await?;
                error!(job_id = %job.id, queue = %job.queue, attempts, error = %error, "job failed");
            }
        }
        Ok(Some(disposition))
    }

    /// The handler stopped because of cancellation. Returns whether the job ended
    /// up `cancelled` (either already, or by this report).
    pub(super) async fn cancelled_by_handler(&self, job_id: JobId) -> Result<bool> {
        let conn = self.inner.pool.acquire().await?;
        let store: &dyn SharedStore = &*conn;
        let now = self.inner.clock.now();

        let report = update_record(store, &keys::job(job_id), |current: Option<JobRecord>| {
            let Some(mut job) = current else {
                return Update::skip(CancelReport::NotCancelled);
            };
            match job.state {
                JobState::Active => {
                    job.cancel(now);
                    Update::write(job.clone(), CancelReport::Applied(job))
                }
                JobState::Cancelled => Update::skip(CancelReport::AlreadyCancelled),
                _ => Update::skip(CancelReport::NotCancelled),
            }
        })
        .await?;

        match report {
            CancelReport::Applied(job) => {
                self.finish_cancel(store, &job).await?;
                Ok(true)
            }
            CancelReport::AlreadyCancelled => Ok(true),
            CancelReport::NotCancelled => Ok(false),
        }
    }

    // ------------------------------------------------------------------
    // cancel
    // ------------------------------------------------------------------

    /// Cancel a `waiting` or `active` job. Returns `false` for terminal or unknown
    /// jobs. An active worker is signalled and stops at its next check.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool> {
        let conn = self.inner.pool.acquire().await?;
        let store: &dyn SharedStore = &*conn;
        let now = self.inner.clock.now();

        let cancelled = update_record(store, &keys::job(job_id), |current: Option<JobRecord>| {
            let Some(mut job) = current else {
                return Update::skip(None);
            };
            if job.cancel(now) {
                Update::write(job.clone(), Some(job))
            } else {
                Update::skip(None)
            }
        })
        .await?;

        let Some(job) = cancelled else {
            debug!(job_id = %job_id, "cancel ignored: job is not live");
            return Ok(false);
        };
        self.signal_local(job.id);
        self.finish_cancel(store, &job).await?;
        Ok(true)
    }

    async fn finish_cancel(&self, store: &dyn SharedStore, job: &JobRecord) -> Result<()> {
        self.release_dedup(store, job).await?;
        self.retain(
            store,
            job,
            &keys::cancelled(&job.queue),
            self.inner.settings.failed_retention,
            None,
        )
        .await?;
        store
            .publish(keys::CANCELLED_CHANNEL, &job.id.to_string())
            .await?;
        info!(job_id = %job.id, queue = %job.queue, "job cancelled");
        Ok(())
    }

    fn is_running_locally(&self, job_id: JobId) -> bool {
        self.running().contains_key(&job_id)
    }

    /// Fire the cancellation token of a job running in this process.
    pub fn signal_local(&self, job_id: JobId) -> bool {
        match self.running().get(&job_id) {
            Some(running) => {
                running.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of cancelled jobs, as published by any process sharing the store.
    pub async fn subscribe_cancellations(&self) -> Result<Subscription> {
        let conn = self.inner.pool.acquire().await?;
        Ok(conn.subscribe(keys::CANCELLED_CHANNEL).await?)
    }

    // ------------------------------------------------------------------
    // recovery
    // ------------------------------------------------------------------

    /// Rebuild the local schedule of `queue` from the store.
    ///
    /// Waiting jobs are rescheduled. Active jobs not running in this process have
    /// lost their worker and go back to waiting (or fail, on their last attempt).
    /// Meant to run once at worker start-up, before any slot claims.
    pub async fn recover(&self, queue: &str) -> Result<RecoveryReport> {
        let conn = self.inner.pool.acquire().await?;
        let store: &dyn SharedStore = &*conn;
        let schedule = self.schedule(queue);
        let mut report = RecoveryReport::default();

        let ids: Vec<JobId> = parse_ids(store.list_range(&keys::queue_index(queue)).await?);
        for id in ids {
            let Some(job) = read_record::<JobRecord>(store, &keys::job(id)).await? else {
                continue;
            };
            let held_here = self.is_running_locally(job.id);
            match job.state {
                JobState::Waiting => {
                    if schedule.push(job.id, job.run_at) {
                        report.rescheduled += 1;
                    }
                }
                JobState::Active if !held_here => {
                    let now = self.inner.clock.now();
                    let released =
                        update_record(store, &keys::job(id), |current: Option<JobRecord>| {
                            let Some(mut job) = current else {
                                return Update::skip(None);
                            };
                            if job.release_lost_lease(now) {
                                Update::write(job.clone(), Some(job))
                            } else {
                                Update::skip(None)
                            }
                        })
                        .await?;
                    match released {
                        Some(job) if job.state == JobState::Waiting => {
                            schedule.push(job.id, job.run_at);
                            report.released += 1;
                        }
                        Some(job) => {
                            self.release_dedup(store, &job).await?;
                            self.retain(
                                store,
                                &job,
                                &keys::failed(queue),
                                self.inner.settings.failed_retention,
                                None,
                            )
                            .await?;
                            report.failed += 1;
                        }
                        None => {}
                    }
                }
                _ => {}
            }
        }

        if report != RecoveryReport::default() {
            info!(queue, ?report, "queue recovered from store");
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // bookkeeping
    // ------------------------------------------------------------------

    async fn release_dedup(&self, store: &dyn SharedStore, job: &JobRecord) -> Result<()> {
        store
            .compare_and_delete(&keys::dedup(&job.queue, &job.dedup_key), &job.id.to_string())
            .await?;
        Ok(())
    }

    /// Push a finished job onto a retention list and evict the oldest beyond `bound`.
    async fn retain(
        &self,
        store: &dyn SharedStore,
        job: &JobRecord,
        list: &str,
        bound: usize,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let id = job.id.to_string();
        let mut len = store.list_push(list, &id).await?;
        if let Some(ttl) = ttl {
            store.expire(&keys::job(job.id), ttl).await?;
        }

        let index = keys::queue_index(&job.queue);
        while len > bound {
            let Some(evicted) = store.list_pop_front(list).await? else {
                break;
            };
            len -= 1;
            if let Ok(evicted_id) = evicted.parse::<JobId>() {
                store.delete(&keys::job(evicted_id)).await?;
            }
            store.list_remove(&index, &evicted).await?;
            debug!(job_id = %evicted, list, "job record evicted by retention");
        }
        Ok(())
    }
}
