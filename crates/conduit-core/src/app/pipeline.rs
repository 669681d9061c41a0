//! Pipeline - 呼び出し側（HTTP ハンドラなど）が触る表面
//!
//! 構成要素（queue / status machine / recorder）は同じ StorePool を共有する。

use std::collections::BTreeMap;

use tokio::sync::watch;
use tracing::info;

use super::reaper_loop::ReaperLoop;
use super::worker_pool::WorkerPool;
use crate::config::PipelineConfig;
use crate::domain::{
    AggregateStatus, EnqueueOptions, EntityId, JobHandle, JobId, JobRecord, Result, StatusView,
};
use crate::observability::QueueStats;
use crate::queue::JobQueue;
use crate::recorder::TaskRecorder;
use crate::status::{EntityStatusMachine, RetryOutcome};
use crate::store::StorePool;
use crate::typed::{HandlerRegistry, JobKind};

pub struct Pipeline {
    pub(super) config: PipelineConfig,
    pub(super) pool: StorePool,
    pub(super) queue: JobQueue,
    pub(super) statuses: EntityStatusMachine,
    pub(super) recorder: TaskRecorder,
    pub(super) registry: HandlerRegistry,
}

impl Pipeline {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn statuses(&self) -> &EntityStatusMachine {
        &self.statuses
    }

    pub fn recorder(&self) -> &TaskRecorder {
        &self.recorder
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Enqueue a typed job.
    ///
    /// Jobs that track an entity go through the status machine so the record
    /// and the queue stay in step. While an attempt is in flight the call
    /// coalesces into the live job and `options` do not apply.
    pub async fn enqueue<T: JobKind>(&self, job: T, options: EnqueueOptions) -> Result<JobHandle> {
        job.validate()?;
        if let Some(entity) = job.tracked_entity().cloned()
            && let RetryOutcome::Accepted { job: handle, .. } =
                self.statuses.retry_with(&entity, options.clone()).await?
        {
            return Ok(handle);
        }
        self.queue.enqueue_job(job, options).await
    }

    /// Start a new indexing attempt for `entity_id`.
    pub async fn retry_indexing(&self, entity_id: &EntityId) -> Result<RetryOutcome> {
        self.statuses.retry(entity_id).await
    }

    /// `None` if the entity was never queued.
    pub async fn entity_status(&self, entity_id: &EntityId) -> Result<Option<StatusView>> {
        Ok(self
            .statuses
            .get_status(entity_id)
            .await?
            .map(|record| record.view()))
    }

    pub async fn job(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        self.queue.get(job_id).await
    }

    /// Cancel a job and release the entity it was driving.
    /// `false` if the job is unknown or already finished.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<bool> {
        let Some(job) = self.queue.get(job_id).await? else {
            return Ok(false);
        };
        if !self.queue.cancel(job_id).await? {
            return Ok(false);
        }
        if let Some(entity) = job.payload.tracked_entity() {
            self.statuses.cancel_attempt(entity, job_id).await?;
        }
        Ok(true)
    }

    pub async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        self.queue.stats(queue).await
    }

    /// Stats for every registered queue.
    pub async fn all_queue_stats(&self) -> Result<BTreeMap<&'static str, QueueStats>> {
        let mut all = BTreeMap::new();
        for queue in self.registry.queues() {
            all.insert(queue, self.queue.stats(queue).await?);
        }
        Ok(all)
    }

    pub async fn aggregate_status(&self) -> Result<AggregateStatus> {
        self.recorder
            .aggregate_status(&self.statuses, self.config.summarizer_enabled)
            .await
    }

    /// Release the store connection if it has sat idle for `idle_window`.
    pub async fn close_if_idle(&self) -> bool {
        self.pool.close_if_idle().await
    }

    /// Recover the registered queues and start their worker slots.
    pub async fn start_workers(&self) -> Result<WorkerPool> {
        WorkerPool::start(self.queue.clone(), self.statuses.clone(), &self.registry).await
    }

    pub fn reaper(&self) -> ReaperLoop {
        ReaperLoop::new(
            self.pool.clone(),
            self.statuses.clone(),
            self.config.reaper_interval,
        )
    }

    /// Workers plus the reaper, stopped together.
    pub async fn start(&self) -> Result<Running> {
        let workers = self.start_workers().await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reaper = tokio::spawn(self.reaper().run(shutdown_rx));
        info!(queues = ?self.registry.queues(), "pipeline started");
        Ok(Running {
            workers,
            reaper,
            shutdown_tx,
        })
    }
}

/// Handle to a started pipeline.
pub struct Running {
    workers: WorkerPool,
    reaper: tokio::task::JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Running {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.workers.shutdown_and_join().await;
        if let Err(e) = self.reaper.await {
            tracing::error!(error = %e, "reaper task ended abnormally");
        }
    }
}
