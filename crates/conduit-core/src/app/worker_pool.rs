//! WorkerPool - 登録済み queue ごとの worker slot
//!
//! # フロー（slot ごと）
//! 1. `try_claim` で due な job を取る。なければ shutdown と競合させて待つ
//! 2. 追跡対象 entity があれば `indexing` にする
//! 3. Handler を別 task で実行（panic は transient failure として扱う）
//! 4. 結果を lease 経由で queue に報告し、queue の判断を entity status に反映
//!
//! shutdown は新しい claim を止めるだけで、実行中の handler は中断しない。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{
    EntityId, FailDisposition, HandlerError, JobId, PipelineError, Result,
};
use crate::ports::Subscription;
use crate::queue::{JobLease, JobQueue};
use crate::status::EntityStatusMachine;
use crate::typed::{DynHandler, HandlerRegistry};

/// Running worker slots plus the cancellation listener.
///
/// - `request_shutdown()` で全 slot が新しい claim をやめる
/// - `shutdown_and_join()` で全 slot の終了を待てる
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Recover every registered queue, then spawn its slots.
    pub async fn start(
        queue: JobQueue,
        statuses: EntityStatusMachine,
        registry: &HandlerRegistry,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = Vec::new();

        for (queue_name, registration) in registry.iter() {
            queue.recover(queue_name).await?;
            for slot in 0..registration.concurrency {
                let worker = Worker {
                    slot,
                    queue_name,
                    queue: queue.clone(),
                    statuses: statuses.clone(),
                    handler: Arc::clone(&registration.handler),
                };
                let rx = shutdown_rx.clone();
                joins.push(tokio::spawn(worker.run(rx)));
            }
        }

        let cancellations = queue.subscribe_cancellations().await?;
        joins.push(tokio::spawn(forward_cancellations(
            queue,
            cancellations,
            shutdown_rx,
        )));

        info!(queues = ?registry.queues(), slots = joins.len() - 1, "worker pool started");
        Ok(Self { shutdown_tx, joins })
    }

    /// Stop claiming new jobs. Running handlers finish normally.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for every slot.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

struct Worker {
    slot: usize,
    queue_name: &'static str,
    queue: JobQueue,
    statuses: EntityStatusMachine,
    handler: Arc<dyn DynHandler>,
}

impl Worker {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        debug!(queue = self.queue_name, slot = self.slot, "worker slot started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.queue.try_claim(self.queue_name).await {
                Ok(Some(lease)) => {
                    self.process(lease).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(queue = self.queue_name, slot = self.slot, error = %e, "claim failed"),
            }

            // 待機だけを shutdown と競合させる（claim 途中では中断しない）
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.queue.wait_for_work(self.queue_name) => {}
            }
        }
        debug!(queue = self.queue_name, slot = self.slot, "worker slot stopped");
    }

    async fn process(&self, lease: JobLease) {
        let job_id = lease.id();
        let payload = lease.job().payload.clone();
        let entity = payload.tracked_entity().cloned();

        if let Some(entity) = &entity {
            self.track(entity, self.statuses.mark_indexing(entity, job_id).await);
        }

        let handler = Arc::clone(&self.handler);
        let ctx = lease.context();
        let result = match tokio::spawn(async move { handler.handle_dyn(payload, ctx).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                error!(job_id = %job_id, queue = self.queue_name, "handler panicked");
                Err(HandlerError::transient("handler panicked"))
            }
            Err(e) => Err(HandlerError::transient(e.to_string())),
        };

        match result {
            Ok(output) => match lease.complete(output).await {
                Ok(true) => {
                    if let Some(entity) = &entity {
                        self.track(entity, self.statuses.mark_indexed(entity, job_id).await);
                    }
                }
                Ok(false) => debug!(job_id = %job_id, "result discarded: job no longer active"),
                Err(e) => self.report_failed(job_id, e),
            },
            Err(HandlerError::Cancelled) => match lease.report_cancelled().await {
                Ok(true) => {
                    if let Some(entity) = &entity {
                        self.track(entity, self.statuses.mark_cancelled(entity, job_id).await);
                    }
                }
                Ok(false) => debug!(job_id = %job_id, "cancellation report discarded"),
                Err(e) => self.report_failed(job_id, e),
            },
            Err(err) => match lease.fail(&err).await {
                Ok(Some(FailDisposition::Retrying { .. })) => {
                    if let Some(entity) = &entity {
                        self.track(entity, self.statuses.mark_retrying(entity, job_id).await);
                    }
                }
                Ok(Some(FailDisposition::Exhausted { .. })) => {
                    if let Some(entity) = &entity {
                        let applied = self.statuses.mark_error(entity, job_id, &err.message()).await;
                        self.track(entity, applied);
                    }
                }
                Ok(None) => debug!(job_id = %job_id, "failure discarded: job no longer active"),
                Err(e) => self.report_failed(job_id, e),
            },
        }
    }

    /// Status updates are best effort; reconciliation settles what is missed.
    fn track(&self, entity: &EntityId, applied: Result<bool>) {
        if let Err(e) = applied {
            warn!(entity_id = %entity, queue = self.queue_name, error = %e, "entity status update failed");
        }
    }

    fn report_failed(&self, job_id: JobId, e: PipelineError) {
        error!(job_id = %job_id, queue = self.queue_name, error = %e, "could not record job outcome");
    }
}

/// Relay cancellations published by any process to the local leases.
async fn forward_cancellations(
    queue: JobQueue,
    mut feed: Subscription,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            message = feed.recv() => {
                let Some(raw) = message else {
                    match resubscribe(&queue, &mut shutdown_rx).await {
                        Some(fresh) => feed = fresh,
                        None => break,
                    }
                    continue;
                };
                match raw.parse::<JobId>() {
                    Ok(job_id) => {
                        if queue.signal_local(job_id) {
                            debug!(job_id = %job_id, "cancellation delivered to running handler");
                        }
                    }
                    Err(e) => warn!(message = %raw, error = %e, "ignoring malformed cancellation"),
                }
            }
        }
    }
}

/// The feed ends when its connection is closed. Subscribe again, pausing
/// `poll_interval` between failed attempts. `None` on shutdown.
async fn resubscribe(queue: &JobQueue, shutdown_rx: &mut watch::Receiver<bool>) -> Option<Subscription> {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return None;
                }
            }
            _ = tokio::time::sleep(queue.settings().poll_interval) => {
                match queue.subscribe_cancellations().await {
                    Ok(feed) => return Some(feed),
                    Err(e) => warn!(error = %e, "cancellation feed unavailable"),
                }
            }
        }
    }
}
