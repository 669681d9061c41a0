//! Shared fixtures for unit tests: an in-memory store on a manual clock.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::config::PipelineConfig;
use crate::impls::{MemoryBackend, MemoryConnector};
use crate::ports::{
    Clock, FixedClock, IdGenerator, SharedStore, StoreConnector, StoreError, Subscription,
    UlidGenerator,
};
use crate::queue::{JobQueue, QueueSettings, RetryPolicy};
use crate::recorder::TaskRecorder;
use crate::status::EntityStatusMachine;
use crate::store::StorePool;

pub(crate) struct Harness {
    pub clock: Arc<FixedClock>,
    pub backend: Arc<MemoryBackend>,
    pub connector: Arc<MemoryConnector>,
    pub pool: StorePool,
    pub ids: Arc<dyn IdGenerator>,
    pub config: PipelineConfig,
    pub queue: JobQueue,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let backend = MemoryBackend::with_clock(dyn_clock.clone());
        let connector = Arc::new(MemoryConnector::new(Arc::clone(&backend)));
        let pool = StorePool::new(connector.clone(), dyn_clock.clone(), config.idle_window);
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let queue = JobQueue::new(
            pool.clone(),
            dyn_clock,
            Arc::clone(&ids),
            QueueSettings::from(&config),
        );
        Self {
            clock,
            backend,
            connector,
            pool,
            ids,
            config,
            queue,
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// A second queue handle on the same store, as another process would have.
    pub fn other_process_queue(&self) -> JobQueue {
        JobQueue::new(
            self.pool.clone(),
            self.clock(),
            Arc::clone(&self.ids),
            QueueSettings::from(&self.config),
        )
    }

    pub fn machine(&self) -> EntityStatusMachine {
        EntityStatusMachine::new(
            self.pool.clone(),
            self.queue.clone(),
            self.clock(),
            self.config.repair_grace,
        )
    }

    pub fn recorder(&self) -> TaskRecorder {
        TaskRecorder::new(self.pool.clone(), self.clock(), Arc::clone(&self.ids))
    }

    /// A pool whose connections fail writes to the keys `faults` names.
    pub fn faulty_pool(&self, faults: &Faults) -> StorePool {
        let connector = Arc::new(FaultyConnector {
            backend: Arc::clone(&self.backend),
            faults: faults.clone(),
        });
        StorePool::new(connector, self.clock(), self.config.idle_window)
    }

    pub fn advance(&self, by: Duration) {
        self.clock
            .advance(chrono::Duration::from_std(by).unwrap());
    }
}

pub(crate) fn test_config() -> PipelineConfig {
    PipelineConfig {
        default_backoff: RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60)),
        poll_interval: Duration::from_millis(10),
        default_max_attempts: 3,
        ..PipelineConfig::default()
    }
}

/// Keys whose writes currently fail.
#[derive(Clone, Default)]
pub(crate) struct Faults {
    broken: Arc<Mutex<Vec<String>>>,
}

impl Faults {
    pub fn break_writes_to(&self, key: impl Into<String>) {
        self.broken
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key.into());
    }

    pub fn heal(&self) {
        self.broken
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn check(&self, key: &str) -> Result<(), StoreError> {
        let broken = self.broken.lock().unwrap_or_else(PoisonError::into_inner);
        if broken.iter().any(|k| k == key) {
            return Err(StoreError::Unavailable(format!("injected write failure on `{key}`")));
        }
        Ok(())
    }
}

struct FaultyConnector {
    backend: Arc<MemoryBackend>,
    faults: Faults,
}

#[async_trait]
impl StoreConnector for FaultyConnector {
    async fn connect(&self) -> Result<Arc<dyn SharedStore>, StoreError> {
        Ok(Arc::new(FaultyStore {
            inner: self.backend.connect(),
            faults: self.faults.clone(),
        }))
    }
}

struct FaultyStore {
    inner: crate::impls::MemoryStore,
    faults: Faults,
}

#[async_trait]
impl SharedStore for FaultyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.faults.check(key)?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.faults.check(key)?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        self.faults.check(key)?;
        self.inner.compare_and_swap(key, expected, new).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.faults.check(key)?;
        self.inner.compare_and_delete(key, expected).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.faults.check(key)?;
        self.inner.delete(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.inner.expire(key, ttl).await
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        self.faults.check(key)?;
        self.inner.list_push(key, value).await
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list_range(key).await
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        self.inner.list_len(key).await
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.faults.check(key)?;
        self.inner.list_pop_front(key).await
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        self.faults.check(key)?;
        self.inner.list_remove(key, value).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.faults.check(key)?;
        self.inner.incr_by(key, delta).await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError> {
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        self.inner.subscribe(channel).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.close().await
    }
}
