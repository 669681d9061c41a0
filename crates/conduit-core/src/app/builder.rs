//! PipelineBuilder - パイプラインの構築とワイヤリング
//!
//! # 起動時検証（Fail-fast）
//! - `expect_queues()` で期待される queue を登録
//! - `build()` 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - 不足があれば BuildError を返す

use std::sync::Arc;

use super::pipeline::Pipeline;
use crate::config::PipelineConfig;
use crate::impls::{MemoryBackend, MemoryConnector};
use crate::ports::{Clock, IdGenerator, StoreConnector, SystemClock, UlidGenerator};
use crate::queue::{JobQueue, QueueSettings};
use crate::recorder::TaskRecorder;
use crate::status::EntityStatusMachine;
use crate::store::StorePool;
use crate::typed::{Handler, HandlerRegistry, JobKind, RegistryError};

/// PipelineBuilder はパイプラインを構築
///
/// # 使用例
/// ```ignore
/// let pipeline = PipelineBuilder::new()
///     .connector(Arc::new(my_connector))
///     .register::<IndexConversation, _>(Indexer)?
///     .expect_queues(&[IndexConversation::QUEUE])
///     .build()?;
/// ```
///
/// connector を指定しなければプロセス内のメモリストアを使う（開発・テスト用）。
pub struct PipelineBuilder {
    registry: HandlerRegistry,
    expected_queues: Option<Vec<String>>,
    config: PipelineConfig,
    clock: Option<Arc<dyn Clock>>,
    connector: Option<Arc<dyn StoreConnector>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

/// BuildError はパイプライン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing queues: {0:?}. These queues were expected but have no handler.")]
    MissingQueues(Vec<String>),
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            expected_queues: None,
            config: PipelineConfig::default(),
            clock: None,
            connector: None,
            ids: None,
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn StoreConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Register a handler with the configured default concurrency.
    pub fn register<T: JobKind, H: Handler<T> + 'static>(
        self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        let concurrency = self.config.default_concurrency;
        self.register_with_concurrency::<T, H>(handler, concurrency)
    }

    pub fn register_with_concurrency<T: JobKind, H: Handler<T> + 'static>(
        mut self,
        handler: H,
        concurrency: usize,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler, concurrency)?;
        Ok(self)
    }

    pub fn expect_queues(mut self, queues: &[&str]) -> Self {
        self.expected_queues = Some(queues.iter().map(|q| q.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Pipeline, BuildError> {
        if let Some(expected) = &self.expected_queues {
            let registered = self.registry.queues();
            let missing: Vec<String> = expected
                .iter()
                .filter(|q| !registered.contains(&q.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingQueues(missing));
            }
        }

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let connector: Arc<dyn StoreConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(MemoryConnector::new(MemoryBackend::with_clock(Arc::clone(&clock)))),
        };
        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(Arc::clone(&clock))),
        };

        let pool = StorePool::new(connector, Arc::clone(&clock), self.config.idle_window);
        let queue = JobQueue::new(
            pool.clone(),
            Arc::clone(&clock),
            ids.clone(),
            QueueSettings::from(&self.config),
        );
        let statuses = EntityStatusMachine::new(
            pool.clone(),
            queue.clone(),
            Arc::clone(&clock),
            self.config.repair_grace,
        );
        let recorder = TaskRecorder::new(pool.clone(), clock, ids);

        Ok(Pipeline {
            config: self.config,
            pool,
            queue,
            statuses,
            recorder,
            registry: self.registry,
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IndexConversation, SummarizeConversation};
    use crate::typed::handler::tests::EchoIndexer;

    #[test]
    fn build_succeeds_when_expected_queues_are_registered() {
        let pipeline = PipelineBuilder::new()
            .register::<IndexConversation, _>(EchoIndexer)
            .unwrap()
            .expect_queues(&[IndexConversation::QUEUE])
            .build()
            .unwrap();
        assert_eq!(pipeline.registry().queues(), vec![IndexConversation::QUEUE]);
        assert_eq!(
            pipeline.registry().get(IndexConversation::QUEUE).unwrap().concurrency,
            PipelineConfig::default().default_concurrency
        );
    }

    #[test]
    fn build_reports_missing_queues() {
        let result = PipelineBuilder::new()
            .register::<IndexConversation, _>(EchoIndexer)
            .unwrap()
            .expect_queues(&[IndexConversation::QUEUE, SummarizeConversation::QUEUE])
            .build();
        assert!(matches!(
            result,
            Err(BuildError::MissingQueues(missing)) if missing == vec![SummarizeConversation::QUEUE.to_string()]
        ));
    }

    #[test]
    fn build_without_expectations() {
        assert!(PipelineBuilder::new().build().is_ok());
    }

    #[test]
    fn concurrency_can_be_set_per_queue() {
        let pipeline = PipelineBuilder::new()
            .register_with_concurrency::<IndexConversation, _>(EchoIndexer, 5)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(pipeline.registry().get(IndexConversation::QUEUE).unwrap().concurrency, 5);
    }
}
