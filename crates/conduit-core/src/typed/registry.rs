//! HandlerRegistry - Handler の登録と管理
//!
//! Worker pool に明示的に渡すオブジェクト（グローバル登録はしない）。
//! queue ごとに Handler と並行数（worker slot 数）を持つ。

use std::collections::BTreeMap;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::job::JobKind;

/// RegistryError は HandlerRegistry の操作エラー
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for queue '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("queue '{0}' needs at least one worker slot")]
    ZeroConcurrency(String),
}

#[derive(Clone)]
pub struct Registration {
    pub handler: Arc<dyn DynHandler>,
    pub concurrency: usize,
}

/// HandlerRegistry は queue 名 → Handler の対応を管理
///
/// # 使用例
/// ```ignore
/// let mut registry = HandlerRegistry::new();
/// registry.register::<IndexConversation, _>(Indexer, 4)?;
/// ```
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    // BTreeMap: worker を起動する順序を安定させる
    handlers: BTreeMap<&'static str, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: JobKind, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
        concurrency: usize,
    ) -> Result<(), RegistryError> {
        if concurrency == 0 {
            return Err(RegistryError::ZeroConcurrency(T::QUEUE.to_string()));
        }
        if self.handlers.contains_key(T::QUEUE) {
            return Err(RegistryError::AlreadyRegistered(T::QUEUE.to_string()));
        }
        let registration = Registration {
            handler: Arc::new(TypedHandler::new(handler)),
            concurrency,
        };
        self.handlers.insert(T::QUEUE, registration);
        Ok(())
    }

    pub fn get(&self, queue: &str) -> Option<&Registration> {
        self.handlers.get(queue)
    }

    pub fn queues(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Registration)> {
        self.handlers.iter().map(|(q, r)| (*q, r))
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HandlerResult, IndexConversation, JobOutput, SummarizeConversation};
    use crate::typed::JobContext;
    use crate::typed::handler::tests::EchoIndexer;
    use async_trait::async_trait;

    struct NoopSummarizer;

    #[async_trait]
    impl Handler<SummarizeConversation> for NoopSummarizer {
        async fn handle(&self, _job: SummarizeConversation, _ctx: JobContext) -> HandlerResult {
            Ok(JobOutput::empty())
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry.register::<IndexConversation, _>(EchoIndexer, 2).unwrap();

        let reg = registry.get(IndexConversation::QUEUE).unwrap();
        assert_eq!(reg.concurrency, 2);
        assert_eq!(reg.handler.queue(), IndexConversation::QUEUE);
        assert!(registry.get(SummarizeConversation::QUEUE).is_none());
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register::<IndexConversation, _>(EchoIndexer, 1).unwrap();
        let result = registry.register::<IndexConversation, _>(EchoIndexer, 1);
        assert_eq!(
            result.err(),
            Some(RegistryError::AlreadyRegistered(IndexConversation::QUEUE.into()))
        );
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut registry = HandlerRegistry::new();
        let result = registry.register::<IndexConversation, _>(EchoIndexer, 0);
        assert!(matches!(result, Err(RegistryError::ZeroConcurrency(_))));
    }

    #[test]
    fn queues_are_listed_in_a_stable_order() {
        let mut registry = HandlerRegistry::new();
        registry.register::<SummarizeConversation, _>(NoopSummarizer, 1).unwrap();
        registry.register::<IndexConversation, _>(EchoIndexer, 1).unwrap();

        let mut expected = vec![IndexConversation::QUEUE, SummarizeConversation::QUEUE];
        expected.sort();
        assert_eq!(registry.queues(), expected);
    }
}
