//! Handler trait - job を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler)
//!
//! # キャンセル
//! Handler は `JobContext` 経由でキャンセル信号を受け取る。
//! I/O の境目で `ctx.checkpoint()?` を呼ぶか、`ctx.cancelled()` と select して
//! 中断したら `HandlerError::Cancelled` を返す（failed ではなく cancelled 扱い）。

use std::marker::PhantomData;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::job::JobKind;
use crate::domain::{HandlerError, HandlerResult, JobId, JobPayload};

/// Per-run information handed to a handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    /// 1-based attempt number of this run.
    pub attempt: u32,
    pub max_attempts: u32,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(job_id: JobId, attempt: u32, max_attempts: u32, cancel: CancellationToken) -> Self {
        Self {
            job_id,
            attempt,
            max_attempts,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the job is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// `Err(Cancelled)` if the job has been cancelled.
    pub fn checkpoint(&self) -> Result<(), HandlerError> {
        if self.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }
        Ok(())
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Handler は payload を処理して結果を返す
///
/// # 使用例
/// ```ignore
/// struct Indexer;
///
/// #[async_trait]
/// impl Handler<IndexConversation> for Indexer {
///     async fn handle(&self, job: IndexConversation, ctx: JobContext) -> HandlerResult {
///         ctx.checkpoint()?;
///         Ok(JobOutput::empty())
///     }
/// }
/// ```
///
/// # ジェネリクスによる型安全性
/// - `Handler<IndexConversation>` は `IndexConversation` しか受け取れない
/// - コンパイル時に queue と Handler の対応が保証される
#[async_trait]
pub trait Handler<T: JobKind>: Send + Sync {
    async fn handle(&self, job: T, ctx: JobContext) -> HandlerResult;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// TypedHandler<T> を DynHandler に変換することで、
/// HashMap<String, Arc<dyn DynHandler>> に格納可能にします。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, payload: JobPayload, ctx: JobContext) -> HandlerResult;

    fn queue(&self) -> &'static str;
}

pub struct TypedHandler<T: JobKind, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: JobKind, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: JobKind, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(&self, payload: JobPayload, ctx: JobContext) -> HandlerResult {
        let kind = payload.kind();
        let job = T::from_payload(payload).ok_or_else(|| {
            HandlerError::permanent(format!("payload `{kind}` cannot run on queue `{}`", T::QUEUE))
        })?;
        self.handler.handle(job, ctx).await
    }

    fn queue(&self) -> &'static str {
        T::QUEUE
    }
}
