//! Errors - エラー型と分類
//!
//! 分類:
//! - **NotFound**: 未知の entity / task / job（呼び出し側で 404 相当）
//! - **Store**: 共有ストアに到達できない。処理中の操作は失敗させる（偽の成功は返さない）
//! - **InvalidPayload**: enqueue 時の payload 検証失敗
//!
//! Conflict は `RetryOutcome::Conflict` として構造化された結果で返すので、ここには含めない。
//! TransientFailure は queue 内部で吸収され、呼び出し側には出てこない。

use thiserror::Error;

use super::task::EventError;
use crate::ports::StoreError;

/// PayloadError is raised when a job payload fails validation at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("payload kind `{kind}` does not belong to queue `{queue}`")]
    WrongQueue { kind: &'static str, queue: String },
}

/// PipelineError はパイプライン全体の操作エラー
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] PayloadError),

    #[error("invalid task event: {0}")]
    InvalidEvent(#[from] EventError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
