//! Handler outcome model.
//!
//! A handler either succeeds (optionally returning a small JSON summary that is
//! kept on the job record) or fails with a typed `HandlerError`. The queue, not
//! the handler, decides whether a failure is retried.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typed failure returned by a job handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Recoverable failure; retried with backoff while the budget lasts.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retrying cannot help; the job fails immediately.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The handler observed the cancellation signal and stopped.
    #[error("cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Message persisted as `last_error` / `indexing_error`.
    pub fn message(&self) -> String {
        match self {
            Self::Transient(msg) | Self::Permanent(msg) => msg.clone(),
            Self::Cancelled => "cancelled".to_string(),
        }
    }
}

/// What a successful handler run produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<serde_json::Value>,
}

impl JobOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_summary(summary: serde_json::Value) -> Self {
        Self {
            summary: Some(summary),
        }
    }
}

pub type HandlerResult = Result<JobOutput, HandlerError>;
