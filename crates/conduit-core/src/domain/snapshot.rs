//! Aggregate status snapshot for status/health endpoints.
//!
//! Derived on read; never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStatus {
    /// Conversations with indexing queued or running.
    pub active_conversations: usize,
    /// Agent tasks still pending or running.
    pub active_tasks: usize,
    /// Tokens consumed so far by active tasks.
    pub tokens_active: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub summarizer_enabled: bool,
}

impl AggregateStatus {
    pub(crate) fn observe_activity(&mut self, at: DateTime<Utc>) {
        self.last_activity_at = Some(self.last_activity_at.map_or(at, |prev| prev.max(at)));
    }
}
