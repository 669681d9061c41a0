//! Job payloads.
//!
//! Every queue has exactly one payload shape. `JobPayload` is the tagged union that
//! is persisted on the job record; each variant's struct implements
//! [`JobKind`](crate::typed::JobKind), which pins it to a queue name and owns its
//! validation and dedup-key rules.

use serde::{Deserialize, Serialize};

use super::errors::PayloadError;
use super::ids::EntityId;
use crate::typed::JobKind;

/// Build the search index for a conversation.
///
/// This is the only payload whose progress is mirrored into the entity
/// indexing-status state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConversation {
    pub conversation_id: EntityId,
}

/// Produce (or refresh) a conversation summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarizeConversation {
    pub conversation_id: EntityId,

    /// Regenerate even if a summary already exists.
    #[serde(default)]
    pub force: bool,
}

/// Derive a title for a conversation from its opening messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoRenameConversation {
    pub conversation_id: EntityId,
    pub opening_messages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    IndexConversation(IndexConversation),
    SummarizeConversation(SummarizeConversation),
    AutoRenameConversation(AutoRenameConversation),
}

impl JobPayload {
    pub fn queue_name(&self) -> &'static str {
        match self {
            Self::IndexConversation(_) => IndexConversation::QUEUE,
            Self::SummarizeConversation(_) => SummarizeConversation::QUEUE,
            Self::AutoRenameConversation(_) => AutoRenameConversation::QUEUE,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::IndexConversation(_) => "index_conversation",
            Self::SummarizeConversation(_) => "summarize_conversation",
            Self::AutoRenameConversation(_) => "auto_rename_conversation",
        }
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        match self {
            Self::IndexConversation(p) => p.validate(),
            Self::SummarizeConversation(p) => p.validate(),
            Self::AutoRenameConversation(p) => p.validate(),
        }
    }

    /// Validate the payload and check it belongs to `queue`.
    pub fn validate_for(&self, queue: &str) -> Result<(), PayloadError> {
        if self.queue_name() != queue {
            return Err(PayloadError::WrongQueue {
                kind: self.kind(),
                queue: queue.to_string(),
            });
        }
        self.validate()
    }

    pub fn dedup_key(&self) -> String {
        match self {
            Self::IndexConversation(p) => p.dedup_key(),
            Self::SummarizeConversation(p) => p.dedup_key(),
            Self::AutoRenameConversation(p) => p.dedup_key(),
        }
    }

    /// Entity whose indexing status follows this job, if any.
    pub fn tracked_entity(&self) -> Option<&EntityId> {
        match self {
            Self::IndexConversation(p) => p.tracked_entity(),
            Self::SummarizeConversation(p) => p.tracked_entity(),
            Self::AutoRenameConversation(p) => p.tracked_entity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(id: &str) -> JobPayload {
        JobPayload::IndexConversation(IndexConversation {
            conversation_id: EntityId::new(id),
        })
    }

    #[test]
    fn payload_is_tagged_by_kind() {
        let v = serde_json::to_value(index("conv-1")).unwrap();
        assert_eq!(v["kind"], "index_conversation");
        assert_eq!(v["conversation_id"], "conv-1");
    }

    #[test]
    fn summarize_force_defaults_to_false() {
        let p: JobPayload = serde_json::from_str(
            r#"{ "kind": "summarize_conversation", "conversation_id": "conv-9" }"#,
        )
        .unwrap();
        assert!(matches!(
            p,
            JobPayload::SummarizeConversation(SummarizeConversation { force: false, .. })
        ));
    }

    #[test]
    fn validate_for_rejects_foreign_queue() {
        let err = index("conv-1")
            .validate_for(SummarizeConversation::QUEUE)
            .unwrap_err();
        assert!(matches!(err, PayloadError::WrongQueue { kind: "index_conversation", .. }));
    }

    #[test]
    fn validate_rejects_empty_conversation_id() {
        assert_eq!(
            index("").validate(),
            Err(PayloadError::EmptyField("conversation_id"))
        );
    }

    #[test]
    fn only_indexing_tracks_the_entity() {
        let summarize = JobPayload::SummarizeConversation(SummarizeConversation {
            conversation_id: EntityId::new("conv-1"),
            force: false,
        });
        assert_eq!(index("conv-1").tracked_entity(), Some(&EntityId::new("conv-1")));
        assert_eq!(summarize.tracked_entity(), None);
    }
}
