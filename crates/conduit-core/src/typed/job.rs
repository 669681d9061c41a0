//! JobKind trait - 型付き payload と queue の対応付け
//!
//! # 学習ポイント
//! - Associated Constants (`const QUEUE`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)
//! - tagged union (`JobPayload`) との相互変換

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{
    AutoRenameConversation, EntityId, IndexConversation, JobPayload, PayloadError,
    SummarizeConversation,
};

/// JobKind は queue 名と payload 型を対応付ける
///
/// # 使用例
/// ```ignore
/// impl JobKind for IndexConversation {
///     const QUEUE: &'static str = "conduit.conversation.index.v1";
///     ...
/// }
/// ```
pub trait JobKind: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// queue 名
    ///
    /// # 命名規約
    /// - `{namespace}.{domain}.{action}.v{major}`
    const QUEUE: &'static str;

    /// enqueue 時の検証。失敗した payload は queue に入らない
    fn validate(&self) -> Result<(), PayloadError>;

    /// 同じ key の live job は 1 つにまとめられる
    fn dedup_key(&self) -> String;

    /// indexing status を追従させる entity
    fn tracked_entity(&self) -> Option<&EntityId> {
        None
    }

    fn into_payload(self) -> JobPayload;

    /// `None` if the payload belongs to another kind.
    fn from_payload(payload: JobPayload) -> Option<Self>;
}

fn require_id(id: &EntityId) -> Result<(), PayloadError> {
    if id.as_str().trim().is_empty() {
        return Err(PayloadError::EmptyField("conversation_id"));
    }
    Ok(())
}

impl JobKind for IndexConversation {
    const QUEUE: &'static str = "conduit.conversation.index.v1";

    fn validate(&self) -> Result<(), PayloadError> {
        require_id(&self.conversation_id)
    }

    fn dedup_key(&self) -> String {
        self.conversation_id.to_string()
    }

    fn tracked_entity(&self) -> Option<&EntityId> {
        Some(&self.conversation_id)
    }

    fn into_payload(self) -> JobPayload {
        JobPayload::IndexConversation(self)
    }

    fn from_payload(payload: JobPayload) -> Option<Self> {
        match payload {
            JobPayload::IndexConversation(p) => Some(p),
            _ => None,
        }
    }
}

impl JobKind for SummarizeConversation {
    const QUEUE: &'static str = "conduit.conversation.summarize.v1";

    fn validate(&self) -> Result<(), PayloadError> {
        require_id(&self.conversation_id)
    }

    fn dedup_key(&self) -> String {
        self.conversation_id.to_string()
    }

    fn into_payload(self) -> JobPayload {
        JobPayload::SummarizeConversation(self)
    }

    fn from_payload(payload: JobPayload) -> Option<Self> {
        match payload {
            JobPayload::SummarizeConversation(p) => Some(p),
            _ => None,
        }
    }
}

impl JobKind for AutoRenameConversation {
    const QUEUE: &'static str = "conduit.conversation.rename.v1";

    fn validate(&self) -> Result<(), PayloadError> {
        require_id(&self.conversation_id)?;
        if self.opening_messages.iter().all(|m| m.trim().is_empty()) {
            return Err(PayloadError::EmptyField("opening_messages"));
        }
        Ok(())
    }

    fn dedup_key(&self) -> String {
        self.conversation_id.to_string()
    }

    fn into_payload(self) -> JobPayload {
        JobPayload::AutoRenameConversation(self)
    }

    fn from_payload(payload: JobPayload) -> Option<Self> {
        match payload {
            JobPayload::AutoRenameConversation(p) => Some(p),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_are_distinct() {
        let names = [
            IndexConversation::QUEUE,
            SummarizeConversation::QUEUE,
            AutoRenameConversation::QUEUE,
        ];
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn payload_roundtrips_through_the_union() {
        let p = SummarizeConversation {
            conversation_id: EntityId::new("conv-3"),
            force: true,
        };
        let union = p.clone().into_payload();
        assert_eq!(union.queue_name(), SummarizeConversation::QUEUE);
        assert_eq!(SummarizeConversation::from_payload(union.clone()), Some(p));
        assert_eq!(IndexConversation::from_payload(union), None);
    }

    #[test]
    fn rename_needs_some_message_text() {
        let p = AutoRenameConversation {
            conversation_id: EntityId::new("conv-1"),
            opening_messages: vec!["  ".into()],
        };
        assert_eq!(p.validate(), Err(PayloadError::EmptyField("opening_messages")));
    }
}
