//! Domain identifiers (strongly-typed IDs).
//!
//! ## ULID ベースの ID
//! Job / Task / Event の ID は ULID を使います。
//! - 時刻でソート可能（生成順 = 辞書順）
//! - 調整なしで複数プロセスから生成できる
//!
//! ## Phantom Type パターン
//! `Id<T>` で共通実装を持ちつつ、`T` はマーカー型としてコンパイル時に
//! JobId と TaskId の取り違えを防ぎます。
//!
//! Entity の ID（会話 ID など）は外部から渡される文字列なので、
//! ULID ではなく `EntityId` newtype で表現します。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// Display で使うプレフィックス（例: "job-", "task-"）
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when an id string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid id: {0}")]
pub struct ParseIdError(pub String);

/// Accepts both the prefixed display form (`job-01H...`) and a bare ULID.
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError(s.to_string()))
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Event {}

impl IdMarker for Event {
    fn prefix() -> &'static str {
        "evt-"
    }
}

/// Identifier of a queued job (enqueue/cancel/inspect unit).
pub type JobId = Id<Job>;

/// Identifier of an agent task tracked by the recorder.
pub type TaskId = Id<Task>;

/// Identifier of a single task event.
pub type EventId = Id<Event>;

/// Identifier of a user-facing entity (e.g. a conversation).
///
/// Supplied by the API layer after validation; never generated here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let job = JobId::from_ulid(Ulid::new());
        let task = TaskId::from_ulid(Ulid::new());
        let event = EventId::from_ulid(Ulid::new());

        assert!(job.to_string().starts_with("job-"));
        assert!(task.to_string().starts_with("task-"));
        assert!(event.to_string().starts_with("evt-"));
        // let _: JobId = task; // <- does not compile
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = JobId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = JobId::from_ulid(Ulid::new());

        assert!(id1 < id2);
    }

    #[test]
    fn ids_serialize_as_bare_ulid() {
        let ulid = Ulid::new();
        let job_id = JobId::from_ulid(ulid);

        let s = serde_json::to_string(&job_id).unwrap();
        assert_eq!(s, format!("\"{ulid}\""));

        let back: JobId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, job_id);
    }

    #[test]
    fn parse_accepts_prefixed_and_bare_forms() {
        let task = TaskId::from_ulid(Ulid::new());

        assert_eq!(task.to_string().parse::<TaskId>().unwrap(), task);
        assert_eq!(task.as_ulid().to_string().parse::<TaskId>().unwrap(), task);
        assert!("task-not-a-ulid".parse::<TaskId>().is_err());
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<JobId>(), size_of::<Ulid>());
        assert_eq!(size_of::<TaskId>(), 16);
    }
}
