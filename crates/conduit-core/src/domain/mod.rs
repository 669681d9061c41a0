//! Domain model (ids, payloads, records, state transitions, errors).
//!
//! Nothing in here touches the store; records are plain data with transition
//! methods so the persistence layer can apply them inside CAS loops.

pub mod entity;
pub mod errors;
pub mod ids;
pub mod job;
pub mod outcome;
pub mod payload;
pub mod snapshot;
pub mod task;

pub use entity::{EntityStatusRecord, IndexingStatus, StatusView};
pub use errors::{PayloadError, PipelineError, Result};
pub use ids::{EntityId, EventId, JobId, ParseIdError, TaskId};
pub use job::{EnqueueOptions, FailDisposition, JobHandle, JobRecord, JobState};
pub use outcome::{HandlerError, HandlerResult, JobOutput};
pub use payload::{AutoRenameConversation, IndexConversation, JobPayload, SummarizeConversation};
pub use snapshot::AggregateStatus;
pub use task::{
    EventError, TaskDetail, TaskEvent, TaskEventType, TaskMessage, TaskRecord, TaskSection,
    TaskStatus,
};
