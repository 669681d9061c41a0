//! Recorder - agent task の event log と集計

mod task_recorder;

pub use self::task_recorder::{TaskEventStream, TaskRecorder};
