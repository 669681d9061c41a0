//! Stable key layout in the shared store.
//!
//! | key                       | value                                   |
//! |---------------------------|-----------------------------------------|
//! | `job:{id}`                | `JobRecord` JSON                        |
//! | `jobs:{queue}`            | list of job ids (queue index)           |
//! | `dedup:{queue}:{key}`     | id of the live job holding the key      |
//! | `completed:{queue}`       | completed ids, oldest first (retention) |
//! | `failed:{queue}`          | failed ids, oldest first (retention)    |
//! | `cancelled:{queue}`       | cancelled ids, oldest first (retention) |
//! | `entity:{id}`             | `EntityStatusRecord` JSON               |
//! | `entities`                | list of entity ids                      |
//! | `task:{id}`               | `TaskRecord` JSON                       |
//! | `task:{id}:events`        | list of `TaskEvent` JSON                |
//! | `task:{id}:seq`           | event sequence counter                  |
//! | `tasks`                   | list of task ids                        |
//! | `user:{user}:tasks`       | list of task ids per user               |

use crate::domain::{EntityId, JobId, TaskId};

pub const ENTITIES: &str = "entities";
pub const TASKS: &str = "tasks";

/// Pub/sub channel carrying ids of cancelled jobs.
pub const CANCELLED_CHANNEL: &str = "jobs:cancelled";

pub fn job(id: JobId) -> String {
    format!("job:{}", id.as_ulid())
}

pub fn queue_index(queue: &str) -> String {
    format!("jobs:{queue}")
}

pub fn dedup(queue: &str, dedup_key: &str) -> String {
    format!("dedup:{queue}:{dedup_key}")
}

pub fn completed(queue: &str) -> String {
    format!("completed:{queue}")
}

pub fn failed(queue: &str) -> String {
    format!("failed:{queue}")
}

pub fn cancelled(queue: &str) -> String {
    format!("cancelled:{queue}")
}

pub fn entity(id: &EntityId) -> String {
    format!("entity:{id}")
}

pub fn task(id: TaskId) -> String {
    format!("task:{}", id.as_ulid())
}

pub fn task_events(id: TaskId) -> String {
    format!("task:{}:events", id.as_ulid())
}

pub fn task_seq(id: TaskId) -> String {
    format!("task:{}:seq", id.as_ulid())
}

pub fn user_tasks(user_id: &str) -> String {
    format!("user:{user_id}:tasks")
}

/// Pub/sub channel for live progress of one task.
pub fn task_channel(id: TaskId) -> String {
    format!("task-events:{}", id.as_ulid())
}
