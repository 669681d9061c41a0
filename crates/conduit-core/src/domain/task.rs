//! Agent task records and their append-only event log.
//!
//! The record is the commit point of an append: counters, `last_seq` and the
//! event itself (as `pending_event`) land in one write. The event log is filled
//! in afterwards; until it is, the pending event stands in for it.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{EventId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventType {
    /// `data.status` carries the new `TaskStatus`.
    StatusChange,
    /// `data.role` / `data.content`.
    Message,
    /// `data.tool_name` names the tool.
    ToolCall,
    ToolResult,
    /// `data.tokens_in` / `data.tokens_out` are added to the running totals.
    TokenUsage,
    /// `data.title` / `data.content`: a named section of the task's output.
    Section,
    Log,
}

/// Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: EventId,
    pub task_id: TaskId,
    /// Per-task sequence number; ties on `timestamp` are broken by it.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: TaskEventType,
    pub data: serde_json::Value,
}

/// Reason an event could not be applied to its task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("status_change event needs a valid `status`, got {0}")]
    InvalidStatus(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub user_id: String,
    pub status: TaskStatus,
    pub name: String,
    pub tool_name: Option<String>,
    pub message_count: u64,
    pub tool_call_count: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub archived: bool,
    /// Highest committed event seq.
    #[serde(default)]
    pub last_seq: u64,
    /// Committed event the log has not confirmed yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_event: Option<TaskEvent>,
}

impl TaskRecord {
    pub fn new(
        task_id: TaskId,
        user_id: impl Into<String>,
        name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            user_id: user_id.into(),
            status: TaskStatus::Pending,
            name: name.into(),
            tool_name: None,
            message_count: 0,
            tool_call_count: 0,
            tokens_in: 0,
            tokens_out: 0,
            created_at: now,
            last_activity_at: now,
            archived: false,
            last_seq: 0,
            pending_event: None,
        }
    }

    pub fn tokens_total(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }

    /// Fold one event into the denormalized counters.
    pub fn apply(&mut self, event: &TaskEvent) -> Result<(), EventError> {
        match event.event_type {
            TaskEventType::StatusChange => {
                let raw = event.data.get("status").cloned().unwrap_or_default();
                let status: TaskStatus = serde_json::from_value(raw.clone())
                    .map_err(|_| EventError::InvalidStatus(raw.to_string()))?;
                self.status = status;
            }
            TaskEventType::Message => self.message_count += 1,
            TaskEventType::ToolCall => {
                self.tool_call_count += 1;
                if let Some(name) = event.data.get("tool_name").and_then(|v| v.as_str()) {
                    self.tool_name = Some(name.to_string());
                }
            }
            TaskEventType::TokenUsage => {
                self.tokens_in += read_u64(&event.data, "tokens_in");
                self.tokens_out += read_u64(&event.data, "tokens_out");
            }
            TaskEventType::ToolResult | TaskEventType::Section | TaskEventType::Log => {}
        }
        self.last_activity_at = self.last_activity_at.max(event.timestamp);
        Ok(())
    }

    /// Apply `event` and keep it pending until the log confirms it.
    pub fn commit(&mut self, event: &TaskEvent) -> Result<(), EventError> {
        self.apply(event)?;
        self.last_seq = self.last_seq.max(event.seq);
        self.pending_event = Some(event.clone());
        Ok(())
    }

    /// The committed subset of `logged`, plus the pending event if the log
    /// lacks it. Uncommitted leftovers and duplicate appends are dropped.
    pub fn committed_events(&self, logged: Vec<TaskEvent>) -> Vec<TaskEvent> {
        let mut seen = HashSet::new();
        let mut events: Vec<TaskEvent> = logged
            .into_iter()
            .filter(|e| e.seq <= self.last_seq && seen.insert(e.seq))
            .collect();
        if let Some(pending) = &self.pending_event
            && seen.insert(pending.seq)
        {
            events.push(pending.clone());
        }
        events
    }
}

fn read_u64(data: &serde_json::Value, field: &str) -> u64 {
    data.get(field).and_then(|v| v.as_u64()).unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSection {
    pub title: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Full reconstruction of a task for detail views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDetail {
    pub task: TaskRecord,
    pub events: Vec<TaskEvent>,
    pub sections: Vec<TaskSection>,
    pub messages: Vec<TaskMessage>,
}

impl TaskDetail {
    /// Derive sections and messages from the ordered event list.
    pub fn from_events(task: TaskRecord, mut events: Vec<TaskEvent>) -> Self {
        events.sort_by_key(|e| (e.timestamp, e.seq));

        let text = |e: &TaskEvent, field: &str| {
            e.data
                .get(field)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        let sections = events
            .iter()
            .filter(|e| e.event_type == TaskEventType::Section)
            .map(|e| TaskSection {
                title: text(e, "title"),
                content: text(e, "content"),
                timestamp: e.timestamp,
            })
            .collect();

        let messages = events
            .iter()
            .filter(|e| e.event_type == TaskEventType::Message)
            .map(|e| TaskMessage {
                role: text(e, "role"),
                content: text(e, "content"),
                timestamp: e.timestamp,
            })
            .collect();

        Self {
            task,
            events,
            sections,
            messages,
        }
    }
}
