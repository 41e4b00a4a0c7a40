//! Task-level events published to agent webhooks.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tasks::Task;

/// All recognised task event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskEventKind {
    /// A worker took the task (`task.accepted`).
    #[serde(rename = "task.accepted")]
    Accepted,
    /// A deliverable was accepted and the task is done (`task.completed`).
    #[serde(rename = "task.completed")]
    Completed,
    /// The task timed out or was cancelled (`task.failed`).
    #[serde(rename = "task.failed")]
    Failed,
}

impl TaskEventKind {
    pub const ALL: [TaskEventKind; 3] = [Self::Accepted, Self::Completed, Self::Failed];

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "task.accepted" => Some(Self::Accepted),
            "task.completed" => Some(Self::Completed),
            "task.failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Wire name, also used as the `X-ToolCall-Event` header value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "task.accepted",
            Self::Completed => "task.completed",
            Self::Failed => "task.failed",
        }
    }
}

/// The JSON body delivered to every subscribed endpoint. Built once per event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TaskEventKind,
    pub created_at: String,
    pub task: Task,
}

impl EventEnvelope {
    pub fn new(kind: TaskEventKind, task: &Task, now: i64) -> Self {
        let created_at = Utc
            .timestamp_opt(now, 0)
            .single()
            .unwrap_or_else(Utc::now)
            .to_rfc3339();
        Self {
            id: format!("evt_{}", Uuid::new_v4().as_simple()),
            kind,
            created_at,
            task: task.clone(),
        }
    }
}
