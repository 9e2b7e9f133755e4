//! Task Ledger row types: durable records for long-lived background work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Distinguished error marker recorded when a task is cancelled.
/// Cancellation is a `failed` row carrying this marker, not a fifth status.
pub const CANCELLED_MARKER: &str = "cancelled";

/// Lifecycle of a background task. Terminal rows are never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BackgroundTaskRow {
    /// Caller-generated opaque id, so clients can poll immediately after enqueue.
    pub id: String,
    pub owner_id: Uuid,
    pub kind: String,
    pub title: String,
    pub status: String,
    pub error: Option<String>,
    pub result: Option<Value>,
    /// Millisecond timestamp, as reported by the enqueueing client.
    pub created_at: i64,
    pub device_id: Option<String>,
    pub should_refresh_list: bool,
    pub updated_at: DateTime<Utc>,
}

impl BackgroundTaskRow {
    pub fn status(&self) -> Option<TaskStatus> {
        TaskStatus::parse(&self.status)
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == Some(TaskStatus::Failed)
            && self.error.as_deref() == Some(CANCELLED_MARKER)
    }
}

/// Fields supplied by the caller when a task is created. Status starts `queued`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub id: String,
    pub owner_id: Uuid,
    pub kind: String,
    pub title: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub should_refresh_list: bool,
    /// Client clock, milliseconds since epoch.
    pub created_at: i64,
}

/// A single idempotent status write. `result: None` leaves any stored payload
/// in place; the error column is always overwritten.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: TaskStatus,
    pub error: Option<String>,
    pub result: Option<Value>,
}

impl StatusUpdate {
    pub fn completed() -> Self {
        StatusUpdate {
            status: TaskStatus::Completed,
            error: None,
            result: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        StatusUpdate {
            status: TaskStatus::Failed,
            error: Some(error.into()),
            result: None,
        }
    }

    pub fn running() -> Self {
        StatusUpdate {
            status: TaskStatus::Running,
            error: None,
            result: None,
        }
    }
}
