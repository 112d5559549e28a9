//! # Serialized task snapshots for the controller ↔ worker boundary.
//!
//! Nothing crosses the worker channel by reference: the controller sends a
//! [`TaskSnapshot`] (a plain serializable value, deep-copied by
//! construction) and the worker reconstructs a fresh [`Task`] from it.
//! Replies carry a fresh snapshot back.
//!
//! ## Round-trip law
//! `Task → snapshot → Task` preserves `uid`, `task_type`, `name`,
//! `description`, `data`, `metadata`, `priority`, `max_retries`, `timeout`,
//! `run_at`, plus the lifecycle fields (`status`, `retry_count`, `progress`,
//! timestamps, errors). The cancellation token is *not* carried across: the
//! reconstructed task gets its own.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::tasks::{Task, TaskState};

/// Plain value type mirroring a [`Task`], safe to serialize and ship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub uid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    /// Pre-execution delay in milliseconds.
    #[serde(default)]
    pub delay_ms: u64,
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub status: TaskState,
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_history: Vec<String>,
}

impl Task {
    /// Captures the task as a plain value for the channel or for reads.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            uid: self.uid.clone(),
            name: self.name.clone(),
            task_type: self.task_type.clone(),
            description: self.description.clone(),
            priority: self.priority,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            delay_ms: self.delay.as_millis() as u64,
            timeout_ms: self.timeout.as_millis() as u64,
            run_at: self.run_at,
            data: self.data.clone(),
            user_id: self.user_id.clone(),
            metadata: self.metadata.clone(),
            status: self.status,
            progress: self.progress,
            started_at: self.started_at,
            failed_at: self.failed_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
            error_history: self.error_history.clone(),
        }
    }

    /// Reconstructs a task from a snapshot with a fresh cancellation token.
    pub fn from_snapshot(snapshot: TaskSnapshot) -> Self {
        Task {
            uid: snapshot.uid,
            name: snapshot.name,
            task_type: snapshot.task_type,
            description: snapshot.description,
            priority: snapshot.priority,
            delay: Duration::from_millis(snapshot.delay_ms),
            timeout: Duration::from_millis(snapshot.timeout_ms),
            run_at: snapshot.run_at,
            data: snapshot.data,
            user_id: snapshot.user_id,
            metadata: snapshot.metadata,
            max_retries: snapshot.max_retries,
            status: snapshot.status,
            retry_count: snapshot.retry_count,
            progress: snapshot.progress,
            started_at: snapshot.started_at,
            failed_at: snapshot.failed_at,
            completed_at: snapshot.completed_at,
            error: snapshot.error,
            error_history: snapshot.error_history,
            cancel: CancellationToken::new(),
        }
    }
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        task.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_identity_fields() {
        let task = Task::new("report", "pdf")
            .with_uid("fixed-uid")
            .with_description("weekly report")
            .with_priority(7)
            .with_data(serde_json::json!({"pages": 3}))
            .with_user_id("u-9")
            .with_metadata("origin", "cron")
            .with_timeout(Duration::from_millis(1_500))
            .with_max_retries(4)
            .with_run_at(Utc::now());

        let json = serde_json::to_string(&task.snapshot()).unwrap();
        let back = Task::from_snapshot(serde_json::from_str(&json).unwrap());

        assert_eq!(back.uid, "fixed-uid");
        assert_eq!(back.task_type, "pdf");
        assert_eq!(back.name, "report");
        assert_eq!(back.description.as_deref(), Some("weekly report"));
        assert_eq!(back.priority, 7);
        assert_eq!(back.data, serde_json::json!({"pages": 3}));
        assert_eq!(back.user_id.as_deref(), Some("u-9"));
        assert_eq!(back.metadata.get("origin").unwrap(), "cron");
        assert_eq!(back.timeout, Duration::from_millis(1_500));
        assert_eq!(back.max_retries, 4);
        assert_eq!(back.run_at, task.run_at);
        assert_eq!(back.status(), TaskState::Pending);
    }

    #[test]
    fn snapshot_does_not_share_cancellation() {
        let mut task = Task::new("t", "x");
        let copy = Task::from_snapshot(task.snapshot());
        task.cancel();
        assert_eq!(copy.status(), TaskState::Pending);
        assert!(!copy.cancel.is_cancelled());
    }

    #[test]
    fn wire_field_names() {
        let task = Task::new("t", "noop").with_uid("u1");
        let json = serde_json::to_value(task.snapshot()).unwrap();
        assert_eq!(json["type"], "noop");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["uid"], "u1");
    }
}
