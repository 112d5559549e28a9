//! # Persistence adapter contract.
//!
//! [`StoreAdapter`] is the single capability the queue needs from a
//! persistent store: CRUD plus keyed upsert over the `tasks` table. Concrete
//! stores (relational via an ORM, document stores, the in-memory reference
//! implementation) implement it; no store-specific code leaks into the core.
//!
//! ## Contract
//! - All operations are keyed by `uid` (the primary key).
//! - Adapters must be safe for concurrent calls; per-key serialization is
//!   the adapter's responsibility.
//! - Backend conditions are translated into [`AdapterError`] variants; the
//!   core treats any adapter-reported unique conflict uniformly (no driver
//!   codes).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AdapterError;
use crate::tasks::TaskState;

/// Name of the backing table adapters are expected to expose.
pub const TASKS_TABLE: &str = "tasks";

/// One persisted task row.
///
/// The wire/column names follow the expected schema: `completed_at` maps to
/// the `finished_at` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRow {
    /// Primary key.
    pub uid: String,
    /// Executor type.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Human-readable name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Lifecycle status (`pending`, `running`, `completed`, `failed`,
    /// `cancelled`).
    pub status: String,
    /// Task payload, with the execution result merged under `result`.
    #[serde(default)]
    pub data: Value,
    /// Serialized error message, if the task failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Optional owner id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// When the last attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    #[serde(
        rename = "finished_at",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    /// Parses the persisted status back into a [`TaskState`], when valid.
    pub fn state(&self) -> Option<TaskState> {
        serde_json::from_value(Value::String(self.status.clone())).ok()
    }
}

/// Row query filter; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    /// Match a single primary key.
    pub uid: Option<String>,
    /// Match a status string.
    pub status: Option<String>,
    /// Match any of these executor types.
    pub task_types: Option<Vec<String>>,
    /// Match an owner id.
    pub user_id: Option<String>,
    /// Cap the number of returned rows.
    pub limit: Option<usize>,
}

impl RowFilter {
    /// An empty filter (matches every row).
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters by primary key.
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    /// Filters by status string.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Filters by executor types.
    pub fn with_task_types(mut self, types: Vec<String>) -> Self {
        self.task_types = Some(types);
        self
    }

    /// Filters by owner id.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Caps the result count.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True when `row` satisfies every set field.
    pub fn matches(&self, row: &TaskRow) -> bool {
        if let Some(uid) = &self.uid {
            if row.uid != *uid {
                return false;
            }
        }
        if let Some(status) = &self.status {
            if row.status != *status {
                return false;
            }
        }
        if let Some(types) = &self.task_types {
            if !types.iter().any(|t| *t == row.task_type) {
                return false;
            }
        }
        if let Some(user_id) = &self.user_id {
            if row.user_id.as_deref() != Some(user_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Abstract CRUD + upsert over the `tasks` table.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Returns the first row matching the filter.
    async fn find_first(&self, filter: &RowFilter) -> Result<Option<TaskRow>, AdapterError>;

    /// Returns every row matching the filter (respecting `limit`).
    async fn find_many(&self, filter: &RowFilter) -> Result<Vec<TaskRow>, AdapterError>;

    /// Inserts a new row; reports [`AdapterError::UniqueViolation`] when the
    /// uid exists.
    async fn create(&self, row: TaskRow) -> Result<TaskRow, AdapterError>;

    /// Replaces the row with primary key `uid`.
    async fn update(&self, uid: &str, row: TaskRow) -> Result<TaskRow, AdapterError>;

    /// Deletes by primary key; returns whether a row existed.
    async fn delete(&self, uid: &str) -> Result<bool, AdapterError>;

    /// Updates the row keyed by `uid`, or creates it when absent.
    async fn upsert(
        &self,
        uid: &str,
        update: TaskRow,
        create: TaskRow,
    ) -> Result<TaskRow, AdapterError>;
}
