//! # TaskStore: optional persistence over a pluggable adapter.
//!
//! The store is inert until an adapter is attached — dispatch and execution
//! work unchanged, nothing persists, and no sync recovery runs.
//!
//! ## Responsibilities
//! - [`TaskStore::save_task`] turns a worker's status report into an upsert
//!   keyed by `uid` (the `processed` flag is stripped from the result before
//!   persistence).
//! - [`TaskStore::sync_with_db`] pulls `pending` rows for registered types
//!   back into memory after a restart (at-least-once recovery).
//!
//! ## Rules
//! - Adapter failures are non-fatal: logged, never cancel tasks.
//! - A missing `tasks` table is reported once per store, then skipped.
//! - An upsert that reports a unique conflict is retried as a plain update;
//!   any adapter-tagged conflict is treated uniformly.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::error::AdapterError;
use crate::store::adapter::{RowFilter, StoreAdapter, TaskRow};
use crate::tasks::{Task, TaskState};
use crate::workers::TaskReport;

/// Optional persistence facade over a [`StoreAdapter`].
#[derive(Default)]
pub struct TaskStore {
    adapter: RwLock<Option<Arc<dyn StoreAdapter>>>,
    missing_table_reported: AtomicBool,
}

impl TaskStore {
    /// Creates a store with no adapter attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches (or replaces) the adapter.
    pub fn attach(&self, adapter: Arc<dyn StoreAdapter>) {
        if let Ok(mut slot) = self.adapter.write() {
            *slot = Some(adapter);
        }
        self.missing_table_reported.store(false, Ordering::Relaxed);
    }

    /// The currently attached adapter, if any.
    pub fn adapter(&self) -> Option<Arc<dyn StoreAdapter>> {
        self.adapter.read().ok().and_then(|slot| slot.clone())
    }

    /// True when an adapter is attached.
    pub fn is_attached(&self) -> bool {
        self.adapter().is_some()
    }

    /// Reconstructs tasks from `pending` rows whose type is registered and
    /// whose uid is not already in memory.
    ///
    /// Returns the recovered tasks; the caller adds them to its stack. With
    /// no adapter attached this is a no-op.
    pub async fn sync_with_db(
        &self,
        registered_types: &[String],
        known_uids: &HashSet<String>,
    ) -> Vec<Task> {
        let Some(adapter) = self.adapter() else {
            return Vec::new();
        };
        if registered_types.is_empty() {
            return Vec::new();
        }
        let filter = RowFilter::new()
            .with_status(TaskState::Pending.as_str())
            .with_task_types(registered_types.to_vec());

        let rows = match adapter.find_many(&filter).await {
            Ok(rows) => rows,
            Err(err) => {
                self.report(&err, "sync_with_db");
                return Vec::new();
            }
        };

        let recovered: Vec<Task> = rows
            .into_iter()
            .filter(|row| !known_uids.contains(&row.uid))
            .map(task_from_row)
            .collect();
        if !recovered.is_empty() {
            debug!(count = recovered.len(), "recovered pending tasks from store");
        }
        recovered
    }

    /// Persists a worker status report as an upsert keyed by `uid`.
    ///
    /// Returns the persisted state on success so the caller can evict
    /// completed tasks from memory. `None` means nothing was persisted
    /// (no adapter, or a non-fatal adapter failure).
    pub async fn save_task(&self, report: &TaskReport) -> Option<TaskState> {
        let adapter = self.adapter()?;
        let row = row_from_report(report);
        let state = report.task.status;

        match upsert_with_fallback(adapter.as_ref(), row).await {
            Ok(_) => Some(state),
            Err(err) => {
                self.report(&err, "save_task");
                None
            }
        }
    }

    /// Logs an adapter failure; missing-table conditions only once.
    fn report(&self, err: &AdapterError, op: &str) {
        if matches!(err, AdapterError::MissingTable { .. }) {
            if !self.missing_table_reported.swap(true, Ordering::Relaxed) {
                warn!(%err, %op, "store table missing; persistence disabled until it appears");
            }
            return;
        }
        warn!(%err, %op, "store adapter failure (non-fatal)");
    }
}

/// Upsert keyed by uid; a unique-conflict report retries as an update.
async fn upsert_with_fallback(
    adapter: &dyn StoreAdapter,
    row: TaskRow,
) -> Result<TaskRow, AdapterError> {
    let uid = row.uid.clone();
    match adapter.upsert(&uid, row.clone(), row.clone()).await {
        Ok(persisted) => Ok(persisted),
        Err(err) if err.is_unique_violation() => adapter.update(&uid, row).await,
        Err(err) => Err(err),
    }
}

/// Builds the insert payload from a worker status report.
///
/// The execution result loses its `processed` flag and is merged into the
/// row's `data` under `"result"`; everything else is copied from the task
/// snapshot.
fn row_from_report(report: &TaskReport) -> TaskRow {
    let task = &report.task;
    let mut data = task.data.clone();
    if let Some(result) = &report.result {
        if !result.data.is_empty() {
            match &mut data {
                serde_json::Value::Object(map) => {
                    map.insert("result".to_string(), result.payload());
                }
                other => {
                    let mut map = serde_json::Map::new();
                    if !other.is_null() {
                        map.insert("data".to_string(), other.clone());
                    }
                    map.insert("result".to_string(), result.payload());
                    *other = serde_json::Value::Object(map);
                }
            }
        }
    }

    TaskRow {
        uid: task.uid.clone(),
        task_type: task.task_type.clone(),
        name: task.name.clone(),
        description: task.description.clone(),
        status: task.status.as_str().to_string(),
        data,
        error: report.error.clone(),
        user_id: task.user_id.clone(),
        started_at: task.started_at,
        completed_at: task.completed_at,
    }
}

/// Reconstructs a pending task from a persisted row.
fn task_from_row(row: TaskRow) -> Task {
    let mut task = Task::new(row.name, row.task_type)
        .with_uid(row.uid)
        .with_data(row.data);
    task.description = row.description;
    task.user_id = row.user_id;
    task
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::store::MemoryAdapter;
    use crate::tasks::TaskResult;

    fn report(task: &Task, result: Option<TaskResult>, error: Option<&str>) -> TaskReport {
        TaskReport {
            task: task.snapshot(),
            error: error.map(String::from),
            result,
            worker_id: "w-1".into(),
            process_id: 42,
        }
    }

    #[tokio::test]
    async fn inert_without_adapter() {
        let store = TaskStore::new();
        let task = Task::new("t", "noop");
        assert!(store.save_task(&report(&task, None, None)).await.is_none());
        assert!(store
            .sync_with_db(&["noop".into()], &HashSet::new())
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn save_task_strips_processed_and_upserts() {
        let adapter = Arc::new(MemoryAdapter::new());
        let store = TaskStore::new();
        store.attach(adapter.clone());

        let mut task = Task::new("t", "noop")
            .with_uid("u1")
            .with_data(serde_json::json!({"in": 1}));
        task.status = TaskState::Completed;

        let result = TaskResult::processed().with_field("ok", 1);
        let state = store
            .save_task(&report(&task, Some(result), None))
            .await
            .unwrap();
        assert_eq!(state, TaskState::Completed);

        let row = adapter
            .find_first(&RowFilter::new().with_uid("u1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.data["in"], 1);
        assert_eq!(row.data["result"]["ok"], 1);
        assert!(row.data["result"].get("processed").is_none());
    }

    #[tokio::test]
    async fn save_task_twice_leaves_single_row() {
        let adapter = Arc::new(MemoryAdapter::new());
        let store = TaskStore::new();
        store.attach(adapter.clone());

        let mut task = Task::new("t", "noop").with_uid("u1");
        task.status = TaskState::Running;
        store.save_task(&report(&task, None, None)).await.unwrap();

        task.status = TaskState::Failed;
        store
            .save_task(&report(&task, None, Some("boom")))
            .await
            .unwrap();

        let rows = adapter.find_many(&RowFilter::new()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "failed");
        assert_eq!(rows[0].error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn sync_recovers_unknown_pending_rows_of_registered_types() {
        let adapter = Arc::new(MemoryAdapter::new());
        let store = TaskStore::new();
        store.attach(adapter.clone());

        for (uid, task_type, status) in [
            ("u1", "noop", "pending"),
            ("u2", "noop", "completed"),
            ("u3", "unknown", "pending"),
            ("u4", "noop", "pending"),
        ] {
            adapter
                .seed(TaskRow {
                    uid: uid.into(),
                    task_type: task_type.into(),
                    name: format!("task-{uid}"),
                    description: None,
                    status: status.into(),
                    data: serde_json::json!({"seed": uid}),
                    error: None,
                    user_id: None,
                    started_at: None,
                    completed_at: None,
                })
                .await;
        }

        let known: HashSet<String> = ["u4".to_string()].into();
        let recovered = store.sync_with_db(&["noop".into()], &known).await;
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].uid, "u1");
        assert_eq!(recovered[0].status(), TaskState::Pending);
        assert_eq!(recovered[0].data["seed"], "u1");
    }

    /// Adapter whose upsert always reports a conflict, to exercise the
    /// update fallback.
    struct ConflictingUpsert {
        inner: MemoryAdapter,
        conflicts: AtomicU32,
    }

    #[async_trait]
    impl StoreAdapter for ConflictingUpsert {
        async fn find_first(&self, f: &RowFilter) -> Result<Option<TaskRow>, AdapterError> {
            self.inner.find_first(f).await
        }
        async fn find_many(&self, f: &RowFilter) -> Result<Vec<TaskRow>, AdapterError> {
            self.inner.find_many(f).await
        }
        async fn create(&self, row: TaskRow) -> Result<TaskRow, AdapterError> {
            self.inner.create(row).await
        }
        async fn update(&self, uid: &str, row: TaskRow) -> Result<TaskRow, AdapterError> {
            self.inner.update(uid, row).await
        }
        async fn delete(&self, uid: &str) -> Result<bool, AdapterError> {
            self.inner.delete(uid).await
        }
        async fn upsert(
            &self,
            uid: &str,
            _update: TaskRow,
            _create: TaskRow,
        ) -> Result<TaskRow, AdapterError> {
            self.conflicts.fetch_add(1, Ordering::Relaxed);
            Err(AdapterError::UniqueViolation { uid: uid.into() })
        }
    }

    #[tokio::test]
    async fn unique_conflict_falls_back_to_update() {
        let adapter = Arc::new(ConflictingUpsert {
            inner: MemoryAdapter::new(),
            conflicts: AtomicU32::new(0),
        });
        adapter
            .inner
            .seed(TaskRow {
                uid: "u1".into(),
                task_type: "noop".into(),
                name: "n".into(),
                description: None,
                status: "running".into(),
                data: serde_json::Value::Null,
                error: None,
                user_id: None,
                started_at: None,
                completed_at: None,
            })
            .await;

        let store = TaskStore::new();
        store.attach(adapter.clone());

        let mut task = Task::new("n", "noop").with_uid("u1");
        task.status = TaskState::Completed;
        let state = store.save_task(&report(&task, None, None)).await.unwrap();
        assert_eq!(state, TaskState::Completed);
        assert_eq!(adapter.conflicts.load(Ordering::Relaxed), 1);

        let row = adapter
            .inner
            .find_first(&RowFilter::new().with_uid("u1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "completed");
    }
}
