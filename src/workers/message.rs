//! # Typed messages crossing the controller ↔ worker channel.
//!
//! The channel is typed end to end, mirroring the events of the original
//! wire protocol:
//!
//! | Direction | Message | Effect |
//! |---|---|---|
//! | parent → worker | [`WorkerRequest::GetWorkerInfo`] | worker replies [`WorkerReply::Info`] |
//! | parent → worker | [`WorkerRequest::SetDatabase`] | worker stores the adapter for hooks |
//! | parent → worker | [`WorkerRequest::TaskSingle`] | run one task |
//! | parent → worker | [`WorkerRequest::TaskBatch`] | run many tasks concurrently |
//! | worker → parent | [`WorkerReply::Info`] | refreshes the handle's info cache |
//! | worker → parent | [`WorkerReply::TaskInfo`] | task outcome: persist + hooks |
//!
//! ## Rules
//! - Task payloads are [`TaskSnapshot`] values — deep copies by
//!   construction; no references cross the boundary.
//! - The store adapter in `SetDatabase` is the one exception: it is a shared
//!   capability (`Arc`), not task state, and crossing it mirrors the
//!   original's database handle hand-off.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config;
use crate::store::StoreAdapter;
use crate::tasks::{TaskResult, TaskSnapshot};

/// Identity and load snapshot of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Stable worker id (assigned by the manager).
    pub worker_id: String,
    /// OS process hosting the runtime.
    pub process_id: u32,
    /// Tasks currently in flight.
    pub task_load: u32,
    /// The runtime's concurrency cap.
    pub max_load: u32,
    /// Seconds since the runtime started.
    pub uptime_seconds: u64,
}

/// Environment bindings handed to a worker runtime at spawn.
///
/// Mirrors the variables the original injects into child processes
/// (`WORKER_ID`, `TASK_DIRECTORY`, `MAX_CONCURRENT_TASKS`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    /// Stable worker id.
    pub worker_id: String,
    /// Directory the executor registry scans.
    pub task_directory: PathBuf,
    /// In-flight task cap for this runtime.
    pub max_task_load: u32,
}

impl WorkerEnv {
    /// Reads the bindings from the process environment.
    ///
    /// Used when a runtime is hosted standalone rather than spawned by a
    /// [`WorkerManager`](crate::WorkerManager). Missing `WORKER_ID` or
    /// `TASK_DIRECTORY` yield `None`.
    pub fn from_env() -> Option<Self> {
        Some(Self {
            worker_id: std::env::var("WORKER_ID").ok()?,
            task_directory: PathBuf::from(std::env::var("TASK_DIRECTORY").ok()?),
            max_task_load: config::default_max_concurrent_tasks(),
        })
    }
}

/// Parent → worker messages.
#[derive(Clone)]
pub enum WorkerRequest {
    /// Ask the runtime to report a fresh [`WorkerInfo`].
    GetWorkerInfo,
    /// Hand the runtime the store adapter used by executor hooks.
    SetDatabase {
        /// Shared adapter capability.
        adapter: Arc<dyn StoreAdapter>,
    },
    /// Run one task.
    TaskSingle {
        /// Deep-copied task payload.
        task: TaskSnapshot,
    },
    /// Run a batch of tasks concurrently, with independent replies.
    TaskBatch {
        /// Deep-copied task payloads.
        batch: Vec<TaskSnapshot>,
    },
}

impl std::fmt::Debug for WorkerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerRequest::GetWorkerInfo => f.write_str("GetWorkerInfo"),
            WorkerRequest::SetDatabase { .. } => f.write_str("SetDatabase"),
            WorkerRequest::TaskSingle { task } => {
                f.debug_struct("TaskSingle").field("uid", &task.uid).finish()
            }
            WorkerRequest::TaskBatch { batch } => f
                .debug_struct("TaskBatch")
                .field("len", &batch.len())
                .finish(),
        }
    }
}

/// Task outcome reported by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    /// The task as the worker last saw it.
    pub task: TaskSnapshot,
    /// Rendered error message, `None` on a non-throwing attempt.
    pub error: Option<String>,
    /// The executor's result, when one was produced.
    pub result: Option<TaskResult>,
    /// Reporting worker.
    pub worker_id: String,
    /// Reporting process.
    pub process_id: u32,
}

/// Worker → parent messages.
#[derive(Debug, Clone)]
pub enum WorkerReply {
    /// Response to [`WorkerRequest::GetWorkerInfo`].
    Info(WorkerInfo),
    /// Outcome of a dispatched task.
    TaskInfo(TaskReport),
}

/// How a worker runtime's message loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shutdown was requested or the channel closed; not restarted.
    Clean,
    /// The runtime hit an unrecoverable internal condition — e.g. its
    /// worker-side registry failed to initialize at startup (the analogue
    /// of the original child exiting with code 1). Supervised restart
    /// applies.
    Fatal {
        /// Human-readable cause.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::Task;

    #[test]
    fn requests_are_cloneable_for_broadcast() {
        let snapshot = Task::new("t", "noop").snapshot();
        let req = WorkerRequest::TaskSingle { task: snapshot };
        let copy = req.clone();
        assert!(format!("{copy:?}").contains("TaskSingle"));
    }

    #[test]
    fn worker_env_from_env_requires_bindings() {
        // Not set in the test environment.
        std::env::remove_var("WORKER_ID");
        assert!(WorkerEnv::from_env().is_none());
    }
}
