//! # Error types used by the queue runtime, executors, and store adapters.
//!
//! This module defines three error enums:
//!
//! - [`QueueError`] errors raised by the controller runtime itself.
//! - [`ExecError`] errors raised by individual task executions.
//! - [`AdapterError`] errors surfaced by persistence adapters.
//!
//! All types provide `as_label` helpers for logs/metrics.
//! [`ExecError`] additionally exposes `is_timeout()`; note that retry
//! *eligibility* is not a property of the error kind alone — it is decided by
//! matching the rendered message against the executor's retry patterns (see
//! [`Task::execute`](crate::Task::execute)).

use std::time::Duration;

use thiserror::Error;

use crate::tasks::TaskState;

/// # Errors produced by the controller runtime.
///
/// These represent failures in the queueing system itself, never failures of
/// user task code (those are [`ExecError`]).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum QueueError {
    /// `spawn` was refused because the worker set is already at `max_workers`.
    #[error("worker limit reached ({max_workers}); refusing to spawn")]
    WorkerLimit {
        /// The configured upper bound on the worker set.
        max_workers: usize,
    },

    /// A worker runtime could not be brought up because the executor
    /// registry has not been initialized yet.
    #[error("worker runtime unavailable: executor registry not initialized")]
    RuntimeUnavailable,

    /// The worker's channel is closed (its runtime has exited).
    #[error("worker '{worker_id}' is closed")]
    WorkerClosed {
        /// Id of the closed worker.
        worker_id: String,
    },

    /// An info request to a worker did not complete within the deadline.
    #[error("worker '{worker_id}' info request timed out after {timeout:?}")]
    InfoTimeout {
        /// Id of the unresponsive worker.
        worker_id: String,
        /// The configured request deadline.
        timeout: Duration,
    },

    /// The task directory could not be read during executor discovery.
    #[error("task directory '{path}' unreadable: {source}")]
    TaskDirectory {
        /// The directory that failed to scan.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl QueueError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            QueueError::WorkerLimit { .. } => "queue_worker_limit",
            QueueError::RuntimeUnavailable => "queue_runtime_unavailable",
            QueueError::WorkerClosed { .. } => "queue_worker_closed",
            QueueError::InfoTimeout { .. } => "queue_info_timeout",
            QueueError::TaskDirectory { .. } => "queue_task_directory",
        }
    }
}

/// # Errors produced by task execution.
///
/// Carried back to the controller inside `TaskReport.error` as a rendered
/// message; the message text is what retry patterns are matched against, so
/// the `Display` output of each variant is part of the contract.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ExecError {
    /// The executor did not settle within the task's timeout.
    ///
    /// The rendered message (`Task {uid} timed out after {n}ms`) is the
    /// substring retry patterns such as `"timed out"` match against.
    #[error("Task {uid} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// Uid of the task that timed out.
        uid: String,
        /// The configured timeout that elapsed.
        timeout: Duration,
    },

    /// The executor returned an error.
    #[error("{reason}")]
    Failed { reason: String },

    /// No executor is registered for the task's type.
    #[error("no executor registered for task type '{task_type}'")]
    NoExecutor { task_type: String },

    /// `execute` was called on a task that is not pending.
    #[error("task is not pending (status: {status})")]
    NotPending { status: TaskState },

    /// The task was cancelled before or between execution attempts.
    #[error("task cancelled")]
    Canceled,

    /// The worker refused the task because its load gate is full.
    #[error("worker at capacity ({limit} in-flight tasks)")]
    AtCapacity { limit: u32 },
}

impl ExecError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            ExecError::Timeout { .. } => "exec_timeout",
            ExecError::Failed { .. } => "exec_failed",
            ExecError::NoExecutor { .. } => "exec_no_executor",
            ExecError::NotPending { .. } => "exec_not_pending",
            ExecError::Canceled => "exec_canceled",
            ExecError::AtCapacity { .. } => "exec_at_capacity",
        }
    }

    /// True when the error came from the timeout race.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::Timeout { .. })
    }
}

/// # Errors surfaced by persistence adapters.
///
/// Adapters translate backend conditions into these variants; the store core
/// never inspects driver-specific codes. Adapter failures are non-fatal to
/// dispatch: they are logged and the affected task keeps its in-memory state.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum AdapterError {
    /// A write conflicted with an existing row on a unique key.
    ///
    /// Upserts that report this are retried as plain updates.
    #[error("unique constraint violation on '{uid}'")]
    UniqueViolation {
        /// The conflicting primary key.
        uid: String,
    },

    /// The backing table does not exist.
    ///
    /// Reported once per store, then silently skipped.
    #[error("table '{table}' does not exist")]
    MissingTable {
        /// Name of the missing table.
        table: String,
    },

    /// Any other backend failure.
    #[error("adapter error: {message}")]
    Backend { message: String },
}

impl AdapterError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            AdapterError::UniqueViolation { .. } => "adapter_unique_violation",
            AdapterError::MissingTable { .. } => "adapter_missing_table",
            AdapterError::Backend { .. } => "adapter_backend",
        }
    }

    /// True when the store should retry the write as an update.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, AdapterError::UniqueViolation { .. })
    }
}
