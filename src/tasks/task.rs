//! # Task: one unit of deferred work and its lifecycle engine.
//!
//! A [`Task`] bundles the work description (type, payload, priority) with the
//! retry engine that drives it through the [`TaskState`] machine.
//!
//! ## Execution flow (one call to [`Task::execute`])
//! ```text
//! Pending ─► Running ─► sleep(delay) ─► race(exec, timeout)
//!                                          │
//!                  ┌───────────────────────┼───────────────────────┐
//!                  ▼                       ▼                       ▼
//!            processed=true          processed=false         error / timeout
//!                  │                       │                       │
//!              Completed               Failed (no retry)     record error
//!                                                                  │
//!                                             retry budget left AND pattern match?
//!                                                  │ yes                │ no
//!                                                  ▼                    ▼
//!                                      retry_count += 1           Failed (final)
//!                                      Failed ─► Pending,
//!                                      next attempt
//! ```
//!
//! ## Rules
//! - Attempts are strictly sequential; a retry re-enters the same loop.
//! - `error_history` is append-only across retries; `error` holds only the
//!   most recent message and is cleared when a retry is scheduled.
//! - The built-in retry pattern `"Network timeout"` is always a candidate in
//!   addition to the executor's `retry_schema()`.
//! - Cancellation is flag-only: an executor already in flight is not
//!   interrupted; the flag is observed at the next scheduling boundary
//!   (the pre-attempt check and the delay sleep).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config;
use crate::error::ExecError;
use crate::executors::{Executor, Validation, Validator};
use crate::tasks::state::TaskState;
use crate::tasks::TaskResult;

/// Retry pattern that is always matched, regardless of the executor schema.
pub const BUILTIN_RETRY_PATTERN: &str = "Network timeout";

/// A unit of deferred work with its own lifecycle and retry policy.
///
/// Construction is builder-style:
///
/// ```
/// use anqueue::Task;
///
/// let task = Task::new("resize avatar", "image")
///     .with_priority(5)
///     .with_data(serde_json::json!({"width": 128}));
///
/// assert_eq!(task.task_type, "image");
/// assert!(task.ready_to_run());
/// ```
pub struct Task {
    /// Unique id; generated (UUIDv4) when not supplied.
    pub uid: String,
    /// Human-readable name.
    pub name: String,
    /// Executor key this task is dispatched to.
    pub task_type: String,
    /// Optional free-form description.
    pub description: Option<String>,
    /// Scheduling priority; higher runs earlier.
    pub priority: i32,
    /// Pre-execution sleep applied on every attempt.
    pub delay: Duration,
    /// Per-attempt execution deadline.
    pub timeout: Duration,
    /// Earliest wall-clock start; `None` means immediately ready.
    pub run_at: Option<DateTime<Utc>>,
    /// Opaque JSON payload handed to the executor.
    pub data: Value,
    /// Optional owner id, persisted alongside the task.
    pub user_id: Option<String>,
    /// String-keyed metadata map.
    pub metadata: HashMap<String, String>,
    /// Retry budget; `retry_count` never exceeds it.
    pub max_retries: u32,

    pub(crate) status: TaskState,
    pub(crate) retry_count: u32,
    pub(crate) progress: u8,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) failed_at: Option<DateTime<Utc>>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    pub(crate) error: Option<String>,
    pub(crate) error_history: Vec<String>,
    pub(crate) cancel: CancellationToken,
}

impl Task {
    /// Creates a pending task with defaults taken from the environment-backed
    /// configuration (`MAX_TASK_RETRIES`, `TASK_TIMEOUT_MS`).
    pub fn new(name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            name: name.into(),
            task_type: task_type.into(),
            description: None,
            priority: 0,
            delay: Duration::ZERO,
            timeout: config::default_task_timeout(),
            run_at: None,
            data: Value::Null,
            user_id: None,
            metadata: HashMap::new(),
            max_retries: config::default_max_retries(),
            status: TaskState::Pending,
            retry_count: 0,
            progress: 0,
            started_at: None,
            failed_at: None,
            completed_at: None,
            error: None,
            error_history: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Overrides the generated uid.
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    /// Attaches a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the scheduling priority (higher runs earlier).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Attaches the JSON payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Attaches an owner id.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Inserts a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets the pre-execution delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the earliest wall-clock start.
    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    // ---------------------------
    // Lifecycle reads
    // ---------------------------

    /// Current lifecycle state.
    pub fn status(&self) -> TaskState {
        self.status
    }

    /// Retries consumed so far (`<= max_retries`).
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Progress in `[0, 100]`.
    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Most recent error message, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// All error messages recorded across attempts, oldest first.
    pub fn error_history(&self) -> &[String] {
        &self.error_history
    }

    /// When the current/last attempt started running.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// When the task last failed.
    pub fn failed_at(&self) -> Option<DateTime<Utc>> {
        self.failed_at
    }

    /// When the task reached a terminal state.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// True when `run_at` is unset or has passed.
    pub fn ready_to_run(&self) -> bool {
        self.run_at.is_none_or(|at| at <= Utc::now())
    }

    // ---------------------------
    // Lifecycle operations
    // ---------------------------

    /// Clamps `progress` into `[0, 100]`.
    pub fn update_progress(&mut self, progress: i64) {
        self.progress = progress.clamp(0, 100) as u8;
    }

    /// Cancels a pending or running task.
    ///
    /// Records `completed_at`, cancels the internal token (waking a delay
    /// sleep or any awaiter), and returns `true`. Returns `false` when the
    /// task is already terminal.
    pub fn cancel(&mut self) -> bool {
        if !self.status.can_transition(TaskState::Cancelled) {
            return false;
        }
        self.status = TaskState::Cancelled;
        self.completed_at = Some(Utc::now());
        self.cancel.cancel();
        true
    }

    /// Runs every validator in order; all must return `true`.
    ///
    /// The first failing validator is identified in the returned reason.
    pub fn validate(&self, validators: &[Validator]) -> Validation {
        for (idx, validator) in validators.iter().enumerate() {
            if !validator.check(self) {
                return Validation::failed(format!(
                    "validator '{}' (#{idx}) returned false",
                    validator.name()
                ));
            }
        }
        Validation::passed()
    }

    /// Drives the task through its attempt loop against `executor`.
    ///
    /// ### Contract
    /// - Rejects unless the task is `Pending`.
    /// - Each attempt: `Running`, `started_at = now`, `progress = 0`, sleep
    ///   `delay`, then race `exec` against `timeout` — first settle wins.
    /// - `processed: true` → `Completed`, `progress = 100`, `Ok(result)`.
    /// - `processed: false` → `Failed`, `progress = 0`, `Ok(result)`, no
    ///   retry.
    /// - Error/timeout → recorded; retried while `retry_count < max_retries`
    ///   and the message contains [`BUILTIN_RETRY_PATTERN`] or any
    ///   `retry_schema()` pattern. Otherwise finalized `Failed` and the
    ///   error is returned.
    pub async fn execute(&mut self, executor: &dyn Executor) -> Result<TaskResult, ExecError> {
        if self.status != TaskState::Pending {
            return Err(ExecError::NotPending {
                status: self.status,
            });
        }
        let patterns = retry_candidates(executor.retry_schema());

        loop {
            if self.cancel.is_cancelled() {
                return Err(ExecError::Canceled);
            }
            self.status = TaskState::Running;
            self.started_at = Some(Utc::now());
            self.progress = 0;

            if !self.delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(ExecError::Canceled),
                    _ = time::sleep(self.delay) => {}
                }
            }

            let attempt_err = match time::timeout(self.timeout, executor.exec(&*self)).await {
                Ok(Ok(result)) => {
                    if result.processed {
                        self.status = TaskState::Completed;
                        self.completed_at = Some(Utc::now());
                        self.progress = 100;
                        return Ok(result);
                    }
                    self.status = TaskState::Failed;
                    self.failed_at = Some(Utc::now());
                    self.progress = 0;
                    return Ok(result);
                }
                Ok(Err(err)) => err,
                Err(_elapsed) => ExecError::Timeout {
                    uid: self.uid.clone(),
                    timeout: self.timeout,
                },
            };

            let message = attempt_err.to_string();
            self.error = Some(message.clone());
            self.error_history.push(message);
            self.status = TaskState::Failed;
            self.failed_at = Some(Utc::now());
            self.progress = 0;

            if self.retry_count < self.max_retries
                && matches_any(self.error.as_deref().unwrap_or_default(), &patterns)
            {
                self.retry_count += 1;
                // Failed → Pending retry edge; history survives.
                self.status = TaskState::Pending;
                self.progress = 0;
                self.started_at = None;
                self.completed_at = None;
                self.error = None;
                continue;
            }
            return Err(attempt_err);
        }
    }

    /// Records a pre-dispatch validation failure.
    ///
    /// Returns `true` when the task keeps its place in the queue for the next
    /// cycle (retry budget left), `false` when the budget is exhausted and
    /// the task has been finalized as `Failed`.
    pub(crate) fn note_validation_failure(&mut self, reason: &str) -> bool {
        self.error = Some(reason.to_string());
        self.error_history.push(reason.to_string());
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            true
        } else {
            self.status = TaskState::Failed;
            self.failed_at = Some(Utc::now());
            false
        }
    }

    /// Synthetic task used to probe validator behavior during registry
    /// sanitization. Never dispatched.
    pub(crate) fn synthetic(task_type: &str) -> Self {
        Task::new("synthetic-probe", task_type).with_uid(format!("probe-{task_type}"))
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .field("task_type", &self.task_type)
            .field("status", &self.status)
            .field("priority", &self.priority)
            .field("retry_count", &self.retry_count)
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}

/// Builds the candidate pattern list: the built-in pattern plus the schema.
fn retry_candidates(schema: Vec<String>) -> Vec<String> {
    let mut patterns = Vec::with_capacity(schema.len() + 1);
    patterns.push(BUILTIN_RETRY_PATTERN.to_string());
    patterns.extend(schema);
    patterns
}

/// Substring match of `message` against any candidate pattern.
fn matches_any(message: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| message.contains(p.as_str()))
}
