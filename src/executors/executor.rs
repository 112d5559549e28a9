//! # Executor contract and task validators.
//!
//! An [`Executor`] is user code keyed by task type that performs the actual
//! work. Executors are immutable after registration and shared-read
//! (`Arc<dyn Executor>`) between the controller and every worker runtime —
//! they are stateless by contract.
//!
//! ## Contract
//! - `exec` performs one attempt; the runtime races it against the task's
//!   timeout, so long-running executors need no timekeeping of their own.
//! - `validation_schema` gates dispatch: every validator must return `true`
//!   before the task is handed to a worker.
//! - `retry_schema` lists substring patterns; an attempt error whose message
//!   contains one is eligible for retry.
//! - The hooks (`on_complete`, `on_failure`, `save_result`) default to
//!   no-ops; `save_result` additionally receives the store adapter so an
//!   executor can persist derived artifacts.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{AdapterError, ExecError};
use crate::store::StoreAdapter;
use crate::tasks::{Task, TaskResult};

/// Named predicate over a task, used by validation schemas.
///
/// ```
/// use anqueue::{Task, Validator};
///
/// let has_data = Validator::new("has_data", |t: &Task| !t.data.is_null());
/// assert!(!has_data.check(&Task::new("t", "x")));
/// ```
#[derive(Clone)]
pub struct Validator {
    name: Cow<'static, str>,
    check: Arc<dyn Fn(&Task) -> bool + Send + Sync>,
}

impl Validator {
    /// Creates a named validator from a predicate.
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        check: impl Fn(&Task) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// The validator's name, used in failure reasons and removal warnings.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the predicate.
    pub fn check(&self, task: &Task) -> bool {
        (self.check)(task)
    }
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator").field("name", &self.name).finish()
    }
}

/// Outcome of running a task through a validation schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    /// True when every validator returned `true`.
    pub passed: bool,
    /// Identifies the first failing validator when `passed` is false.
    pub reason: Option<String>,
}

impl Validation {
    /// A passing outcome.
    pub fn passed() -> Self {
        Self {
            passed: true,
            reason: None,
        }
    }

    /// A failing outcome with the given reason.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

/// User-supplied work implementation for one task type.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// The task type this executor was instantiated for.
    fn task_type(&self) -> &str;

    /// Ordered predicates a task must satisfy before dispatch.
    fn validation_schema(&self) -> Vec<Validator> {
        Vec::new()
    }

    /// Substring patterns that make an attempt error retryable.
    fn retry_schema(&self) -> Vec<String> {
        Vec::new()
    }

    /// Performs one attempt of the task's work.
    async fn exec(&self, task: &Task) -> Result<TaskResult, ExecError>;

    /// Invoked on the worker after a non-throwing attempt, before the reply
    /// is sent.
    async fn on_complete(
        &self,
        _task: &Task,
        _result: &TaskResult,
        _db: Option<Arc<dyn StoreAdapter>>,
    ) {
    }

    /// Invoked on the worker after a failed attempt, before the reply is
    /// sent.
    async fn on_failure(
        &self,
        _task: &Task,
        _last_result: Option<&TaskResult>,
        _error: &ExecError,
        _db: Option<Arc<dyn StoreAdapter>>,
    ) {
    }

    /// Invoked on the controller after the task row was persisted, with the
    /// attached adapter. Default is a no-op.
    async fn save_result(
        &self,
        _task: &Task,
        _result: &TaskResult,
        _adapter: Arc<dyn StoreAdapter>,
    ) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validator_reports_name() {
        let v = Validator::new("priority_nonnegative", |t: &Task| t.priority >= 0);
        assert_eq!(v.name(), "priority_nonnegative");
        assert!(v.check(&Task::new("t", "x")));
        assert!(!v.check(&Task::new("t", "x").with_priority(-1)));
    }

    #[test]
    fn validation_outcomes() {
        assert!(Validation::passed().passed);
        let failed = Validation::failed("validator 'x' (#0) returned false");
        assert!(!failed.passed);
        assert!(failed.reason.unwrap().contains("#0"));
    }
}
