//! # anqueue
//!
//! **Anqueue** is a supervised in-process task queue.
//!
//! A controller accepts tasks, optionally persists them to a pluggable
//! table-oriented store, schedules them by priority and readiness, and
//! dispatches them to a pool of supervised worker runtimes over typed
//! channels. Workers execute pluggable per-type executors discovered from a
//! task directory and report results back; crashed workers are restarted
//! with exponential backoff.
//!
//! ## Features
//!
//! | Area               | Description                                                      | Key types / traits                          |
//! |--------------------|------------------------------------------------------------------|---------------------------------------------|
//! | **Tasks**          | Lifecycle state machine, timeouts, pattern-based retries.        | [`Task`], [`TaskState`], [`TaskResult`]     |
//! | **Executors**      | Discover, validate, and index per-type work implementations.     | [`Executor`], [`ExecutorRegistry`], [`ExecutorSet`] |
//! | **Dispatch**       | Priority ordering, single vs. batch strategies, load counters.   | [`DispatchReport`], [`DispatchStrategy`]    |
//! | **Workers**        | Typed channels, concurrency gates, backoff restart supervision.  | [`Worker`], [`WorkerManager`], [`WorkerRuntime`] |
//! | **Persistence**    | Optional store with upsert-with-fallback and sync recovery.      | [`StoreAdapter`], [`TaskStore`], [`MemoryAdapter`] |
//! | **Policies**       | Restart delays with capped growth and optional jitter.           | [`BackoffPolicy`], [`JitterPolicy`]         |
//! | **Errors**         | Typed errors for the runtime, executions, and adapters.          | [`QueueError`], [`ExecError`], [`AdapterError`] |
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use anqueue::{
//!     ExecError, Executor, ExecutorSet, Queue, QueueOptions, Task, TaskResult,
//! };
//! use async_trait::async_trait;
//!
//! struct Greeter {
//!     task_type: String,
//! }
//!
//! #[async_trait]
//! impl Executor for Greeter {
//!     fn task_type(&self) -> &str {
//!         &self.task_type
//!     }
//!
//!     async fn exec(&self, task: &Task) -> Result<TaskResult, ExecError> {
//!         println!("hello from task {}", task.uid);
//!         Ok(TaskResult::processed().with_field("greeted", true))
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // tasks/greet.json: {"entry_point": "greeter"}
//!     let mut executors = ExecutorSet::new();
//!     executors.register("greeter", |t| Arc::new(Greeter { task_type: t.to_string() }));
//!
//!     let queue = Queue::new("./tasks", executors, QueueOptions::new());
//!     queue.init().await?;
//!
//!     queue.add(Task::new("greet the world", "greet").with_priority(1)).await;
//!     queue.run_automatically(Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//! ```text
//! Application ──► Queue.add ──► task stack (controller-owned)
//!                                     │
//!            run_automatically: sync ─► sort ─► dispatch ─► sleep
//!                                     │
//!                     single / batch strategy (by ready count vs. slots)
//!                                     │
//!        WorkerManager.get_available (least-loaded, spawn on demand)
//!                                     │ typed channel (TaskSnapshot)
//!                               WorkerRuntime
//!                    load gate ─► executor ─► hooks ─► TaskInfo reply
//!                                     │
//!               store.save_task ─► evict completed ─► save_result hook
//! ```

mod config;
mod dispatch;
mod error;
mod executors;
mod policies;
mod queue;
mod store;
mod tasks;
mod util;
mod workers;

// ---- Public re-exports ----

pub use config::{
    default_max_concurrent_tasks, default_max_retries, default_task_timeout, QueueConfig,
    DEFAULT_MAX_CONCURRENT_TASKS, DEFAULT_MAX_RETRIES, DEFAULT_TASK_TIMEOUT,
};
pub use dispatch::{DispatchReport, DispatchStrategy};
pub use error::{AdapterError, ExecError, QueueError};
pub use executors::{
    Executor, ExecutorFactory, ExecutorManifest, ExecutorRegistry, ExecutorSet, RegistryRole,
    Validation, Validator,
};
pub use policies::{BackoffPolicy, JitterPolicy};
pub use queue::{Queue, QueueOptions};
pub use store::{MemoryAdapter, RowFilter, StoreAdapter, TaskRow, TaskStore, TASKS_TABLE};
pub use tasks::{Task, TaskResult, TaskSnapshot, TaskState, BUILTIN_RETRY_PATTERN};
pub use util::{read_recorded_digest, record_digest, task_dir_digest, TYPES_HASH_FILE};
pub use workers::{
    TaskReport, Worker, WorkerEnv, WorkerExit, WorkerInfo, WorkerManager, WorkerReply,
    WorkerRequest, WorkerRuntime,
};
