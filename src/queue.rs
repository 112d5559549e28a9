//! # Queue: the public controller facade.
//!
//! The [`Queue`] owns everything: the in-memory task stack, the executor
//! registry, the optional store, and the worker pool. Application code only
//! ever talks to this type.
//!
//! ## Architecture
//! ```text
//! Application
//!   └─ Queue::add(task) ──► in-memory stack (single writer: the controller)
//!
//! Queue::run_automatically(interval)
//!   loop:
//!     ├─ sync_with_db()      recover pending rows from the store
//!     ├─ schedule_tasks()    stable sort by priority (desc)
//!     ├─ run_tasks()         pick single/batch, dispatch, collect counters
//!     └─ sleep(interval)     cancellable via shutdown()
//!
//! Worker replies flow back through the manager's listeners:
//!   TaskInfo ─► store.save_task ─► evict completed ─► save_result hook
//! ```
//!
//! ## Rules
//! - All stack mutations happen on the controller; workers only see
//!   snapshots.
//! - `init` is idempotent: registry init plus one spawned worker.
//! - Dispatch cycles never fail; per-task conditions come back as
//!   [`DispatchReport`] counters.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::dispatch::{select_strategy, DispatchReport};
use crate::error::QueueError;
use crate::executors::{ExecutorRegistry, ExecutorSet, RegistryRole, Validation, Validator};
use crate::store::{StoreAdapter, TaskStore};
use crate::tasks::{Task, TaskSnapshot, TaskState};
use crate::util;
use crate::workers::{TaskReport, WorkerManager, WorkerRequest};

/// Construction options for [`Queue::new`].
///
/// ```
/// use anqueue::QueueOptions;
///
/// let opts = QueueOptions::new().with_id("jobs").with_max_workers(5);
/// ```
#[derive(Default)]
pub struct QueueOptions {
    /// Queue identity (default `"Anqueue"`).
    pub id: Option<String>,
    /// Store adapter to attach immediately.
    pub db: Option<Arc<dyn StoreAdapter>>,
    /// Worker id prefix (default `"{id}-worker-"`).
    pub worker_prefix: Option<String>,
    /// Worker pool bound (default 3).
    pub max_workers: Option<usize>,
    /// Per-worker in-flight cap (default `MAX_CONCURRENT_TASKS`).
    pub max_concurrent_tasks: Option<u32>,
}

impl QueueOptions {
    /// Empty options; every field falls back to its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the queue identity.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attaches a store adapter at construction.
    pub fn with_db(mut self, db: Arc<dyn StoreAdapter>) -> Self {
        self.db = Some(db);
        self
    }

    /// Overrides the worker id prefix.
    pub fn with_worker_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_prefix = Some(prefix.into());
        self
    }

    /// Overrides the worker pool bound.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }

    /// Overrides the per-worker in-flight cap.
    pub fn with_max_concurrent_tasks(mut self, max_concurrent_tasks: u32) -> Self {
        self.max_concurrent_tasks = Some(max_concurrent_tasks);
        self
    }
}

/// Controller-owned state shared with the manager's service loops.
pub(crate) struct QueueCore {
    pub(crate) cfg: QueueConfig,
    pub(crate) tasks: RwLock<Vec<Task>>,
    pub(crate) store: TaskStore,
    registry: OnceLock<Arc<ExecutorRegistry>>,
}

impl QueueCore {
    pub(crate) fn new(cfg: QueueConfig) -> Self {
        Self {
            cfg,
            tasks: RwLock::new(Vec::new()),
            store: TaskStore::new(),
            registry: OnceLock::new(),
        }
    }

    pub(crate) fn set_registry(&self, registry: Arc<ExecutorRegistry>) {
        let _ = self.registry.set(registry);
    }

    pub(crate) fn registry(&self) -> Option<Arc<ExecutorRegistry>> {
        self.registry.get().cloned()
    }

    pub(crate) async fn add_task(&self, task: Task) {
        self.tasks.write().await.push(task);
    }

    /// Splices a task out of the stack. Logs unless `silent`.
    pub(crate) async fn remove_task(&self, uid: &str, silent: bool) -> bool {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|t| t.uid != uid);
        let removed = tasks.len() != before;
        drop(tasks);
        if removed && !silent {
            info!(%uid, "task removed from queue");
        }
        removed
    }

    pub(crate) async fn task_type_of(&self, uid: &str) -> Option<String> {
        self.tasks
            .read()
            .await
            .iter()
            .find(|t| t.uid == uid)
            .map(|t| t.task_type.clone())
    }

    pub(crate) async fn snapshot_of(&self, uid: &str) -> Option<TaskSnapshot> {
        self.tasks
            .read()
            .await
            .iter()
            .find(|t| t.uid == uid)
            .map(Task::snapshot)
    }

    pub(crate) async fn validate_task(
        &self,
        uid: &str,
        schema: &[Validator],
    ) -> Option<Validation> {
        self.tasks
            .read()
            .await
            .iter()
            .find(|t| t.uid == uid)
            .map(|t| t.validate(schema))
    }

    pub(crate) async fn note_validation_failure(&self, uid: &str, reason: &str) -> Option<bool> {
        self.tasks
            .write()
            .await
            .iter_mut()
            .find(|t| t.uid == uid)
            .map(|t| t.note_validation_failure(reason))
    }

    pub(crate) async fn known_uids(&self) -> HashSet<String> {
        self.tasks
            .read()
            .await
            .iter()
            .map(|t| t.uid.clone())
            .collect()
    }

    /// Uids of pending, ready tasks in current stack order.
    pub(crate) async fn ready_uids(&self) -> Vec<String> {
        self.tasks
            .read()
            .await
            .iter()
            .filter(|t| t.status() == TaskState::Pending && t.ready_to_run())
            .map(|t| t.uid.clone())
            .collect()
    }

    /// Applies a worker's status report: persist, evict, run the
    /// `save_result` hook.
    ///
    /// Terminal reports carry a result, an error, or both — all of them are
    /// persisted; the `save_result` hook only runs when a result is present.
    pub(crate) async fn handle_task_report(&self, report: &TaskReport) {
        let uid = &report.task.uid;
        if let Some(error) = &report.error {
            debug!(%uid, %error, "worker reported task failure");
        }

        let terminal = report.result.is_some() || report.error.is_some();
        if terminal && self.store.is_attached() {
            if let Some(state) = self.store.save_task(report).await {
                if state == TaskState::Completed {
                    self.remove_task(uid, true).await;
                }
            }
            if let (Some(registry), Some(adapter), Some(result)) =
                (self.registry(), self.store.adapter(), report.result.as_ref())
            {
                if let Some(executor) = registry.get(&report.task.task_type) {
                    let task = Task::from_snapshot(report.task.clone());
                    if let Err(err) = executor.save_result(&task, result, adapter).await {
                        warn!(%uid, error = %err, "save_result hook failed");
                    }
                }
            }
        } else if report.task.status == TaskState::Completed {
            // No store attached: completed tasks still leave memory.
            self.remove_task(uid, true).await;
        }
    }
}

/// Supervised in-process task queue.
///
/// ```no_run
/// use std::sync::Arc;
/// use anqueue::{ExecutorSet, Queue, QueueOptions, Task};
/// # use anqueue::{Executor, TaskResult, ExecError};
/// # use async_trait::async_trait;
/// # struct Noop(String);
/// # #[async_trait]
/// # impl Executor for Noop {
/// #     fn task_type(&self) -> &str { &self.0 }
/// #     async fn exec(&self, _t: &Task) -> Result<TaskResult, ExecError> {
/// #         Ok(TaskResult::processed())
/// #     }
/// # }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut executors = ExecutorSet::new();
/// executors.register("noop", |t| Arc::new(Noop(t.to_string())));
///
/// let queue = Queue::new("./tasks", executors, QueueOptions::new());
/// queue.init().await?;
///
/// queue.add(Task::new("hello", "noop").with_priority(1)).await;
/// let report = queue.run_tasks(None).await;
/// println!("sent: {}", report.tasks_sent);
/// # Ok(())
/// # }
/// ```
pub struct Queue {
    core: Arc<QueueCore>,
    manager: Arc<WorkerManager>,
    registry: Arc<ExecutorRegistry>,
    shutdown: CancellationToken,
    initialized: AtomicBool,
}

impl Queue {
    /// Creates a queue over `task_dir` with the given executor factories.
    ///
    /// Nothing runs yet; call [`init`](Queue::init) to bring the registry
    /// and the first worker up.
    pub fn new(
        task_dir: impl AsRef<std::path::Path>,
        executors: ExecutorSet,
        options: QueueOptions,
    ) -> Self {
        let mut cfg = QueueConfig::from_env(task_dir);
        if let Some(id) = options.id {
            cfg = cfg.with_id(id);
        }
        if let Some(prefix) = options.worker_prefix {
            cfg.worker_prefix = prefix;
        }
        if let Some(max_workers) = options.max_workers {
            cfg.max_workers = max_workers;
        }
        if let Some(max_concurrent_tasks) = options.max_concurrent_tasks {
            cfg.max_concurrent_tasks = max_concurrent_tasks;
        }

        let registry = Arc::new(ExecutorRegistry::new(
            &cfg.task_dir,
            executors,
            RegistryRole::Controller,
        ));
        let core = Arc::new(QueueCore::new(cfg));
        if let Some(db) = options.db {
            core.store.attach(db);
        }

        let shutdown = CancellationToken::new();
        let manager = WorkerManager::new(Arc::clone(&core), shutdown.clone());

        Self {
            core,
            manager,
            registry,
            shutdown,
            initialized: AtomicBool::new(false),
        }
    }

    /// The queue's identity.
    pub fn id(&self) -> &str {
        &self.core.cfg.id
    }

    /// The active configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.core.cfg
    }

    /// The worker pool.
    pub fn workers(&self) -> &Arc<WorkerManager> {
        &self.manager
    }

    /// The executor registry.
    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    /// Initializes the registry and spawns the first worker. Idempotent.
    ///
    /// A failed init releases the latch so it can be retried.
    pub async fn init(&self) -> Result<(), QueueError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.init_inner().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.initialized.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    async fn init_inner(&self) -> Result<(), QueueError> {
        self.registry.initialize()?;
        self.core.set_registry(Arc::clone(&self.registry));

        if self.core.cfg.generate_types {
            match util::types_hash_changed(&self.core.cfg.task_dir) {
                Ok(true) => info!("executor manifests changed; type generation required"),
                Ok(false) => debug!("executor manifests unchanged"),
                Err(err) => warn!(error = %err, "could not check the types hash"),
            }
        }

        self.manager.spawn(None, None).await?;
        info!(id = %self.core.cfg.id, executors = self.registry.len(), "queue initialized");
        Ok(())
    }

    /// Attaches (or replaces) the store adapter and propagates it to every
    /// live worker. Adapter ownership stays with the caller.
    pub fn set_database(&self, adapter: Arc<dyn StoreAdapter>) {
        self.core.store.attach(Arc::clone(&adapter));
        self.manager.broadcast(WorkerRequest::SetDatabase { adapter });
    }

    /// Appends a task to the stack.
    pub async fn add(&self, task: Task) -> &Self {
        self.core.add_task(task).await;
        self
    }

    /// Splices a task out of the stack.
    pub async fn remove(&self, uid: &str, silent: bool) -> bool {
        self.core.remove_task(uid, silent).await
    }

    /// Cancels a task (pending or running) and removes it from the stack.
    pub async fn cancel(&self, uid: &str) -> bool {
        let cancelled = {
            let mut tasks = self.core.tasks.write().await;
            match tasks.iter_mut().find(|t| t.uid == uid) {
                Some(task) => {
                    task.cancel();
                    true
                }
                None => false,
            }
        };
        if cancelled {
            self.core.remove_task(uid, true).await;
        }
        cancelled
    }

    /// Snapshot of one task.
    pub async fn get_task(&self, uid: &str) -> Option<TaskSnapshot> {
        self.core.snapshot_of(uid).await
    }

    /// Snapshots of every task in stack order.
    pub async fn get_tasks(&self) -> Vec<TaskSnapshot> {
        self.core.tasks.read().await.iter().map(Task::snapshot).collect()
    }

    /// Snapshots of pending tasks that are ready to run.
    pub async fn get_pending_tasks(&self) -> Vec<TaskSnapshot> {
        self.core
            .tasks
            .read()
            .await
            .iter()
            .filter(|t| t.status() == TaskState::Pending && t.ready_to_run())
            .map(Task::snapshot)
            .collect()
    }

    /// `(uid, state)` for every task in stack order.
    pub async fn get_task_statuses(&self) -> Vec<(String, TaskState)> {
        self.core
            .tasks
            .read()
            .await
            .iter()
            .map(|t| (t.uid.clone(), t.status()))
            .collect()
    }

    /// Drops every task from the stack.
    pub async fn clear(&self) {
        self.core.tasks.write().await.clear();
    }

    /// Stable sort of the stack by priority, descending. Equal priorities
    /// keep insertion order.
    pub async fn schedule_tasks(&self) {
        self.core
            .tasks
            .write()
            .await
            .sort_by_key(|t| std::cmp::Reverse(t.priority));
    }

    /// Runs one dispatch cycle.
    ///
    /// With `uids: None` the cycle covers the ready pending tasks (sorting
    /// first when there is more than one). An explicit uid list is
    /// dispatched in the given order, unsorted.
    pub async fn run_tasks(&self, uids: Option<Vec<String>>) -> DispatchReport {
        let uids = match uids {
            Some(uids) => uids,
            None => {
                if self.core.ready_uids().await.len() > 1 {
                    self.schedule_tasks().await;
                }
                self.core.ready_uids().await
            }
        };
        if uids.is_empty() {
            return DispatchReport::default();
        }
        let strategy = select_strategy(
            uids.len(),
            self.manager.total_slots(),
            self.manager.size(),
        );
        strategy.dispatch(&self.core, &self.manager, uids).await
    }

    /// Recovers pending rows from the store into the stack.
    pub async fn sync_with_db(&self) -> usize {
        let types = self.registry.types();
        let known = self.core.known_uids().await;
        let recovered = self.core.store.sync_with_db(&types, &known).await;
        let count = recovered.len();
        for task in recovered {
            self.core.add_task(task).await;
        }
        count
    }

    /// The periodic loop: sync, dispatch ready tasks, sleep.
    ///
    /// Runs until [`shutdown`](Queue::shutdown) is called.
    pub async fn run_automatically(&self, interval: Duration) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.sync_with_db().await;
            let report = self.run_tasks(None).await;
            if report.total() > 0 {
                debug!(?report, "automatic dispatch cycle");
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!(id = %self.core.cfg.id, "automatic loop stopped");
    }

    /// Cancels the runtime token: workers drain and exit clean, the
    /// automatic loop stops.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
