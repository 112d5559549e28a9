//! # WorkerRuntime: the worker-side message loop.
//!
//! One runtime hosts up to `max_task_load` concurrent task executions,
//! isolated from the controller and from each other.
//!
//! ## Architecture
//! ```text
//! WorkerRequest channel ──► run() select loop
//!                              ├─ GetWorkerInfo  → reply Info{load, uptime}
//!                              ├─ SetDatabase    → store adapter for hooks
//!                              ├─ TaskSingle     → spawn_task()
//!                              └─ TaskBatch      → spawn_task() per member
//!
//! spawn_task()
//!   ├─ load gate: try_acquire (reply at-capacity error when full)
//!   └─ tokio::spawn wrapper (owns the LoadGuard)
//!        └─ select:
//!             ├─ in-flight token cancelled (crash) → abort execution,
//!             │                                      reply lost-task error
//!             └─ tokio::spawn execute_one()   ◄─ panic boundary
//!                  ├─ reconstruct Task from snapshot
//!                  ├─ look up executor (missing → error report)
//!                  ├─ task.execute(executor)
//!                  ├─ on_complete / on_failure hook
//!                  └─ TaskReport
//! ```
//!
//! ## Rules
//! - Startup initializes the worker-side registry; failure returns
//!   [`WorkerExit::Fatal`] (the original's exit-code-1 path) and the
//!   supervisor takes over.
//! - The load guard decrements on **every** exit path: normal return,
//!   executor error, panic, and in-flight cancellation (the guard lives in
//!   the wrapper task, outside the panic boundary).
//! - A cancelled in-flight token aborts every running execution; each
//!   pending reply is delivered as an error report — in-flight tasks are
//!   lost on a crash, never silently completed.
//! - Batch members run concurrently; replies are independent and may
//!   interleave.
//! - The `on_complete`/`on_failure` hook finishes before the reply is sent.
//! - An executor panic fails that task only; the runtime keeps serving.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::ExecError;
use crate::executors::ExecutorRegistry;
use crate::store::StoreAdapter;
use crate::tasks::{Task, TaskSnapshot, TaskState};
use crate::workers::message::{TaskReport, WorkerEnv, WorkerExit, WorkerInfo, WorkerReply, WorkerRequest};

/// Worker-side runtime: concurrency gate, message loop, executor invocation.
pub struct WorkerRuntime {
    shared: Arc<RuntimeShared>,
}

struct RuntimeShared {
    env: WorkerEnv,
    registry: Arc<ExecutorRegistry>,
    db: RwLock<Option<Arc<dyn StoreAdapter>>>,
    load: AtomicU32,
    replies: mpsc::UnboundedSender<WorkerReply>,
    /// Cancelled by the parent handle when the worker crashes; running
    /// executions observe it and surface as lost.
    inflight: CancellationToken,
    started: Instant,
}

impl RuntimeShared {
    fn info(&self) -> WorkerInfo {
        WorkerInfo {
            worker_id: self.env.worker_id.clone(),
            process_id: std::process::id(),
            task_load: self.load.load(Ordering::Acquire),
            max_load: self.env.max_task_load,
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }

    fn reply(&self, reply: WorkerReply) {
        if self.replies.send(reply).is_err() {
            debug!(worker_id = %self.env.worker_id, "controller reply channel closed");
        }
    }

    fn task_report(
        &self,
        task: TaskSnapshot,
        error: Option<String>,
        result: Option<crate::tasks::TaskResult>,
    ) -> TaskReport {
        TaskReport {
            task,
            error,
            result,
            worker_id: self.env.worker_id.clone(),
            process_id: std::process::id(),
        }
    }

    fn report(
        &self,
        task: TaskSnapshot,
        error: Option<String>,
        result: Option<crate::tasks::TaskResult>,
    ) {
        let report = self.task_report(task, error, result);
        self.reply(WorkerReply::TaskInfo(report));
    }
}

/// RAII admission to the runtime's load gate.
///
/// Holding a guard keeps one in-flight slot occupied; dropping it releases
/// the slot on every exit path.
struct LoadGuard {
    shared: Arc<RuntimeShared>,
}

impl LoadGuard {
    /// Claims a slot, or returns `None` when `task_load >= max_task_load`.
    fn try_acquire(shared: Arc<RuntimeShared>) -> Option<Self> {
        let max = shared.env.max_task_load;
        let claimed = shared
            .load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| {
                (load < max).then_some(load + 1)
            })
            .is_ok();
        claimed.then_some(Self { shared })
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.shared.load.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WorkerRuntime {
    /// Creates a runtime bound to its environment, executor registry, reply
    /// channel, and the in-flight token its parent handle cancels on a
    /// crash.
    pub fn new(
        env: WorkerEnv,
        registry: Arc<ExecutorRegistry>,
        replies: mpsc::UnboundedSender<WorkerReply>,
        inflight: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(RuntimeShared {
                env,
                registry,
                db: RwLock::new(None),
                load: AtomicU32::new(0),
                replies,
                inflight,
                started: Instant::now(),
            }),
        }
    }

    /// Current in-flight task count.
    pub fn task_load(&self) -> u32 {
        self.shared.load.load(Ordering::Acquire)
    }

    /// Serves requests until shutdown is requested or the channel closes.
    ///
    /// Startup initializes the worker-side registry; a failure there is the
    /// fatal path (the supervisor takes over).
    pub async fn run(
        self,
        mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
        shutdown: CancellationToken,
    ) -> WorkerExit {
        if let Err(err) = self.shared.registry.initialize() {
            error!(
                worker_id = %self.shared.env.worker_id,
                error = %err,
                "worker runtime startup failed"
            );
            return WorkerExit::Fatal {
                reason: err.to_string(),
            };
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return WorkerExit::Clean,
                request = requests.recv() => match request {
                    None => return WorkerExit::Clean,
                    Some(msg) => self.handle(msg).await,
                },
            }
        }
    }

    async fn handle(&self, request: WorkerRequest) {
        match request {
            WorkerRequest::GetWorkerInfo => {
                let info = self.shared.info();
                self.shared.reply(WorkerReply::Info(info));
            }
            WorkerRequest::SetDatabase { adapter } => {
                *self.shared.db.write().await = Some(adapter);
            }
            WorkerRequest::TaskSingle { task } => self.spawn_task(task),
            WorkerRequest::TaskBatch { batch } => {
                // Concurrent with independent replies; order is not promised.
                for task in batch {
                    self.spawn_task(task);
                }
            }
        }
    }

    /// Admits one task through the load gate and runs it in isolation.
    fn spawn_task(&self, snapshot: TaskSnapshot) {
        let shared = Arc::clone(&self.shared);
        let Some(guard) = LoadGuard::try_acquire(Arc::clone(&shared)) else {
            let limit = shared.env.max_task_load;
            let mut task = Task::from_snapshot(snapshot);
            let err = ExecError::AtCapacity { limit };
            fail_task(&mut task, &err);
            shared.report(task.snapshot(), Some(err.to_string()), None);
            return;
        };

        tokio::spawn(async move {
            let _guard = guard;
            let crashed = shared.inflight.clone();
            let mut inner = tokio::spawn(execute_one(Arc::clone(&shared), snapshot.clone()));
            tokio::select! {
                // The worker is going down hard; the pending reply becomes
                // an error report and the execution is dropped.
                _ = crashed.cancelled() => {
                    inner.abort();
                    let mut task = Task::from_snapshot(snapshot);
                    let err = ExecError::Failed {
                        reason: format!(
                            "worker '{}' crashed with the task in flight",
                            shared.env.worker_id
                        ),
                    };
                    fail_task(&mut task, &err);
                    shared.report(task.snapshot(), Some(err.to_string()), None);
                }
                joined = &mut inner => match joined {
                    Ok(report) => shared.reply(WorkerReply::TaskInfo(report)),
                    Err(join_err) => {
                        // Executor panicked; the runtime survives, the task
                        // fails.
                        warn!(
                            worker_id = %shared.env.worker_id,
                            uid = %snapshot.uid,
                            "task execution panicked"
                        );
                        let mut task = Task::from_snapshot(snapshot);
                        let err = ExecError::Failed {
                            reason: format!("task execution panicked: {join_err}"),
                        };
                        fail_task(&mut task, &err);
                        shared.report(task.snapshot(), Some(err.to_string()), None);
                    }
                }
            }
        });
    }
}

/// Runs one task to its report. Panics escape to the join boundary above.
async fn execute_one(shared: Arc<RuntimeShared>, snapshot: TaskSnapshot) -> TaskReport {
    let mut task = Task::from_snapshot(snapshot);
    let db = shared.db.read().await.clone();

    let Some(executor) = shared.registry.get(&task.task_type) else {
        let err = ExecError::NoExecutor {
            task_type: task.task_type.clone(),
        };
        fail_task(&mut task, &err);
        return shared.task_report(task.snapshot(), Some(err.to_string()), None);
    };

    match task.execute(executor.as_ref()).await {
        Ok(result) => {
            executor.on_complete(&task, &result, db).await;
            shared.task_report(task.snapshot(), None, Some(result))
        }
        Err(err) => {
            if !task.status().is_terminal() {
                fail_task(&mut task, &err);
            }
            executor.on_failure(&task, None, &err, db).await;
            shared.task_report(task.snapshot(), Some(err.to_string()), None)
        }
    }
}

/// Marks a task failed outside the normal execute path.
fn fail_task(task: &mut Task, err: &ExecError) {
    task.status = TaskState::Failed;
    task.failed_at = Some(chrono::Utc::now());
    task.error = Some(err.to_string());
    task.error_history.push(err.to_string());
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::executors::{Executor, ExecutorSet, RegistryRole};
    use crate::tasks::TaskResult;

    struct Noop {
        task_type: String,
    }

    #[async_trait]
    impl Executor for Noop {
        fn task_type(&self) -> &str {
            &self.task_type
        }

        async fn exec(&self, _task: &Task) -> Result<TaskResult, ExecError> {
            Ok(TaskResult::processed().with_field("ok", 1))
        }
    }

    struct Panicker {
        task_type: String,
    }

    #[async_trait]
    impl Executor for Panicker {
        fn task_type(&self) -> &str {
            &self.task_type
        }

        async fn exec(&self, _task: &Task) -> Result<TaskResult, ExecError> {
            panic!("executor exploded");
        }
    }

    struct Slow {
        task_type: String,
    }

    #[async_trait]
    impl Executor for Slow {
        fn task_type(&self) -> &str {
            &self.task_type
        }

        async fn exec(&self, _task: &Task) -> Result<TaskResult, ExecError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(TaskResult::processed())
        }
    }

    fn registry(dir: &std::path::Path) -> Arc<ExecutorRegistry> {
        for (ty, entry) in [("noop", "noop"), ("boom", "boom"), ("slow", "slow")] {
            std::fs::write(
                dir.join(format!("{ty}.json")),
                serde_json::json!({"entry_point": entry}).to_string(),
            )
            .unwrap();
        }
        let mut set = ExecutorSet::new();
        set.register("noop", |t| {
            Arc::new(Noop {
                task_type: t.to_string(),
            })
        });
        set.register("boom", |t| {
            Arc::new(Panicker {
                task_type: t.to_string(),
            })
        });
        set.register("slow", |t| {
            Arc::new(Slow {
                task_type: t.to_string(),
            })
        });
        let registry = Arc::new(ExecutorRegistry::new(dir, set, RegistryRole::Worker));
        registry.initialize().unwrap();
        registry
    }

    fn runtime(
        dir: &std::path::Path,
        max_load: u32,
    ) -> (
        WorkerRuntime,
        mpsc::UnboundedReceiver<WorkerReply>,
        CancellationToken,
    ) {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let inflight = CancellationToken::new();
        let env = WorkerEnv {
            worker_id: "w-test".into(),
            task_directory: dir.to_path_buf(),
            max_task_load: max_load,
        };
        (
            WorkerRuntime::new(env, registry(dir), reply_tx, inflight.clone()),
            reply_rx,
            inflight,
        )
    }

    async fn next_report(rx: &mut mpsc::UnboundedReceiver<WorkerReply>) -> TaskReport {
        loop {
            match rx.recv().await.expect("reply channel open") {
                WorkerReply::TaskInfo(report) => return report,
                WorkerReply::Info(_) => continue,
            }
        }
    }

    #[tokio::test]
    async fn single_task_runs_and_replies() {
        let dir = tempfile::tempdir().unwrap();
        let (rt, mut replies, _inflight) = runtime(dir.path(), 2);
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let join = tokio::spawn(rt.run(req_rx, token.clone()));

        let task = Task::new("t", "noop").with_uid("u1");
        req_tx
            .send(WorkerRequest::TaskSingle {
                task: task.snapshot(),
            })
            .unwrap();

        let report = next_report(&mut replies).await;
        assert_eq!(report.task.uid, "u1");
        assert_eq!(report.task.status, TaskState::Completed);
        assert!(report.error.is_none());
        assert_eq!(report.result.unwrap().data["ok"], 1);
        assert_eq!(report.worker_id, "w-test");

        token.cancel();
        assert_eq!(join.await.unwrap(), WorkerExit::Clean);
    }

    #[tokio::test]
    async fn missing_executor_replies_error() {
        let dir = tempfile::tempdir().unwrap();
        let (rt, mut replies, _inflight) = runtime(dir.path(), 2);
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(rt.run(req_rx, CancellationToken::new()));

        req_tx
            .send(WorkerRequest::TaskSingle {
                task: Task::new("t", "ghost").snapshot(),
            })
            .unwrap();

        let report = next_report(&mut replies).await;
        assert_eq!(report.task.status, TaskState::Failed);
        assert!(report.error.unwrap().contains("ghost"));

        drop(req_tx);
        assert_eq!(join.await.unwrap(), WorkerExit::Clean);
    }

    #[tokio::test]
    async fn executor_panic_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let (rt, mut replies, _inflight) = runtime(dir.path(), 2);
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        tokio::spawn(rt.run(req_rx, CancellationToken::new()));

        req_tx
            .send(WorkerRequest::TaskSingle {
                task: Task::new("t", "boom").snapshot(),
            })
            .unwrap();
        let report = next_report(&mut replies).await;
        assert_eq!(report.task.status, TaskState::Failed);
        assert!(report.error.unwrap().contains("panicked"));

        // The runtime keeps serving after the panic.
        req_tx
            .send(WorkerRequest::TaskSingle {
                task: Task::new("t", "noop").snapshot(),
            })
            .unwrap();
        let report = next_report(&mut replies).await;
        assert_eq!(report.task.status, TaskState::Completed);
    }

    #[tokio::test]
    async fn capacity_gate_rejects_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let (rt, mut replies, _inflight) = runtime(dir.path(), 1);
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        tokio::spawn(rt.run(req_rx, CancellationToken::new()));

        // First slow task occupies the single slot; the second is rejected.
        req_tx
            .send(WorkerRequest::TaskSingle {
                task: Task::new("a", "slow").with_uid("slow-1").snapshot(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        req_tx
            .send(WorkerRequest::TaskSingle {
                task: Task::new("b", "slow").with_uid("slow-2").snapshot(),
            })
            .unwrap();

        let first = next_report(&mut replies).await;
        assert_eq!(first.task.uid, "slow-2");
        assert!(first.error.unwrap().contains("capacity"));

        let second = next_report(&mut replies).await;
        assert_eq!(second.task.uid, "slow-1");
        assert_eq!(second.task.status, TaskState::Completed);
    }

    #[tokio::test]
    async fn batch_runs_concurrently_with_independent_replies() {
        let dir = tempfile::tempdir().unwrap();
        let (rt, mut replies, _inflight) = runtime(dir.path(), 4);
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        tokio::spawn(rt.run(req_rx, CancellationToken::new()));

        let batch: Vec<_> = (0..3)
            .map(|i| {
                Task::new(format!("t{i}"), "noop")
                    .with_uid(format!("b-{i}"))
                    .snapshot()
            })
            .collect();
        req_tx.send(WorkerRequest::TaskBatch { batch }).unwrap();

        let mut uids = Vec::new();
        for _ in 0..3 {
            uids.push(next_report(&mut replies).await.task.uid);
        }
        uids.sort();
        assert_eq!(uids, vec!["b-0", "b-1", "b-2"]);
    }

    #[tokio::test]
    async fn inflight_cancel_reports_lost_task() {
        let dir = tempfile::tempdir().unwrap();
        let (rt, mut replies, inflight) = runtime(dir.path(), 2);
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        tokio::spawn(rt.run(req_rx, CancellationToken::new()));

        req_tx
            .send(WorkerRequest::TaskSingle {
                task: Task::new("doomed", "slow").with_uid("lost-1").snapshot(),
            })
            .unwrap();
        // Let the execution start, then crash the worker under it.
        tokio::time::sleep(Duration::from_millis(10)).await;
        inflight.cancel();

        let report = next_report(&mut replies).await;
        assert_eq!(report.task.uid, "lost-1");
        assert_eq!(report.task.status, TaskState::Failed);
        assert!(report.error.unwrap().contains("in flight"));
        assert!(report.result.is_none());

        // The aborted execution never delivers a completion reply.
        assert!(
            tokio::time::timeout(Duration::from_millis(100), replies.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn fatal_exit_when_task_directory_is_missing() {
        let registry = Arc::new(ExecutorRegistry::new(
            "/no/such/task/dir",
            ExecutorSet::new(),
            RegistryRole::Worker,
        ));
        let (reply_tx, _replies) = mpsc::unbounded_channel();
        let env = WorkerEnv {
            worker_id: "w-fatal".into(),
            task_directory: "/no/such/task/dir".into(),
            max_task_load: 1,
        };
        let rt = WorkerRuntime::new(env, registry, reply_tx, CancellationToken::new());

        let (_req_tx, req_rx) = mpsc::unbounded_channel();
        let exit = rt.run(req_rx, CancellationToken::new()).await;
        assert!(matches!(exit, WorkerExit::Fatal { .. }));
    }

    #[tokio::test]
    async fn get_worker_info_reports_load() {
        let dir = tempfile::tempdir().unwrap();
        let (rt, mut replies, _inflight) = runtime(dir.path(), 7);
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        tokio::spawn(rt.run(req_rx, CancellationToken::new()));

        req_tx.send(WorkerRequest::GetWorkerInfo).unwrap();
        match replies.recv().await.unwrap() {
            WorkerReply::Info(info) => {
                assert_eq!(info.worker_id, "w-test");
                assert_eq!(info.task_load, 0);
                assert_eq!(info.max_load, 7);
                assert_eq!(info.process_id, std::process::id());
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
