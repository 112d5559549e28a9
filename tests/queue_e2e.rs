//! End-to-end scenarios: a real queue with real worker runtimes and the
//! in-memory store adapter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use anqueue::{
    ExecError, Executor, ExecutorSet, MemoryAdapter, Queue, QueueOptions, RowFilter, StoreAdapter,
    Task, TaskResult, TaskState, Validator,
};

/// Succeeds immediately with a small payload.
struct Noop {
    task_type: String,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Executor for Noop {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn exec(&self, _task: &Task) -> Result<TaskResult, ExecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TaskResult::processed().with_field("ok", 1))
    }
}

/// Never passes validation.
struct Strict {
    task_type: String,
}

#[async_trait]
impl Executor for Strict {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    fn validation_schema(&self) -> Vec<Validator> {
        vec![Validator::new("always_false", |_t: &Task| false)]
    }

    async fn exec(&self, _task: &Task) -> Result<TaskResult, ExecError> {
        Ok(TaskResult::processed())
    }
}

/// Sleeps past any reasonable task timeout.
struct Slow {
    task_type: String,
}

#[async_trait]
impl Executor for Slow {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    fn retry_schema(&self) -> Vec<String> {
        vec!["timed out".to_string()]
    }

    async fn exec(&self, _task: &Task) -> Result<TaskResult, ExecError> {
        sleep(Duration::from_millis(200)).await;
        Ok(TaskResult::processed())
    }
}

/// Records the order in which tasks start executing.
struct Recorder {
    task_type: String,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Executor for Recorder {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn exec(&self, task: &Task) -> Result<TaskResult, ExecError> {
        self.log.lock().unwrap().push(task.uid.clone());
        Ok(TaskResult::processed())
    }
}

struct Fixture {
    queue: Queue,
    adapter: Arc<MemoryAdapter>,
    noop_calls: Arc<AtomicU32>,
    exec_log: Arc<Mutex<Vec<String>>>,
    _dir: tempfile::TempDir,
}

/// Builds a queue over a temp task directory with the full executor roster.
fn fixture(options: QueueOptions) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    for (task_type, entry_point) in [
        ("noop", "noop"),
        ("strict", "strict"),
        ("slow", "slow"),
        ("record", "record"),
    ] {
        std::fs::write(
            dir.path().join(format!("{task_type}.json")),
            serde_json::json!({ "entry_point": entry_point }).to_string(),
        )
        .unwrap();
    }

    let noop_calls = Arc::new(AtomicU32::new(0));
    let exec_log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let mut executors = ExecutorSet::new();
    {
        let calls = Arc::clone(&noop_calls);
        executors.register("noop", move |t| {
            Arc::new(Noop {
                task_type: t.to_string(),
                calls: Arc::clone(&calls),
            })
        });
    }
    executors.register("strict", |t| {
        Arc::new(Strict {
            task_type: t.to_string(),
        })
    });
    executors.register("slow", |t| {
        Arc::new(Slow {
            task_type: t.to_string(),
        })
    });
    {
        let log = Arc::clone(&exec_log);
        executors.register("record", move |t| {
            Arc::new(Recorder {
                task_type: t.to_string(),
                log: Arc::clone(&log),
            })
        });
    }

    let adapter = Arc::new(MemoryAdapter::new());
    let queue = Queue::new(dir.path(), executors, options);

    Fixture {
        queue,
        adapter,
        noop_calls,
        exec_log,
        _dir: dir,
    }
}

async fn wait_for_row(adapter: &MemoryAdapter, uid: &str, status: &str) -> anqueue::TaskRow {
    for _ in 0..300 {
        if let Ok(Some(row)) = adapter
            .find_first(&RowFilter::new().with_uid(uid).with_status(status))
            .await
        {
            return row;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("row {uid} never reached status {status}");
}

async fn wait_for_caches(queue: &Queue, workers: usize) {
    for _ in 0..300 {
        let warm = queue
            .workers()
            .map(|w| w.cached_info().is_some())
            .into_iter()
            .filter(|ok| *ok)
            .count();
        if warm >= workers {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("worker info caches never warmed");
}

#[tokio::test]
async fn happy_path_completes_and_persists() {
    let f = fixture(QueueOptions::new());
    f.queue.init().await.unwrap();
    f.queue.set_database(f.adapter.clone());

    f.queue
        .add(Task::new("hello", "noop").with_uid("happy-1"))
        .await;

    let report = f.queue.run_tasks(None).await;
    assert_eq!(report.tasks_sent, 1);
    assert_eq!(report.total(), 1);

    // Dispatched tasks leave the stack immediately.
    assert!(f.queue.get_task("happy-1").await.is_none());

    let row = wait_for_row(&f.adapter, "happy-1", "completed").await;
    assert_eq!(row.data["result"]["ok"], 1);
    assert!(row.error.is_none());
    assert_eq!(f.noop_calls.load(Ordering::SeqCst), 1);

    f.queue.shutdown();
}

#[tokio::test]
async fn validation_exhaustion_fails_and_persists() {
    let f = fixture(QueueOptions::new());
    f.queue.init().await.unwrap();
    f.queue.set_database(f.adapter.clone());
    wait_for_caches(&f.queue, 1).await;

    f.queue
        .add(
            Task::new("never valid", "strict")
                .with_uid("strict-1")
                .with_max_retries(2),
        )
        .await;

    // Two cycles burn the retry budget, the third finalizes.
    for expected_retry in [1u32, 2] {
        let report = f.queue.run_tasks(None).await;
        assert_eq!(report.validation_failed, 1);
        assert_eq!(report.total(), 1);
        let task = f.queue.get_task("strict-1").await.unwrap();
        assert_eq!(task.retry_count, expected_retry);
        assert_eq!(task.error_history.len(), expected_retry as usize);
    }

    let report = f.queue.run_tasks(None).await;
    assert_eq!(report.validation_failed, 1);
    assert!(f.queue.get_task("strict-1").await.is_none());

    let row = wait_for_row(&f.adapter, "strict-1", "failed").await;
    assert!(row.error.unwrap().contains("always_false"));

    // Nothing left: the next cycle reports all-zero counters.
    let report = f.queue.run_tasks(None).await;
    assert_eq!(report.total(), 0);

    f.queue.shutdown();
}

#[tokio::test]
async fn timeout_retries_once_then_fails() {
    let f = fixture(QueueOptions::new());
    f.queue.init().await.unwrap();
    f.queue.set_database(f.adapter.clone());

    f.queue
        .add(
            Task::new("too slow", "slow")
                .with_uid("slow-1")
                .with_timeout(Duration::from_millis(50))
                .with_max_retries(1),
        )
        .await;

    let report = f.queue.run_tasks(None).await;
    assert_eq!(report.tasks_sent, 1);

    let row = wait_for_row(&f.adapter, "slow-1", "failed").await;
    let error = row.error.unwrap();
    assert!(error.contains("timed out after 50ms"), "error: {error}");

    f.queue.shutdown();
}

#[tokio::test]
async fn priority_orders_execution() {
    let f = fixture(QueueOptions::new().with_max_concurrent_tasks(5));
    f.queue.init().await.unwrap();
    wait_for_caches(&f.queue, 1).await;

    f.queue
        .add(Task::new("a", "record").with_uid("A").with_priority(0))
        .await;
    f.queue
        .add(Task::new("b", "record").with_uid("B").with_priority(5))
        .await;
    f.queue
        .add(Task::new("c", "record").with_uid("C").with_priority(5))
        .await;

    f.queue.schedule_tasks().await;
    let order: Vec<String> = f
        .queue
        .get_tasks()
        .await
        .into_iter()
        .map(|t| t.uid)
        .collect();
    assert_eq!(order, vec!["B", "C", "A"]);

    let report = f.queue.run_tasks(None).await;
    assert_eq!(report.tasks_sent, 3);

    // Executions start in dispatch order on the single-threaded runtime.
    for _ in 0..300 {
        if f.exec_log.lock().unwrap().len() == 3 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*f.exec_log.lock().unwrap(), vec!["B", "C", "A"]);

    f.queue.shutdown();
}

#[tokio::test]
async fn batch_strategy_covers_all_ready_tasks() {
    let f = fixture(
        QueueOptions::new()
            .with_max_workers(2)
            .with_max_concurrent_tasks(3),
    );
    f.queue.init().await.unwrap();
    f.queue.set_database(f.adapter.clone());

    // Two workers, three slots each: total 6 slots, batch threshold 2.
    f.queue.workers().spawn(None, None).await.unwrap();
    assert_eq!(f.queue.workers().size(), 2);
    wait_for_caches(&f.queue, 2).await;

    for i in 0..4 {
        f.queue
            .add(Task::new(format!("t{i}"), "noop").with_uid(format!("batch-{i}")))
            .await;
    }

    let report = f.queue.run_tasks(None).await;
    assert_eq!(report.tasks_sent, 4);
    assert_eq!(report.total(), 4);
    assert!(f.queue.get_tasks().await.is_empty());

    for i in 0..4 {
        wait_for_row(&f.adapter, &format!("batch-{i}"), "completed").await;
    }
    assert_eq!(f.noop_calls.load(Ordering::SeqCst), 4);

    f.queue.shutdown();
}

#[tokio::test]
async fn counters_account_for_every_input_task() {
    let f = fixture(QueueOptions::new());
    f.queue.init().await.unwrap();
    wait_for_caches(&f.queue, 1).await;

    f.queue.add(Task::new("ok", "noop").with_uid("mix-ok")).await;
    f.queue
        .add(Task::new("ghost", "no-such-type").with_uid("mix-ghost"))
        .await;
    f.queue
        .add(Task::new("invalid", "strict").with_uid("mix-strict"))
        .await;

    let report = f.queue.run_tasks(None).await;
    assert_eq!(report.total(), 3);
    assert_eq!(report.tasks_sent, 1);
    assert_eq!(report.no_executor_found, 1);
    assert_eq!(report.validation_failed, 1);

    // The unknown-type task is gone, the invalid one waits for its retry.
    assert!(f.queue.get_task("mix-ghost").await.is_none());
    assert!(f.queue.get_task("mix-strict").await.is_some());

    f.queue.shutdown();
}

#[tokio::test]
async fn killed_worker_is_replaced_and_keeps_dispatching() {
    let f = fixture(QueueOptions::new());
    f.queue.init().await.unwrap();
    f.queue.set_database(f.adapter.clone());

    let worker = f.queue.workers().map(Arc::clone).pop().unwrap();
    let crashed_id = worker.id().to_string();
    worker.kill();

    // Supervision restarts the same id after the first 1s backoff step.
    for _ in 0..600 {
        if let Some(current) = f.queue.workers().get(&crashed_id) {
            if !Arc::ptr_eq(&current, &worker) {
                break;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    let replacement = f.queue.workers().get(&crashed_id).expect("worker restarted");
    assert!(!Arc::ptr_eq(&replacement, &worker));

    f.queue
        .add(Task::new("after crash", "noop").with_uid("revive-1"))
        .await;
    let report = f.queue.run_tasks(None).await;
    assert_eq!(report.tasks_sent, 1);
    wait_for_row(&f.adapter, "revive-1", "completed").await;

    f.queue.shutdown();
}

#[tokio::test]
async fn crash_loses_in_flight_task_and_reports_it() {
    let f = fixture(QueueOptions::new());
    f.queue.init().await.unwrap();
    f.queue.set_database(f.adapter.clone());

    // Default timeout: left alone, the 200ms executor would complete.
    f.queue
        .add(Task::new("doomed", "slow").with_uid("inflight-1"))
        .await;
    let report = f.queue.run_tasks(None).await;
    assert_eq!(report.tasks_sent, 1);

    // Let the execution start, then kill every worker under it.
    sleep(Duration::from_millis(50)).await;
    for worker in f.queue.workers().map(Arc::clone) {
        worker.kill();
    }

    // The pending reply becomes an error report and is persisted failed.
    let row = wait_for_row(&f.adapter, "inflight-1", "failed").await;
    assert!(row.error.unwrap().contains("in flight"));

    f.queue.shutdown();
}

#[tokio::test]
async fn sync_with_db_recovers_pending_rows() {
    let f = fixture(QueueOptions::new());
    f.queue.init().await.unwrap();
    f.queue.set_database(f.adapter.clone());

    f.adapter
        .seed(anqueue::TaskRow {
            uid: "recovered-1".into(),
            task_type: "noop".into(),
            name: "from the store".into(),
            description: Some("survived a restart".into()),
            status: "pending".into(),
            data: serde_json::json!({"seed": true}),
            error: None,
            user_id: None,
            started_at: None,
            completed_at: None,
        })
        .await;
    f.adapter
        .seed(anqueue::TaskRow {
            uid: "finished-1".into(),
            task_type: "noop".into(),
            name: "already done".into(),
            description: None,
            status: "completed".into(),
            data: serde_json::Value::Null,
            error: None,
            user_id: None,
            started_at: None,
            completed_at: None,
        })
        .await;

    assert_eq!(f.queue.sync_with_db().await, 1);
    let task = f.queue.get_task("recovered-1").await.unwrap();
    assert_eq!(task.status, TaskState::Pending);
    assert_eq!(task.data["seed"], true);

    // Re-syncing does not duplicate.
    assert_eq!(f.queue.sync_with_db().await, 0);

    // The recovered task runs to completion like any other.
    let report = f.queue.run_tasks(None).await;
    assert_eq!(report.tasks_sent, 1);
    wait_for_row(&f.adapter, "recovered-1", "completed").await;

    f.queue.shutdown();
}

#[tokio::test]
async fn automatic_loop_drains_the_stack() {
    let f = fixture(QueueOptions::new());
    f.queue.init().await.unwrap();
    f.queue.set_database(f.adapter.clone());

    for i in 0..3 {
        f.queue
            .add(Task::new(format!("t{i}"), "noop").with_uid(format!("auto-{i}")))
            .await;
    }

    let queue = &f.queue;
    tokio::select! {
        _ = queue.run_automatically(Duration::from_millis(20)) => {}
        _ = async {
            for i in 0..3 {
                wait_for_row(&f.adapter, &format!("auto-{i}"), "completed").await;
            }
            queue.shutdown();
        } => {}
    }

    assert!(f.queue.get_tasks().await.is_empty());
}
