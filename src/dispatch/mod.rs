//! # Dispatch strategies: moving ready tasks onto workers.
//!
//! One dispatch cycle takes the priority-sorted ready tasks and applies a
//! [`DispatchStrategy`]:
//!
//! - **Single** — per task: pick the least-loaded available worker (spawning
//!   on demand) and send a `TaskSingle` message.
//! - **Batch** — per available worker in ascending load order: take up to
//!   its spare capacity from the head of the list and send one `TaskBatch`
//!   message.
//!
//! Strategy selection: with `total_slots = Σ worker caps`, batch is chosen
//! when the ready count exceeds `total_slots / 3`; an empty pool always
//! starts with single so the spawn-on-demand path can create the first
//! worker.
//!
//! ## Rules
//! - Every input task lands in exactly one [`DispatchReport`] counter.
//! - Tasks without a registered executor are removed (with a warn).
//! - A validation failure burns one retry; an exhausted budget finalizes the
//!   task as failed, persists it, and removes it.
//! - Successfully dispatched tasks leave the stack silently.
//! - The cycle never fails: per-task conditions become counters, not errors.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::executors::ExecutorRegistry;
use crate::queue::QueueCore;
use crate::tasks::TaskSnapshot;
use crate::workers::{TaskReport, WorkerManager, WorkerRequest};

/// Synthetic reporter id for controller-side finalizations.
const CONTROLLER_REPORTER: &str = "controller";

/// Policy that moves tasks to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// One `TaskSingle` message per task.
    Single,
    /// One `TaskBatch` message per worker, filled to spare capacity.
    Batch,
}

/// Counters returned from one dispatch cycle.
///
/// `tasks_sent + no_worker_available + no_executor_found + validation_failed`
/// equals the number of input tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Tasks handed to a worker.
    pub tasks_sent: u32,
    /// Tasks left queued because no worker had spare capacity.
    pub no_worker_available: u32,
    /// Tasks removed because their type has no registered executor.
    pub no_executor_found: u32,
    /// Tasks that failed pre-dispatch validation this cycle.
    pub validation_failed: u32,
}

impl DispatchReport {
    /// Total tasks accounted for in this cycle.
    pub fn total(&self) -> u32 {
        self.tasks_sent + self.no_worker_available + self.no_executor_found + self.validation_failed
    }
}

/// Picks the strategy for a cycle.
pub(crate) fn select_strategy(
    ready: usize,
    total_slots: u32,
    worker_count: usize,
) -> DispatchStrategy {
    if worker_count == 0 {
        return DispatchStrategy::Single;
    }
    if ready > (total_slots / 3) as usize {
        DispatchStrategy::Batch
    } else {
        DispatchStrategy::Single
    }
}

/// Per-task admission outcome (executor lookup + validation).
enum Admission {
    /// Ready to send.
    Send(Box<TaskSnapshot>),
    /// No executor registered; the task was removed.
    NoExecutor,
    /// Validation failed; the task burned a retry or was finalized.
    ValidationFailed,
}

impl DispatchStrategy {
    /// Runs one cycle over `uids` (already priority-ordered).
    pub(crate) async fn dispatch(
        self,
        core: &Arc<QueueCore>,
        manager: &Arc<WorkerManager>,
        uids: Vec<String>,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        let Some(registry) = core.registry() else {
            // Without a registry no worker can exist; everything stays queued.
            report.no_worker_available = uids.len() as u32;
            return report;
        };

        match self {
            DispatchStrategy::Single => {
                dispatch_single(core, manager, &registry, uids, &mut report).await
            }
            DispatchStrategy::Batch => {
                dispatch_batch(core, manager, &registry, uids, &mut report).await
            }
        }
        debug!(?self, ?report, "dispatch cycle finished");
        report
    }
}

async fn dispatch_single(
    core: &Arc<QueueCore>,
    manager: &Arc<WorkerManager>,
    registry: &Arc<ExecutorRegistry>,
    uids: Vec<String>,
    report: &mut DispatchReport,
) {
    for uid in uids {
        let Some(worker) = manager.get_available().await else {
            report.no_worker_available += 1;
            continue;
        };
        match admit(core, registry, &uid).await {
            None => {}
            Some(Admission::NoExecutor) => report.no_executor_found += 1,
            Some(Admission::ValidationFailed) => report.validation_failed += 1,
            Some(Admission::Send(snapshot)) => {
                if worker.send(WorkerRequest::TaskSingle { task: *snapshot }) {
                    core.remove_task(&uid, true).await;
                    report.tasks_sent += 1;
                } else {
                    report.no_worker_available += 1;
                }
            }
        }
    }
}

async fn dispatch_batch(
    core: &Arc<QueueCore>,
    manager: &Arc<WorkerManager>,
    registry: &Arc<ExecutorRegistry>,
    uids: Vec<String>,
    report: &mut DispatchReport,
) {
    let mut remaining: VecDeque<String> = uids.into();

    for (_, capacity, worker) in manager.available_workers() {
        if remaining.is_empty() {
            break;
        }
        // Take the worker's share from the head; invalid members are
        // filtered out, not replaced.
        let take = remaining.len().min(capacity as usize);
        let chunk: Vec<String> = remaining.drain(..take).collect();

        let mut batch: Vec<(String, TaskSnapshot)> = Vec::with_capacity(chunk.len());
        for uid in chunk {
            match admit(core, registry, &uid).await {
                None => {}
                Some(Admission::NoExecutor) => report.no_executor_found += 1,
                Some(Admission::ValidationFailed) => report.validation_failed += 1,
                Some(Admission::Send(snapshot)) => batch.push((uid, *snapshot)),
            }
        }
        if batch.is_empty() {
            continue;
        }

        let payload: Vec<TaskSnapshot> = batch.iter().map(|(_, s)| s.clone()).collect();
        if worker.send(WorkerRequest::TaskBatch { batch: payload }) {
            for (uid, _) in &batch {
                core.remove_task(uid, true).await;
            }
            report.tasks_sent += batch.len() as u32;
        } else {
            report.no_worker_available += batch.len() as u32;
        }
    }

    report.no_worker_available += remaining.len() as u32;
}

/// Executor lookup + validation for one task.
///
/// Returns `None` when the task vanished from the stack mid-cycle.
async fn admit(
    core: &Arc<QueueCore>,
    registry: &Arc<ExecutorRegistry>,
    uid: &str,
) -> Option<Admission> {
    let task_type = core.task_type_of(uid).await?;

    if !registry.contains(&task_type) {
        warn!(%uid, %task_type, "no executor registered for task; removing");
        core.remove_task(uid, false).await;
        return Some(Admission::NoExecutor);
    }

    let schema = registry.validation_schema(&task_type).unwrap_or_default();
    let validation = core.validate_task(uid, &schema).await?;
    if !validation.passed {
        let reason = validation
            .reason
            .unwrap_or_else(|| "validation failed".to_string());
        match core.note_validation_failure(uid, &reason).await? {
            true => {
                debug!(%uid, %reason, "validation failed; retrying next cycle");
            }
            false => {
                // Budget exhausted: persist the failed task, then drop it.
                if let Some(snapshot) = core.snapshot_of(uid).await {
                    let report = TaskReport {
                        task: snapshot,
                        error: Some(reason.clone()),
                        result: None,
                        worker_id: CONTROLLER_REPORTER.to_string(),
                        process_id: std::process::id(),
                    };
                    core.store.save_task(&report).await;
                }
                warn!(%uid, %reason, "validation retries exhausted; task failed");
                core.remove_task(uid, false).await;
            }
        }
        return Some(Admission::ValidationFailed);
    }

    core.snapshot_of(uid).await.map(|s| Admission::Send(Box::new(s)))
}
