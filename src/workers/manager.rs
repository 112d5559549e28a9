//! # WorkerManager: owns the worker set and its supervision.
//!
//! The manager is the only component that creates, indexes, and removes
//! [`Worker`] handles. Spawning wires four service loops per worker:
//!
//! ```text
//! spawn(id?, env?)
//!   ├─► WorkerRuntime task (the worker itself)
//!   ├─► reply listener    (Info → cache, TaskInfo → store/hooks/eviction)
//!   ├─► cache refresher   (GetWorkerInfo every cache_interval)
//!   └─► supervisor        (awaits the runtime's JoinHandle)
//!
//! supervisor on exit:
//!   clean (shutdown / channel drained / close)  → remove handle, stop
//!   crash (panic, kill, fatal)                  → cancel in-flight token
//!       (running executions are lost; pending replies become error
//!       reports), remove handle,
//!       attempt < limit:  sleep min(1s·2^attempt, 30s), respawn same id
//!       attempt ≥ limit:  force-close, report, leave slot free
//! ```
//!
//! ## Rules
//! - `spawn` refuses at `max_workers` and requires an initialized registry.
//! - `get_available` returns the least-loaded worker whose **cached** load
//!   is under its cap; a worker that was never polled is not considered.
//! - Restart attempts carry across respawns of the same id; the counter is
//!   not reset by a successful spawn, only by the slot being vacated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::queue::QueueCore;
use crate::workers::handle::Worker;
use crate::workers::message::{WorkerEnv, WorkerExit, WorkerInfo, WorkerReply, WorkerRequest};
use crate::workers::runtime::WorkerRuntime;

/// Owns the `workerId → Worker` mapping, spawn policy, and supervision.
pub struct WorkerManager {
    core: Arc<QueueCore>,
    workers: DashMap<String, Arc<Worker>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    weak_self: Weak<WorkerManager>,
}

impl WorkerManager {
    /// Creates a manager bound to the controller state and runtime token.
    pub(crate) fn new(core: Arc<QueueCore>, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            core,
            workers: DashMap::new(),
            next_id: AtomicU64::new(0),
            shutdown,
            weak_self: weak_self.clone(),
        })
    }

    /// Looks up a worker by id.
    pub fn get(&self, id: &str) -> Option<Arc<Worker>> {
        self.workers.get(id).map(|w| Arc::clone(w.value()))
    }

    /// Removes a worker from the set without closing it.
    pub fn remove(&self, id: &str) -> Option<Arc<Worker>> {
        self.workers.remove(id).map(|(_, w)| w)
    }

    /// Number of live workers.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Visits every worker.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Worker>)) {
        for entry in self.workers.iter() {
            f(entry.value());
        }
    }

    /// Maps every worker through `f`.
    pub fn map<T>(&self, mut f: impl FnMut(&Arc<Worker>) -> T) -> Vec<T> {
        self.workers.iter().map(|e| f(e.value())).collect()
    }

    /// Sends a message to every worker; returns how many accepted it.
    pub fn broadcast(&self, request: WorkerRequest) -> usize {
        self.workers
            .iter()
            .filter(|e| e.value().send(request.clone()))
            .count()
    }

    /// Closes a worker and removes it from the set.
    pub fn close(&self, id: &str, force: bool) -> bool {
        match self.remove(id) {
            Some(worker) => {
                worker.close(force);
                true
            }
            None => false,
        }
    }

    /// Fresh info from every worker, polled concurrently.
    ///
    /// Workers that miss the deadline are skipped.
    pub async fn infos(&self) -> Vec<WorkerInfo> {
        let workers = self.map(Arc::clone);
        let polls = workers.iter().map(|w| w.get_info());
        futures::future::join_all(polls)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Sum of every live worker's concurrency cap.
    pub fn total_slots(&self) -> u32 {
        self.workers
            .iter()
            .map(|e| e.value().max_concurrent_tasks())
            .sum()
    }

    /// Live workers with spare cached capacity, ascending by load.
    ///
    /// Workers that were never polled are excluded.
    pub(crate) fn available_workers(&self) -> Vec<(u32, u32, Arc<Worker>)> {
        let mut available: Vec<(u32, u32, Arc<Worker>)> = self
            .workers
            .iter()
            .filter_map(|entry| {
                let worker = entry.value();
                let info = worker.cached_info()?;
                let cap = worker.max_concurrent_tasks();
                (info.task_load < cap)
                    .then(|| (info.task_load, cap - info.task_load, Arc::clone(worker)))
            })
            .collect();
        available.sort_by_key(|(load, _, _)| *load);
        available
    }

    /// Spawns a new worker runtime.
    ///
    /// Refuses at `max_workers`; fails with
    /// [`QueueError::RuntimeUnavailable`] when the executor registry has not
    /// been initialized (the runtime cannot be brought up without it).
    pub async fn spawn(
        &self,
        id: Option<String>,
        env: Option<WorkerEnv>,
    ) -> Result<Arc<Worker>, QueueError> {
        self.spawn_inner(id, env, 0).await
    }

    /// Returns the least-loaded worker with spare capacity, spawning when
    /// the pool is empty or everyone is saturated and the bound allows it.
    pub async fn get_available(&self) -> Option<Arc<Worker>> {
        if self.workers.is_empty() {
            return self.spawn_or_warn().await;
        }
        if let Some((_, _, worker)) = self.available_workers().into_iter().next() {
            return Some(worker);
        }
        if self.size() < self.core.cfg.max_workers {
            return self.spawn_or_warn().await;
        }
        None
    }

    async fn spawn_or_warn(&self) -> Option<Arc<Worker>> {
        match self.spawn(None, None).await {
            Ok(worker) => Some(worker),
            Err(err) => {
                warn!(error = %err, "could not spawn worker for dispatch");
                None
            }
        }
    }

    async fn spawn_inner(
        &self,
        id: Option<String>,
        env: Option<WorkerEnv>,
        restart_attempt: u32,
    ) -> Result<Arc<Worker>, QueueError> {
        let max_workers = self.core.cfg.max_workers;
        if self.workers.len() >= max_workers {
            return Err(QueueError::WorkerLimit { max_workers });
        }
        let registry = self.core.registry().ok_or(QueueError::RuntimeUnavailable)?;

        let id = id.unwrap_or_else(|| {
            let seq = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            format!("{}{}", self.core.cfg.worker_prefix, seq)
        });
        let env = env.unwrap_or_else(|| WorkerEnv {
            worker_id: id.clone(),
            task_directory: self.core.cfg.task_dir.clone(),
            max_task_load: self.core.cfg.max_concurrent_tasks,
        });

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let token = self.shutdown.child_token();
        let inflight = CancellationToken::new();

        let runtime = WorkerRuntime::new(env.clone(), registry, reply_tx, inflight.clone());
        let join = tokio::spawn(runtime.run(request_rx, token.clone()));

        let worker = Arc::new(Worker::new(
            id.clone(),
            env.clone(),
            request_tx,
            token,
            join.abort_handle(),
            inflight,
            self.core.cfg.info_timeout,
        ));
        self.workers.insert(id.clone(), Arc::clone(&worker));

        // New and restarted runtimes get the current adapter, then an
        // immediate poll to warm the info cache.
        if let Some(adapter) = self.core.store.adapter() {
            worker.send(WorkerRequest::SetDatabase { adapter });
        }
        worker.send(WorkerRequest::GetWorkerInfo);

        self.spawn_reply_listener(Arc::clone(&worker), reply_rx);
        self.spawn_refresher(Arc::clone(&worker));
        self.spawn_supervisor(Arc::clone(&worker), join, restart_attempt);

        debug!(worker_id = %id, restart_attempt, "worker spawned");
        Ok(worker)
    }

    /// Routes runtime replies: info into the cache, task outcomes into the
    /// controller (persist, hooks, eviction).
    fn spawn_reply_listener(
        &self,
        worker: Arc<Worker>,
        mut replies: mpsc::UnboundedReceiver<WorkerReply>,
    ) {
        let core = Arc::clone(&self.core);
        tokio::spawn(async move {
            while let Some(reply) = replies.recv().await {
                match reply {
                    WorkerReply::Info(info) => worker.record_info(info),
                    WorkerReply::TaskInfo(report) => core.handle_task_report(&report).await,
                }
            }
        });
    }

    /// Polls the runtime every `cache_interval` to keep `cached_info` fresh.
    fn spawn_refresher(&self, worker: Arc<Worker>) {
        let interval = self.core.cfg.cache_interval;
        let token = worker.shutdown_token().clone();
        tokio::spawn(async move {
            let mut tick = time::interval(interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        if worker.get_info().await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Watches the runtime's join handle and applies the restart policy.
    fn spawn_supervisor(
        &self,
        worker: Arc<Worker>,
        join: JoinHandle<WorkerExit>,
        restart_attempt: u32,
    ) {
        let manager = self.weak_self.clone();
        let shutdown = self.shutdown.clone();
        let backoff = self.core.cfg.restart_backoff;
        let max_attempts = self.core.cfg.max_restart_attempts;

        tokio::spawn(async move {
            let exit = join.await;
            let crashed = match &exit {
                Ok(WorkerExit::Clean) => false,
                Ok(WorkerExit::Fatal { reason }) => {
                    warn!(worker_id = %worker.id(), %reason, "worker runtime exited fatally");
                    true
                }
                // A join error is a panic or an abort. Aborts requested via
                // close() count as clean; anything else is a crash.
                Err(_) => !(worker.is_closing() || shutdown.is_cancelled()),
            };

            let Some(manager) = manager.upgrade() else {
                return;
            };
            let id = worker.id().to_string();
            manager
                .workers
                .remove_if(&id, |_, current| Arc::ptr_eq(current, &worker));

            if !crashed {
                debug!(worker_id = %id, "worker exited cleanly");
                return;
            }

            // In-flight executions die with the runtime; their pending
            // replies become error reports.
            worker.cancel_inflight();

            if restart_attempt >= max_attempts {
                error!(
                    worker_id = %id,
                    attempts = restart_attempt,
                    "worker crash limit exceeded; force-closing"
                );
                worker.close(true);
                return;
            }

            let delay = backoff.delay_for(restart_attempt);
            info!(
                worker_id = %id,
                attempt = restart_attempt + 1,
                ?delay,
                "restarting crashed worker"
            );
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = time::sleep(delay) => {}
            }
            let env = worker.env().clone();
            if let Err(err) = manager
                .spawn_inner(Some(id.clone()), Some(env), restart_attempt + 1)
                .await
            {
                warn!(worker_id = %id, error = %err, "worker restart failed");
            }
        });
    }
}
