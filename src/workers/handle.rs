//! # Worker: the parent-side handle around a runtime.
//!
//! The controller never touches a runtime directly — it goes through the
//! handle, which owns the request channel, the cancellation token, an abort
//! handle, and the staleness-tolerant info cache.
//!
//! ## Info cache
//! `cached_info` is a `tokio::sync::watch` cell: the reply listener writes
//! every [`WorkerInfo`](crate::WorkerInfo) reply into it, the scheduler
//! reads it without locking, and `None` means "never polled — do not
//! consider available". Readers tolerate staleness up to the refresh
//! interval.
//!
//! ## Rules
//! - [`Worker::send`] drops the message (with a warn) when the runtime has
//!   exited; it never blocks.
//! - [`Worker::get_info`] is a request/response with a deadline; a reply
//!   arriving through the listener wakes it.
//! - [`Worker::close`] marks the handle closing first, so supervision
//!   classifies the exit as clean.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::QueueError;
use crate::workers::message::{WorkerEnv, WorkerInfo, WorkerRequest};

/// Parent-side handle to one worker runtime.
pub struct Worker {
    id: String,
    env: WorkerEnv,
    requests: mpsc::UnboundedSender<WorkerRequest>,
    shutdown: CancellationToken,
    abort: AbortHandle,
    /// Shared with the runtime; cancelling it drops in-flight executions
    /// and turns their pending replies into error reports.
    inflight: CancellationToken,
    info_tx: watch::Sender<Option<WorkerInfo>>,
    info_rx: watch::Receiver<Option<WorkerInfo>>,
    closing: AtomicBool,
    info_timeout: Duration,
    created: Instant,
}

impl Worker {
    /// Wraps a spawned runtime. Called by the manager.
    pub(crate) fn new(
        id: String,
        env: WorkerEnv,
        requests: mpsc::UnboundedSender<WorkerRequest>,
        shutdown: CancellationToken,
        abort: AbortHandle,
        inflight: CancellationToken,
        info_timeout: Duration,
    ) -> Self {
        let (info_tx, info_rx) = watch::channel(None);
        Self {
            id,
            env,
            requests,
            shutdown,
            abort,
            inflight,
            info_tx,
            info_rx,
            closing: AtomicBool::new(false),
            info_timeout,
            created: Instant::now(),
        }
    }

    /// The worker's stable id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The environment bindings the runtime was spawned with.
    pub fn env(&self) -> &WorkerEnv {
        &self.env
    }

    /// The runtime's concurrency cap.
    pub fn max_concurrent_tasks(&self) -> u32 {
        self.env.max_task_load
    }

    /// Time since the handle was created.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Forwards a message to the runtime.
    ///
    /// Returns `false` (after a warn) when the runtime has exited and the
    /// channel is closed; the message is dropped.
    pub fn send(&self, request: WorkerRequest) -> bool {
        if self.requests.send(request).is_err() {
            warn!(worker_id = %self.id, "dropping message for closed worker");
            return false;
        }
        true
    }

    /// Most recent info snapshot, or `None` if the worker was never polled.
    pub fn cached_info(&self) -> Option<WorkerInfo> {
        self.info_rx.borrow().clone()
    }

    /// Requests fresh info from the runtime, waiting up to the configured
    /// deadline. Updates the cache on success.
    pub async fn get_info(&self) -> Result<WorkerInfo, QueueError> {
        let mut rx = self.info_rx.clone();
        rx.mark_unchanged();
        if !self.send(WorkerRequest::GetWorkerInfo) {
            return Err(QueueError::WorkerClosed {
                worker_id: self.id.clone(),
            });
        }
        match time::timeout(self.info_timeout, rx.changed()).await {
            Err(_) => Err(QueueError::InfoTimeout {
                worker_id: self.id.clone(),
                timeout: self.info_timeout,
            }),
            Ok(Err(_)) => Err(QueueError::WorkerClosed {
                worker_id: self.id.clone(),
            }),
            Ok(Ok(())) => rx.borrow().clone().ok_or(QueueError::WorkerClosed {
                worker_id: self.id.clone(),
            }),
        }
    }

    /// Writes an info reply into the cache. Called by the reply listener.
    pub(crate) fn record_info(&self, info: WorkerInfo) {
        let _ = self.info_tx.send(Some(info));
    }

    /// True once `close` has been called.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Shuts the runtime down.
    ///
    /// Graceful close cancels the shutdown token and lets the loop and any
    /// in-flight executions drain; `force` additionally drops in-flight
    /// executions (their pending replies become error reports) and aborts
    /// the runtime task. Either way supervision treats the exit as clean.
    pub fn close(&self, force: bool) {
        self.closing.store(true, Ordering::Release);
        self.shutdown.cancel();
        if force {
            self.inflight.cancel();
            self.abort.abort();
        }
    }

    /// Aborts the runtime *without* marking the handle closing, so
    /// supervision sees a crash. In-flight executions are lost and reported
    /// as errors. Simulates abrupt termination.
    pub fn kill(&self) {
        self.inflight.cancel();
        self.abort.abort();
    }

    /// Drops in-flight executions; their pending replies become error
    /// reports. Called by supervision on any crash path.
    pub(crate) fn cancel_inflight(&self) {
        self.inflight.cancel();
    }

    /// The shutdown token shared with the runtime and its service loops.
    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("max_load", &self.env.max_task_load)
            .field("closing", &self.is_closing())
            .finish_non_exhaustive()
    }
}
