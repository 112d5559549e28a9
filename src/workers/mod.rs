//! # Workers: runtime, handle, manager, and the typed channel between them.
//!
//! - [`WorkerRuntime`] — worker-side message loop with the concurrency gate
//! - [`Worker`] — parent-side handle: send, info cache, close/kill
//! - [`WorkerManager`] — the worker set: spawn policy, least-loaded
//!   selection, crash supervision with backoff restart
//! - [`message`] — the typed request/reply shapes
//!
//! Isolation rule: the controller and a runtime share nothing but the
//! channel; task payloads cross as [`TaskSnapshot`](crate::TaskSnapshot)
//! deep copies and are reconstructed on the far side.

mod handle;
mod manager;
mod message;
mod runtime;

pub use handle::Worker;
pub use manager::WorkerManager;
pub use message::{TaskReport, WorkerEnv, WorkerExit, WorkerInfo, WorkerReply, WorkerRequest};
pub use runtime::WorkerRuntime;
