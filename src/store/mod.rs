//! # Persistence: adapter contract, reference adapter, task store.
//!
//! - [`StoreAdapter`] — the pluggable CRUD + upsert capability
//! - [`TaskRow`] / [`RowFilter`] — the persisted row shape and queries
//! - [`MemoryAdapter`] — map-backed reference implementation
//! - [`TaskStore`] — optional persistence with sync recovery and
//!   upsert-with-fallback semantics
//!
//! The queue never closes an adapter; ownership stays with whoever called
//! [`Queue::set_database`](crate::Queue::set_database).

mod adapter;
mod memory;
mod task_store;

pub use adapter::{RowFilter, StoreAdapter, TaskRow, TASKS_TABLE};
pub use memory::MemoryAdapter;
pub use task_store::TaskStore;
