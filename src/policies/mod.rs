//! Policies for supervising worker restarts:
//!  - [`BackoffPolicy`] for restart delays;
//!  - [`JitterPolicy`] for randomizing them.
//!
//! ## Overview
//! - [`backoff`] — compute the delay before restart attempt `n` with capped
//!   multiplicative growth.
//! - [`jitter`] — optionally randomize delays to avoid synchronized restarts.
//!
//! Task-level retries are *not* governed by these policies: a task retries
//! immediately when its error matches a retry pattern (see
//! [`Task::execute`](crate::Task::execute)). Backoff applies to crashed
//! worker runtimes only.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use anqueue::BackoffPolicy;
//!
//! // The worker-restart ladder: 1s, 2s, 4s, ... capped at 30s.
//! let backoff = BackoffPolicy::worker_restart();
//! assert_eq!(backoff.delay_for(0), Duration::from_secs(1));
//! assert_eq!(backoff.delay_for(3), Duration::from_secs(8));
//! assert_eq!(backoff.delay_for(10), Duration::from_secs(30));
//! ```

mod backoff;
mod jitter;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
