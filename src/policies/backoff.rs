//! # Backoff policy for restarting crashed workers.
//!
//! [`BackoffPolicy`] controls how restart delays grow across consecutive
//! crashes of the same worker. It is parameterized by:
//! - [`BackoffPolicy::first`] the delay before the first restart;
//! - [`BackoffPolicy::factor`] the multiplicative growth factor;
//! - [`BackoffPolicy::max`] the delay cap.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use anqueue::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy {
//!     first: Duration::from_millis(100),
//!     max: Duration::from_secs(10),
//!     factor: 2.0,
//!     jitter: JitterPolicy::None,
//! };
//!
//! // Attempt 0 uses `first`, each further attempt multiplies by `factor`.
//! assert_eq!(backoff.delay_for(0), Duration::from_millis(100));
//! assert_eq!(backoff.delay_for(1), Duration::from_millis(200));
//!
//! // Growth is capped at `max` (100ms * 2^10 would be ~102s).
//! assert_eq!(backoff.delay_for(10), Duration::from_secs(10));
//! ```

use std::time::Duration;

use crate::policies::jitter::JitterPolicy;

/// Restart backoff policy.
///
/// The delay before restart attempt `n` (zero-based) is
/// `min(first * factor^n, max)`, optionally jittered.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Delay before the first restart attempt.
    pub first: Duration,
    /// Maximum delay cap.
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0` recommended).
    pub factor: f64,
    /// Jitter applied to the computed delay.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// Returns the worker-restart ladder (see
    /// [`worker_restart`](BackoffPolicy::worker_restart)).
    fn default() -> Self {
        Self::worker_restart()
    }
}

impl BackoffPolicy {
    /// The supervision default: 1s doubling up to 30s, no jitter.
    ///
    /// Produces the deterministic ladder `1s, 2s, 4s, 8s, 16s, 30s, 30s, …`.
    pub fn worker_restart() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: JitterPolicy::None,
        }
    }

    /// Computes the delay before restart attempt `attempt` (zero-based).
    ///
    /// The un-jittered delay is `min(first * factor^attempt, max)`; non-finite
    /// intermediate values clamp to `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mul = self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        let base = if !mul.is_finite() {
            self.max
        } else {
            let scaled = self.first.as_secs_f64() * mul;
            if !scaled.is_finite() || scaled >= self.max.as_secs_f64() {
                self.max
            } else {
                Duration::from_secs_f64(scaled)
            }
        };
        self.jitter.apply(base.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_restart_ladder() {
        let b = BackoffPolicy::worker_restart();
        let delays: Vec<u64> = (0..6).map(|n| b.delay_for(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000]);
    }

    #[test]
    fn cap_holds_for_large_attempts() {
        let b = BackoffPolicy::worker_restart();
        assert_eq!(b.delay_for(1_000), Duration::from_secs(30));
    }

    #[test]
    fn constant_factor_keeps_first() {
        let b = BackoffPolicy {
            first: Duration::from_millis(250),
            max: Duration::from_secs(5),
            factor: 1.0,
            jitter: JitterPolicy::None,
        };
        assert_eq!(b.delay_for(0), Duration::from_millis(250));
        assert_eq!(b.delay_for(7), Duration::from_millis(250));
    }
}
