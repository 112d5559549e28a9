//! # Task states and the legal-transition table.
//!
//! [`TaskState`] is the tagged lifecycle state of a [`Task`](crate::Task).
//! The legal transitions are data ([`TaskState::can_transition`]) so that the
//! controller and the worker runtime consult the same table instead of
//! scattering `if` chains.
//!
//! ```text
//! Pending ──► Running ──► Completed
//!    │  ▲        │
//!    │  │        ├──────► Failed ──► Pending   (retry edge)
//!    │  └────────┼──────────┘
//!    ▼           ▼
//! Cancelled ◄────┘
//! ```
//!
//! ## Rules
//! - `Completed` and `Cancelled` are terminal.
//! - `Failed` is terminal within an attempt; the only way out is the retry
//!   edge back to `Pending`.
//! - Pre-dispatch validation may finalize a task `Pending → Failed` once its
//!   retry budget is exhausted (the task never reached a worker).

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting in the controller's stack (initial state).
    Pending,
    /// Dispatched and executing on a worker.
    Running,
    /// Executor reported `processed: true` (terminal).
    Completed,
    /// Executor failed, timed out, reported `processed: false`, or validation
    /// exhausted the retry budget. Terminal except for the retry edge.
    Failed,
    /// Explicitly cancelled (terminal).
    Cancelled,
}

impl TaskState {
    /// Returns `true` if moving from `self` to `next` is a legal transition.
    pub fn can_transition(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Pending)
        )
    }

    /// True for `Completed`, `Failed`, and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Stable lowercase name; also the persisted `status` column value.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::TaskState::*;

    #[test]
    fn legal_edges() {
        assert!(Pending.can_transition(Running));
        assert!(Pending.can_transition(Cancelled));
        assert!(Pending.can_transition(Failed));
        assert!(Running.can_transition(Completed));
        assert!(Running.can_transition(Failed));
        assert!(Running.can_transition(Cancelled));
        assert!(Failed.can_transition(Pending));
    }

    #[test]
    fn terminal_states_are_sticky() {
        for terminal in [Completed, Cancelled] {
            for next in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition(next));
            }
        }
        // Failed is sticky except for the retry edge.
        assert!(!Failed.can_transition(Running));
        assert!(!Failed.can_transition(Completed));
        assert!(!Failed.can_transition(Cancelled));
    }

    #[test]
    fn serde_uses_lowercase() {
        assert_eq!(serde_json::to_string(&Pending).unwrap(), "\"pending\"");
        assert_eq!(
            serde_json::from_str::<super::TaskState>("\"cancelled\"").unwrap(),
            Cancelled
        );
    }
}
