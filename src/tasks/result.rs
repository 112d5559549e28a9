//! # Executor result shape.
//!
//! [`TaskResult`] is what an executor's `exec` returns: a `processed` verdict
//! plus arbitrary JSON payload fields. The payload is flattened on the wire,
//! so `{"processed": true, "ok": 1}` round-trips exactly.
//!
//! ## Rules
//! - `processed: true` completes the task; `processed: false` fails it
//!   without retry (the executor decided the work is not processable).
//! - The `processed` flag is stripped before persistence — only the payload
//!   fields reach the store (see
//!   [`TaskStore::save_task`](crate::store::TaskStore)).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outcome payload returned by an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Whether the executor considers the task processed.
    pub processed: bool,
    /// Arbitrary result fields, flattened alongside `processed`.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl TaskResult {
    /// A successful result with no payload.
    pub fn processed() -> Self {
        Self {
            processed: true,
            data: Map::new(),
        }
    }

    /// An unprocessed result with no payload (fails the task, no retry).
    pub fn unprocessed() -> Self {
        Self {
            processed: false,
            data: Map::new(),
        }
    }

    /// Attaches a payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// The payload as a JSON object, without the `processed` flag.
    pub fn payload(&self) -> Value {
        Value::Object(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattened_round_trip() {
        let r = TaskResult::processed().with_field("ok", 1);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json, serde_json::json!({"processed": true, "ok": 1}));

        let back: TaskResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn payload_strips_processed() {
        let r = TaskResult::unprocessed().with_field("reason", "skip");
        assert_eq!(r.payload(), serde_json::json!({"reason": "skip"}));
    }
}
