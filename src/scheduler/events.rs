//! Scheduler events, broadcast to subscribers as tasks move through their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Accepted into the run queue.
    Admitted,
    /// Picked up by a worker.
    Started,
    /// An executor call is about to run.
    ActionAttempted,
    /// A failed action will be tried again.
    ActionRetried,
    Paused,
    /// Re-queued after a pause.
    Resumed,
    /// Reached completed, failed or cancelled.
    Terminal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerEvent {
    pub task_id: Uuid,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl SchedulerEvent {
    pub fn new(task_id: Uuid, kind: EventKind, detail: serde_json::Value) -> Self {
        Self {
            task_id,
            kind,
            timestamp: Utc::now(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_kind_in_snake_case() {
        let event = SchedulerEvent::new(
            Uuid::nil(),
            EventKind::ActionAttempted,
            serde_json::json!({ "attempt": 1 }),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "action_attempted");
        assert_eq!(json["detail"]["attempt"], 1);
    }
}
