//! Task and action records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::state::{StateTransition, TaskStatus, TransitionError};

/// Cap on stored transitions per task.
const MAX_TRANSITIONS: usize = 200;

/// Task priority. Higher priorities dequeue first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    #[serde(alias = "urgent")]
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Classification tag. Used for filtering and metrics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Computation,
    Io,
    Network,
    Storage,
    Mixed,
}

/// Per-action status, independent of the parent task's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Never ran (or its result was discarded) because the task ended first.
    Skipped,
}

/// Machine-readable category of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    UnknownActionType,
    ExecutorFailure,
    TaskTimeout,
    /// A task this one depends on ended without completing.
    DependencyFailed,
}

/// Error payload stored on a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
    /// Index of the action that was executing, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_index: Option<usize>,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            action_index: None,
        }
    }

    pub fn at_action(mut self, index: usize) -> Self {
        self.action_index = Some(index);
        self
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "secs")]
    pub duration: Duration,
    pub attempt: u32,
}

/// One executable step within a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Retry bound for this action; `None` uses the scheduler default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempt_count: u32,
    /// Times the task-level retry budget re-armed this action.
    #[serde(default)]
    pub rearm_count: u32,
}

impl Action {
    pub fn new(name: impl Into<String>, action_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            action_type: action_type.into(),
            parameters: serde_json::Map::new(),
            max_retries: None,
            status: ActionStatus::Pending,
            result: None,
            error: None,
            attempt_count: 0,
            rearm_count: 0,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Get a string parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }

    /// Get an unsigned integer parameter.
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(|v| v.as_u64())
    }
}

/// A unit of work: an ordered list of actions plus scheduling metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: TaskStatus,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Tasks that must complete before this one is dispatched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Uuid>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    /// Budget for the whole action sequence; `None` uses the scheduler default.
    #[serde(default, with = "opt_secs", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Index of the next action to execute.
    #[serde(default)]
    pub next_action: usize,
    /// Execution time consumed so far, excluding time spent paused.
    #[serde(default, with = "secs")]
    pub active_time: Duration,
    #[serde(default)]
    pub history: Vec<StateTransition>,
    /// Set when the final record could not be persisted.
    #[serde(default)]
    pub needs_reconciliation: bool,
}

impl Task {
    /// Create a new pending task.
    pub fn new(name: impl Into<String>, actions: Vec<Action>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            task_type: TaskType::default(),
            priority: Priority::default(),
            status: TaskStatus::Pending,
            actions,
            tags: Vec::new(),
            category: None,
            dependencies: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            retry_count: 0,
            max_retries: 0,
            timeout: None,
            result: None,
            error: None,
            next_action: 0,
            active_time: Duration::ZERO,
            history: Vec::new(),
            needs_reconciliation: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = Uuid>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    /// Transition to a new state, recording history and timestamps.
    pub fn transition_to(
        &mut self,
        new_status: TaskStatus,
        reason: Option<String>,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(new_status) {
            return Err(TransitionError {
                from: self.status,
                to: new_status,
            });
        }

        let now = Utc::now();
        self.history.push(StateTransition {
            from: self.status,
            to: new_status,
            timestamp: now,
            reason,
        });
        // The admission transition is always kept; the oldest ones after it go first.
        if self.history.len() > MAX_TRANSITIONS {
            let drain_count = self.history.len() - MAX_TRANSITIONS;
            self.history.drain(1..=drain_count);
        }

        self.status = new_status;
        self.updated_at = now;

        match new_status {
            TaskStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(now);
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.finished_at = Some(now);
            }
            _ => {}
        }

        Ok(())
    }

    /// Mark the record as modified.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Mark every not-yet-finished action from `from` onwards as skipped.
    pub fn skip_remaining(&mut self, from: usize) {
        for action in self.actions.iter_mut().skip(from) {
            if matches!(action.status, ActionStatus::Pending | ActionStatus::Running) {
                action.status = ActionStatus::Skipped;
            }
        }
    }

    /// Name of the action that would run next.
    pub fn current_action(&self) -> Option<&Action> {
        self.actions.get(self.next_action)
    }
}

/// Read-only view of a task returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub name: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub task_type: TaskType,
    pub current_action: Option<String>,
    pub completed_actions: usize,
    pub total_actions: usize,
    pub actions: Vec<ActionSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Uuid>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub needs_reconciliation: bool,
}

/// Per-action slice of a [`TaskSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSummary {
    pub name: String,
    pub action_type: String,
    pub status: ActionStatus,
    pub attempt_count: u32,
    pub error: Option<String>,
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            name: task.name.clone(),
            status: task.status,
            priority: task.priority,
            task_type: task.task_type,
            current_action: if task.status.is_terminal() {
                None
            } else {
                task.current_action().map(|a| a.name.clone())
            },
            completed_actions: task
                .actions
                .iter()
                .filter(|a| a.status == ActionStatus::Succeeded)
                .count(),
            total_actions: task.actions.len(),
            actions: task
                .actions
                .iter()
                .map(|a| ActionSummary {
                    name: a.name.clone(),
                    action_type: a.action_type.clone(),
                    status: a.status,
                    attempt_count: a.attempt_count,
                    error: a.error.clone(),
                })
                .collect(),
            dependencies: task.dependencies.clone(),
            retry_count: task.retry_count,
            created_at: task.created_at,
            updated_at: task.updated_at,
            started_at: task.started_at,
            finished_at: task.finished_at,
            result: task.result.clone(),
            error: task.error.clone(),
            needs_reconciliation: task.needs_reconciliation,
        }
    }
}

/// Durations as fractional seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Task {
        Task::new(
            "Build report",
            vec![
                Action::new("fetch", "echo"),
                Action::new("summarize", "llm_inference").with_max_retries(2),
            ],
        )
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn urgent_is_an_alias_for_critical() {
        let p: Priority = serde_json::from_str("\"urgent\"").unwrap();
        assert_eq!(p, Priority::Critical);
    }

    #[test]
    fn transitions_set_timestamps_and_history() {
        let mut task = sample();
        task.transition_to(TaskStatus::Running, Some("dispatched".into()))
            .unwrap();
        assert!(task.started_at.is_some());
        assert!(task.finished_at.is_none());

        task.transition_to(TaskStatus::Paused, None).unwrap();
        task.transition_to(TaskStatus::Running, None).unwrap();
        task.transition_to(TaskStatus::Completed, None).unwrap();

        assert!(task.finished_at.is_some());
        let path: Vec<_> = task.history.iter().map(|t| t.to).collect();
        assert_eq!(
            path,
            vec![
                TaskStatus::Running,
                TaskStatus::Paused,
                TaskStatus::Running,
                TaskStatus::Completed
            ]
        );
    }

    #[test]
    fn illegal_transition_is_a_noop() {
        let mut task = sample();
        let before = task.clone();
        let err = task.transition_to(TaskStatus::Paused, None).unwrap_err();
        assert_eq!(err.from, TaskStatus::Pending);
        assert_eq!(err.to, TaskStatus::Paused);
        assert_eq!(task, before);
    }

    #[test]
    fn history_is_capped_but_keeps_first_transition() {
        let mut task = sample();
        task.transition_to(TaskStatus::Running, None).unwrap();
        for _ in 0..150 {
            task.transition_to(TaskStatus::Paused, None).unwrap();
            task.transition_to(TaskStatus::Running, None).unwrap();
        }
        task.transition_to(TaskStatus::Completed, None).unwrap();

        assert_eq!(task.history.len(), MAX_TRANSITIONS);
        let first = &task.history[0];
        assert_eq!((first.from, first.to), (TaskStatus::Pending, TaskStatus::Running));
        let last = task.history.last().unwrap();
        assert_eq!((last.from, last.to), (TaskStatus::Running, TaskStatus::Completed));
        // Everything after the first entry is still in order.
        assert!(task.history.windows(2).skip(1).all(|w| w[0].to == w[1].from));
    }

    #[test]
    fn deserializes_minimal_json() {
        let task: Task = serde_json::from_value(serde_json::json!({
            "name": "check host",
            "priority": "high",
            "timeout": 2.5,
            "actions": [
                {"name": "disk", "type": "system_check", "parameters": {"check_type": "disk"}}
            ]
        }))
        .unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.timeout, Some(Duration::from_millis(2500)));
        assert_eq!(task.actions[0].action_type, "system_check");
        assert_eq!(task.actions[0].param_str("check_type"), Some("disk"));
    }

    #[test]
    fn skip_remaining_leaves_finished_actions() {
        let mut task = sample();
        task.actions[0].status = ActionStatus::Succeeded;
        task.skip_remaining(0);
        assert_eq!(task.actions[0].status, ActionStatus::Succeeded);
        assert_eq!(task.actions[1].status, ActionStatus::Skipped);
    }

    #[test]
    fn snapshot_reports_progress() {
        let mut task = sample();
        task.transition_to(TaskStatus::Running, None).unwrap();
        task.actions[0].status = ActionStatus::Succeeded;
        task.next_action = 1;

        let snap = TaskSnapshot::from(&task);
        assert_eq!(snap.completed_actions, 1);
        assert_eq!(snap.total_actions, 2);
        assert_eq!(snap.current_action.as_deref(), Some("summarize"));
    }
}
