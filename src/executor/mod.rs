//! Executor abstraction: the capability behind each action type.

pub mod builtin;
pub mod registry;

pub use registry::ActionRegistry;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::ExecutorError;
use crate::task::{Action, TaskType};

/// What an executor sees about the task it is working for.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionContext {
    pub task_id: Uuid,
    pub task_name: String,
    pub task_type: TaskType,
    /// Position of the action within the task.
    pub action_index: usize,
    /// 1-based attempt number for this action.
    pub attempt: u32,
    /// Time left before the task deadline, when one applies.
    pub time_remaining: Option<Duration>,
}

impl ExecutionContext {
    /// Context for running an executor outside a scheduler (tests, one-off calls).
    pub fn detached() -> Self {
        Self {
            task_id: Uuid::new_v4(),
            task_name: String::new(),
            task_type: TaskType::default(),
            action_index: 0,
            attempt: 1,
            time_remaining: None,
        }
    }

    /// Shorten an executor-level timeout so it never outlives the task deadline.
    pub fn bounded(&self, timeout: Duration) -> Duration {
        self.time_remaining
            .map_or(timeout, |remaining| timeout.min(remaining))
    }
}

/// Successful output of an executor call.
#[derive(Debug, Clone)]
pub struct ActionOutput {
    pub result: serde_json::Value,
    pub duration: Duration,
}

impl ActionOutput {
    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self { result, duration }
    }

    pub fn text(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            result: serde_json::Value::String(text.into()),
            duration,
        }
    }
}

/// Performs the real work of one action type.
///
/// The scheduler treats `execute` as opaque: it is awaited to completion
/// and never cancelled mid-flight.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    async fn execute(
        &self,
        action: &Action,
        ctx: &ExecutionContext,
    ) -> Result<ActionOutput, ExecutorError>;
}

/// Fetch a required string parameter.
pub fn require_str<'a>(action: &'a Action, key: &str) -> Result<&'a str, ExecutorError> {
    action
        .param_str(key)
        .ok_or_else(|| ExecutorError::InvalidParameters(format!("missing '{key}' parameter")))
}
