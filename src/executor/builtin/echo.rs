//! Echo executor: returns its parameters. Handy for dry runs and demos.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::ExecutorError;
use crate::executor::{ActionOutput, ExecutionContext, Executor};
use crate::task::Action;

/// Executor for `echo` actions.
///
/// `delay_ms` sleeps before answering; `fail` (a message) turns the
/// attempt into a retryable failure.
#[derive(Debug, Default)]
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the action parameters unchanged."
    }

    async fn execute(
        &self,
        action: &Action,
        ctx: &ExecutionContext,
    ) -> Result<ActionOutput, ExecutorError> {
        let start = Instant::now();

        if let Some(delay) = action.param_u64("delay_ms") {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if let Some(message) = action.param_str("fail") {
            return Err(ExecutorError::ExecutionFailed(format!(
                "{message} (attempt {})",
                ctx.attempt
            )));
        }

        Ok(ActionOutput::success(
            serde_json::Value::Object(action.parameters.clone()),
            start.elapsed(),
        ))
    }
}
