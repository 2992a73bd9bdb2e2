//! Built-in executors.

mod echo;
mod file;
mod llm;
mod shell;
mod system;

pub use echo::EchoExecutor;
pub use file::FileOperationExecutor;
pub use llm::{LlmConfig, LlmExecutor};
pub use shell::ShellExecutor;
pub use system::SystemCheckExecutor;

use std::sync::Arc;

use crate::error::RegistryError;
use crate::executor::ActionRegistry;

/// Bind every built-in executor under its standard action type.
pub async fn register_defaults(
    registry: &ActionRegistry,
    llm: &LlmConfig,
) -> Result<(), RegistryError> {
    registry
        .register("shell_command", Arc::new(ShellExecutor::new()))
        .await?;
    registry
        .register("system_check", Arc::new(SystemCheckExecutor::new()))
        .await?;
    registry
        .register("file_operation", Arc::new(FileOperationExecutor::new()))
        .await?;
    registry
        .register("llm_inference", Arc::new(LlmExecutor::new(llm.clone())))
        .await?;
    registry.register("echo", Arc::new(EchoExecutor)).await?;

    tracing::info!("Registered {} built-in executors", registry.count().await);
    Ok(())
}
