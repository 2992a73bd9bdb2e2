//! Error types for the orchestrator.

use std::time::Duration;

use uuid::Uuid;

use crate::task::TaskStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Executor already registered for action type {action_type}")]
    DuplicateRegistration { action_type: String },

    #[error("No executor registered for action type {action_type}")]
    UnknownActionType { action_type: String },
}

/// Errors raised by a single executor attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl ExecutorError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ExecutionFailed(_) | Self::Timeout(_) | Self::Unavailable(_)
        )
    }
}

/// Scheduler errors surfaced to callers of the inbound API.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Run queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Task {id} not found")]
    TaskNotFound { id: Uuid },

    #[error("Task {id} is {from}, cannot transition to {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Invalid task: {reason}")]
    InvalidTask { reason: String },

    #[error("Task {id} already submitted")]
    DuplicateTask { id: Uuid },

    #[error("Scheduler already started")]
    AlreadyStarted,

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Failed to persist task {id} after {attempts} attempts: {reason}")]
    PersistenceFailure {
        id: Uuid,
        attempts: u32,
        reason: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Persistence backend errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
