//! Action registry: maps an action type to the executor that runs it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::RegistryError;
use crate::executor::Executor;

/// Registry of executors keyed by action type.
///
/// Registration happens at startup; resolves run concurrently afterwards.
pub struct ActionRegistry {
    executors: RwLock<HashMap<String, Arc<dyn Executor>>>,
}

impl ActionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
        }
    }

    /// Bind an executor to an action type. Fails if the type is already bound.
    pub async fn register(
        &self,
        action_type: impl Into<String>,
        executor: Arc<dyn Executor>,
    ) -> Result<(), RegistryError> {
        let action_type = action_type.into();
        let mut executors = self.executors.write().await;
        if executors.contains_key(&action_type) {
            tracing::warn!(
                action_type = %action_type,
                "Rejected executor registration: type already bound"
            );
            return Err(RegistryError::DuplicateRegistration { action_type });
        }
        tracing::debug!(
            action_type = %action_type,
            executor = executor.name(),
            "Registered executor"
        );
        executors.insert(action_type, executor);
        Ok(())
    }

    /// Bind an executor, replacing any existing binding. Returns the replaced one.
    pub async fn register_override(
        &self,
        action_type: impl Into<String>,
        executor: Arc<dyn Executor>,
    ) -> Option<Arc<dyn Executor>> {
        let action_type = action_type.into();
        tracing::debug!(
            action_type = %action_type,
            executor = executor.name(),
            "Registered executor (override)"
        );
        self.executors.write().await.insert(action_type, executor)
    }

    /// Find the executor for an action type.
    pub async fn resolve(&self, action_type: &str) -> Result<Arc<dyn Executor>, RegistryError> {
        self.executors
            .read()
            .await
            .get(action_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownActionType {
                action_type: action_type.to_string(),
            })
    }

    /// Remove a binding.
    pub async fn unregister(&self, action_type: &str) -> Option<Arc<dyn Executor>> {
        self.executors.write().await.remove(action_type)
    }

    /// Check if an action type is bound.
    pub async fn has(&self, action_type: &str) -> bool {
        self.executors.read().await.contains_key(action_type)
    }

    /// List bound action types, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of bound action types.
    pub async fn count(&self) -> usize {
        self.executors.read().await.len()
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
