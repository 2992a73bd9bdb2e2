//! In-memory task store. Nothing survives the process.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::traits::{
    StoreStatistics, TaskFilter, TaskStore, compute_statistics, is_expired, matches_query,
    should_replace, sort_newest_first, sort_pending,
};
use crate::task::{Task, TaskStatus};

#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn load(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn save(&self, task: &Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        if should_replace(tasks.get(&task.id), task) {
            tasks.insert(task.id, task.clone());
        } else {
            tracing::debug!(task_id = %task.id, "Ignoring stale save");
        }
        Ok(())
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        let mut pending: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        sort_pending(&mut pending);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.tasks.write().await.remove(&id).is_some())
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        sort_newest_first(&mut tasks);
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| matches_query(t, query))
            .cloned()
            .collect();
        sort_newest_first(&mut tasks);
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn statistics(&self) -> Result<StoreStatistics, StoreError> {
        Ok(compute_statistics(self.tasks.read().await.values()))
    }

    async fn cleanup(&self, older_than: Duration) -> Result<usize, StoreError> {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| !is_expired(t, older_than));
        Ok(before - tasks.len())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Action, Priority};

    fn task(name: &str) -> Task {
        Task::new(name, vec![Action::new("a", "echo")])
    }

    #[tokio::test]
    async fn save_and_load() {
        let store = InMemoryTaskStore::new();
        let t = task("one");
        store.save(&t).await.unwrap();

        assert_eq!(store.load(t.id).await.unwrap(), Some(t));
        assert_eq!(store.load(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stale_save_is_ignored() {
        let store = InMemoryTaskStore::new();
        let mut t = task("one");
        let mut stale = t.clone();
        t.transition_to(TaskStatus::Running, None).unwrap();
        stale.updated_at = t.updated_at - chrono::Duration::seconds(1);
        store.save(&t).await.unwrap();
        store.save(&stale).await.unwrap();

        let loaded = store.load(t.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn list_pending_orders_and_limits() {
        let store = InMemoryTaskStore::new();
        let low = task("low").with_priority(Priority::Low);
        let critical = task("critical").with_priority(Priority::Critical);
        let mut running = task("running").with_priority(Priority::Critical);
        running.transition_to(TaskStatus::Running, None).unwrap();
        for t in [&low, &critical, &running] {
            store.save(t).await.unwrap();
        }

        let pending = store.list_pending(10).await.unwrap();
        let names: Vec<_> = pending.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["critical", "low"]);
        assert_eq!(store.list_pending(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_terminal_tasks() {
        let store = InMemoryTaskStore::new();
        let mut old = task("old");
        old.transition_to(TaskStatus::Running, None).unwrap();
        old.transition_to(TaskStatus::Failed, None).unwrap();
        old.finished_at = Some(chrono::Utc::now() - chrono::Duration::days(2));
        let fresh = task("fresh");
        store.save(&old).await.unwrap();
        store.save(&fresh).await.unwrap();

        let removed = store.cleanup(Duration::from_secs(86_400)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len().await, 1);
        assert!(store.load(fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn search_and_delete() {
        let store = InMemoryTaskStore::new();
        let t = task("Rotate logs").with_tags(["ops"]);
        store.save(&t).await.unwrap();
        store.save(&task("deploy")).await.unwrap();

        let found = store.search("ROTATE", 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(store.delete(t.id).await.unwrap());
        assert!(!store.delete(t.id).await.unwrap());
        assert!(store.search("rotate", 10).await.unwrap().is_empty());
    }
}
