//! In-memory table of admitted tasks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::task::{Task, TaskStatus};

/// Control request posted to a task's worker, honored at the next checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlSignal {
    Pause,
    Cancel,
}

pub(crate) struct TaskEntry {
    pub task: Task,
    pub signal: Option<ControlSignal>,
    /// Admission sequence, reused when a paused task is re-queued.
    pub seq: u64,
    /// A worker currently owns the task.
    pub in_worker: bool,
    /// Wakes the worker out of a backoff wait.
    pub wake: Arc<Notify>,
}

/// Admitted tasks keyed by ID. Terminal tasks stay until the scheduler drops.
pub(crate) struct TaskTable {
    entries: RwLock<HashMap<Uuid, TaskEntry>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, task: Task, seq: u64) -> Result<(), SchedulerError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&task.id) {
            return Err(SchedulerError::DuplicateTask { id: task.id });
        }
        entries.insert(
            task.id,
            TaskEntry {
                task,
                signal: None,
                seq,
                in_worker: false,
                wake: Arc::new(Notify::new()),
            },
        );
        Ok(())
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.entries.read().await.contains_key(&id)
    }

    /// Clone of the current task record.
    pub async fn get(&self, id: Uuid) -> Option<Task> {
        self.entries.read().await.get(&id).map(|e| e.task.clone())
    }

    pub async fn status(&self, id: Uuid) -> Option<TaskStatus> {
        self.entries.read().await.get(&id).map(|e| e.task.status)
    }

    pub async fn dependencies(&self, id: Uuid) -> Vec<Uuid> {
        self.entries
            .read()
            .await
            .get(&id)
            .map(|e| e.task.dependencies.clone())
            .unwrap_or_default()
    }

    pub async fn update<F, R>(&self, id: Uuid, f: F) -> Result<R, SchedulerError>
    where
        F: FnOnce(&mut TaskEntry) -> R,
    {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&id)
            .ok_or(SchedulerError::TaskNotFound { id })?;
        Ok(f(entry))
    }

    /// Consume the pending control signal, if any.
    pub async fn take_signal(&self, id: Uuid) -> Option<ControlSignal> {
        self.entries
            .write()
            .await
            .get_mut(&id)
            .and_then(|e| e.signal.take())
    }

    pub async fn has_signal(&self, id: Uuid) -> bool {
        self.entries
            .read()
            .await
            .get(&id)
            .is_some_and(|e| e.signal.is_some())
    }

    pub async fn wake_handle(&self, id: Uuid) -> Option<Arc<Notify>> {
        self.entries.read().await.get(&id).map(|e| e.wake.clone())
    }

    pub async fn summary(&self) -> HashMap<TaskStatus, usize> {
        let mut counts: HashMap<TaskStatus, usize> =
            TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for entry in self.entries.read().await.values() {
            *counts.entry(entry.task.status).or_default() += 1;
        }
        counts
    }

    /// Tasks currently owned by a worker.
    pub async fn in_worker(&self) -> Vec<Uuid> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.in_worker)
            .map(|e| e.task.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Action;

    fn task() -> Task {
        Task::new("t", vec![Action::new("a", "echo")])
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let table = TaskTable::new();
        let t = task();
        table.insert(t.clone(), 0).await.unwrap();
        assert!(matches!(
            table.insert(t, 1).await,
            Err(SchedulerError::DuplicateTask { .. })
        ));
    }

    #[tokio::test]
    async fn update_unknown_task() {
        let table = TaskTable::new();
        let result = table.update(Uuid::new_v4(), |_| ()).await;
        assert!(matches!(result, Err(SchedulerError::TaskNotFound { .. })));
    }

    #[tokio::test]
    async fn signal_is_consumed_once() {
        let table = TaskTable::new();
        let t = task();
        let id = t.id;
        table.insert(t, 0).await.unwrap();

        table
            .update(id, |e| e.signal = Some(ControlSignal::Pause))
            .await
            .unwrap();
        assert!(table.has_signal(id).await);
        assert_eq!(table.take_signal(id).await, Some(ControlSignal::Pause));
        assert_eq!(table.take_signal(id).await, None);
    }

    #[tokio::test]
    async fn summary_counts_all_statuses() {
        let table = TaskTable::new();
        table.insert(task(), 0).await.unwrap();
        table.insert(task(), 1).await.unwrap();

        let summary = table.summary().await;
        assert_eq!(summary[&TaskStatus::Pending], 2);
        assert_eq!(summary[&TaskStatus::Running], 0);
    }
}
