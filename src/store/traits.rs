//! `TaskStore` trait: the durability boundary of the scheduler.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;
use crate::task::{Priority, Task, TaskStatus, TaskType};

/// Criteria for [`TaskStore::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub task_type: Option<TaskType>,
    pub tag: Option<String>,
    pub category: Option<String>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| task.status == s)
            && self.priority.is_none_or(|p| task.priority == p)
            && self.task_type.is_none_or(|t| task.task_type == t)
            && self
                .tag
                .as_ref()
                .is_none_or(|tag| task.tags.iter().any(|t| t == tag))
            && self
                .category
                .as_ref()
                .is_none_or(|c| task.category.as_ref() == Some(c))
    }
}

/// Aggregate counts over stored tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStatistics {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub needs_reconciliation: usize,
    pub oldest_pending: Option<DateTime<Utc>>,
}

/// Persistence backend for task records.
///
/// Saves are last-writer-wins by `updated_at`: a save whose record is
/// older than the stored one is ignored. The store never originates
/// status changes.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Fetch a task by ID.
    async fn load(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Insert or replace a task.
    async fn save(&self, task: &Task) -> Result<(), StoreError>;

    /// Pending tasks, highest priority first, then oldest first.
    async fn list_pending(&self, limit: usize) -> Result<Vec<Task>, StoreError>;

    /// Remove a task. Returns whether a record existed.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Tasks matching `filter`, newest first.
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    /// Case-insensitive match on name, description, tags and category.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Task>, StoreError>;

    async fn statistics(&self) -> Result<StoreStatistics, StoreError>;

    /// Delete terminal tasks that finished more than `older_than` ago.
    async fn cleanup(&self, older_than: Duration) -> Result<usize, StoreError>;

    /// Verify the backend is usable.
    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Whether `incoming` may overwrite `existing`.
pub(crate) fn should_replace(existing: Option<&Task>, incoming: &Task) -> bool {
    existing.is_none_or(|current| incoming.updated_at >= current.updated_at)
}

pub(crate) fn sort_pending(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}

pub(crate) fn sort_newest_first(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

pub(crate) fn matches_query(task: &Task, query: &str) -> bool {
    let query = query.to_lowercase();
    task.name.to_lowercase().contains(&query)
        || task.description.to_lowercase().contains(&query)
        || task.tags.iter().any(|t| t.to_lowercase().contains(&query))
        || task
            .category
            .as_ref()
            .is_some_and(|c| c.to_lowercase().contains(&query))
}

/// Terminal and finished before `now - older_than`.
pub(crate) fn is_expired(task: &Task, older_than: Duration) -> bool {
    let Ok(age) = chrono::Duration::from_std(older_than) else {
        return false;
    };
    let cutoff = Utc::now() - age;
    task.status.is_terminal() && task.finished_at.unwrap_or(task.updated_at) < cutoff
}

pub(crate) fn compute_statistics<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> StoreStatistics {
    let mut stats = StoreStatistics::default();
    for status in TaskStatus::ALL {
        stats.by_status.insert(status.to_string(), 0);
    }
    for task in tasks {
        stats.total += 1;
        *stats.by_status.entry(task.status.to_string()).or_default() += 1;
        *stats.by_priority.entry(task.priority.to_string()).or_default() += 1;
        if task.needs_reconciliation {
            stats.needs_reconciliation += 1;
        }
        if task.status == TaskStatus::Pending
            && stats.oldest_pending.is_none_or(|oldest| task.created_at < oldest)
        {
            stats.oldest_pending = Some(task.created_at);
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Action;

    fn task(name: &str) -> Task {
        Task::new(name, vec![Action::new("a", "echo")])
    }

    #[test]
    fn filter_matches_on_every_set_field() {
        let t = task("nightly backup")
            .with_priority(Priority::High)
            .with_tags(["ops"])
            .with_category("maintenance");

        assert!(TaskFilter::default().matches(&t));
        assert!(TaskFilter::default().with_tag("ops").matches(&t));
        assert!(!TaskFilter::default().with_tag("dev").matches(&t));
        assert!(
            !TaskFilter::default()
                .with_status(TaskStatus::Completed)
                .matches(&t)
        );
    }

    #[test]
    fn older_record_does_not_replace_newer() {
        let newer = task("x");
        let mut older = newer.clone();
        older.updated_at = newer.updated_at - chrono::Duration::seconds(5);

        assert!(!should_replace(Some(&newer), &older));
        assert!(should_replace(Some(&older), &newer));
        assert!(should_replace(None, &older));
    }

    #[test]
    fn pending_order_is_priority_then_age() {
        let mut low = task("low").with_priority(Priority::Low);
        let mut high_old = task("high-old").with_priority(Priority::High);
        let high_new = task("high-new").with_priority(Priority::High);
        low.created_at = high_new.created_at - chrono::Duration::seconds(20);
        high_old.created_at = high_new.created_at - chrono::Duration::seconds(10);

        let mut tasks = vec![low, high_new, high_old];
        sort_pending(&mut tasks);
        let names: Vec<_> = tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["high-old", "high-new", "low"]);
    }

    #[test]
    fn query_is_case_insensitive() {
        let t = task("Rotate Logs").with_tags(["Ops"]);
        assert!(matches_query(&t, "rotate"));
        assert!(matches_query(&t, "OPS"));
        assert!(!matches_query(&t, "deploy"));
    }

    #[test]
    fn statistics_count_every_status() {
        let mut done = task("done");
        done.transition_to(TaskStatus::Running, None).unwrap();
        done.transition_to(TaskStatus::Completed, None).unwrap();
        let pending = task("pending");

        let stats = compute_statistics([&done, &pending]);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status["completed"], 1);
        assert_eq!(stats.by_status["pending"], 1);
        assert_eq!(stats.by_status["failed"], 0);
        assert_eq!(stats.oldest_pending, Some(pending.created_at));
    }
}
