//! Directory-backed task store: one pretty-printed JSON document per task.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::traits::{
    StoreStatistics, TaskFilter, TaskStore, compute_statistics, is_expired, matches_query,
    should_replace, sort_newest_first, sort_pending,
};
use crate::task::{Task, TaskStatus};

pub struct FileTaskStore {
    dir: PathBuf,
    /// Serializes read-compare-write cycles so last-writer-wins holds.
    write_lock: Mutex<()>,
}

impl FileTaskStore {
    /// Open (or create) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        info!(path = %dir.display(), "Task store opened");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn read_task(path: &Path) -> Result<Option<Task>, StoreError> {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                id: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    /// Every readable record. Corrupt files are logged and skipped.
    async fn read_all(&self) -> Result<Vec<Task>, StoreError> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut tasks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match Self::read_task(&path).await {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), "Skipping unreadable task record: {}", e),
            }
        }
        Ok(tasks)
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn load(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Self::read_task(&self.path_for(id)).await
    }

    async fn save(&self, task: &Task) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(task.id);

        // A corrupt existing record is overwritten rather than blocking saves.
        // Other read errors fail the save.
        let existing = match Self::read_task(&path).await {
            Ok(existing) => existing,
            Err(StoreError::Corrupt { reason, .. }) => {
                warn!(task_id = %task.id, "Overwriting corrupt task record: {}", reason);
                None
            }
            Err(e) => return Err(e),
        };
        if !should_replace(existing.as_ref(), task) {
            debug!(task_id = %task.id, "Ignoring stale save");
            return Ok(());
        }

        let body = serde_json::to_vec_pretty(task)?;
        let tmp = self.dir.join(format!("{}.json.tmp", task.id));
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        let mut pending: Vec<Task> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        sort_pending(&mut pending);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect();
        sort_newest_first(&mut tasks);
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|t| matches_query(t, query))
            .collect();
        sort_newest_first(&mut tasks);
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn statistics(&self) -> Result<StoreStatistics, StoreError> {
        Ok(compute_statistics(&self.read_all().await?))
    }

    async fn cleanup(&self, older_than: Duration) -> Result<usize, StoreError> {
        let expired: Vec<Uuid> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|t| is_expired(t, older_than))
            .map(|t| t.id)
            .collect();

        let mut removed = 0;
        for id in expired {
            if self.delete(id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Cleaned up finished tasks");
        }
        Ok(removed)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let probe = self.dir.join(".health");
        fs::write(&probe, b"ok").await.map_err(|e| {
            StoreError::Unavailable(format!("{} is not writable: {e}", self.dir.display()))
        })?;
        fs::remove_file(&probe).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Action, Priority};

    fn task(name: &str) -> Task {
        Task::new(name, vec![Action::new("a", "echo").with_param("message", name)])
    }

    #[tokio::test]
    async fn save_load_roundtrip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let t = task("persisted").with_priority(Priority::High);
        {
            let store = FileTaskStore::open(dir.path()).await.unwrap();
            store.save(&t).await.unwrap();
        }

        let store = FileTaskStore::open(dir.path()).await.unwrap();
        let loaded = store.load(t.id).await.unwrap().unwrap();
        assert_eq!(loaded, t);
        assert_eq!(store.list_pending(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn corrupt_file_is_reported_on_load_and_skipped_in_lists() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path()).await.unwrap();
        let good = task("good");
        store.save(&good).await.unwrap();

        let bad_id = Uuid::new_v4();
        std::fs::write(dir.path().join(format!("{bad_id}.json")), "{not json").unwrap();

        assert!(matches!(
            store.load(bad_id).await,
            Err(StoreError::Corrupt { .. })
        ));
        let all = store.list(&TaskFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, good.id);
    }

    #[tokio::test]
    async fn save_overwrites_corrupt_record_but_not_unreadable_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path()).await.unwrap();

        let repaired = task("repaired");
        std::fs::write(dir.path().join(format!("{}.json", repaired.id)), "{not json").unwrap();
        store.save(&repaired).await.unwrap();
        assert_eq!(store.load(repaired.id).await.unwrap().unwrap(), repaired);

        // A directory in the record's place cannot be read as a file.
        let blocked = task("blocked");
        std::fs::create_dir(dir.path().join(format!("{}.json", blocked.id))).unwrap();
        let err = store.save(&blocked).await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[tokio::test]
    async fn stale_save_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path()).await.unwrap();
        let mut t = task("t");
        let mut stale = t.clone();
        t.transition_to(TaskStatus::Running, None).unwrap();
        stale.updated_at = t.updated_at - chrono::Duration::seconds(1);

        store.save(&t).await.unwrap();
        store.save(&stale).await.unwrap();
        assert_eq!(
            store.load(t.id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn delete_statistics_and_health() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path()).await.unwrap();
        let t = task("t");
        store.save(&t).await.unwrap();

        store.health_check().await.unwrap();
        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_status["pending"], 1);

        assert!(store.delete(t.id).await.unwrap());
        assert!(store.load(t.id).await.unwrap().is_none());
        assert_eq!(store.statistics().await.unwrap().total, 0);
    }
}
