//! File-operation executor.
//!
//! Operations: `create`, `read`, `copy`, `move`, `delete`. All paths are
//! checked against an optional sandbox directory before anything touches
//! the filesystem.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use tokio::fs;

use crate::error::ExecutorError;
use crate::executor::{ActionOutput, ExecutionContext, Executor, require_str};
use crate::task::Action;

/// Maximum file size for reading (1MB).
const MAX_READ_SIZE: u64 = 1024 * 1024;

/// Maximum content size for creating (5MB).
const MAX_WRITE_SIZE: usize = 5 * 1024 * 1024;

/// Resolve `.` and `..` without touching the filesystem.
///
/// `canonicalize` fails on paths that don't exist yet, so targets of
/// `create`/`copy`/`move` need a purely lexical form.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, std::path::Component::Normal(_)))
                {
                    components.pop();
                }
            }
            std::path::Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Resolve `path_str` and ensure it stays under `base_dir` when one is set.
fn validate_path(path_str: &str, base_dir: Option<&Path>) -> Result<PathBuf, ExecutorError> {
    let path = PathBuf::from(path_str);

    let resolved = if path.is_absolute() {
        path.canonicalize()
            .unwrap_or_else(|_| normalize_lexical(&path))
    } else {
        let base = base_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let joined = base.join(&path);
        joined
            .canonicalize()
            .unwrap_or_else(|_| normalize_lexical(&joined))
    };

    let Some(base) = base_dir else {
        return Ok(resolved);
    };

    let base_canonical = base
        .canonicalize()
        .unwrap_or_else(|_| normalize_lexical(base));

    // Canonicalize the nearest existing ancestor so symlinked parents
    // cannot smuggle a new file out of the sandbox.
    let check_path = {
        let mut ancestor = resolved.as_path();
        let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
        loop {
            if ancestor.exists() {
                let mut result = ancestor
                    .canonicalize()
                    .unwrap_or_else(|_| ancestor.to_path_buf());
                for part in tail.into_iter().rev() {
                    result = result.join(part);
                }
                break result;
            }
            if let Some(name) = ancestor.file_name() {
                tail.push(name);
            }
            match ancestor.parent() {
                Some(parent) if parent != ancestor => ancestor = parent,
                _ => break resolved.clone(),
            }
        }
    };

    if !check_path.starts_with(&base_canonical) {
        return Err(ExecutorError::NotAuthorized(format!(
            "Path escapes sandbox: {path_str}"
        )));
    }

    Ok(resolved)
}

fn io_failure(op: &str, path: &Path, e: std::io::Error) -> ExecutorError {
    match e.kind() {
        std::io::ErrorKind::NotFound => {
            ExecutorError::InvalidParameters(format!("{op}: {} does not exist", path.display()))
        }
        std::io::ErrorKind::PermissionDenied => {
            ExecutorError::NotAuthorized(format!("{op}: {}: {e}", path.display()))
        }
        _ => ExecutorError::ExecutionFailed(format!("{op}: {}: {e}", path.display())),
    }
}

/// Executor for `file_operation` actions.
#[derive(Debug, Default)]
pub struct FileOperationExecutor {
    base_dir: Option<PathBuf>,
}

impl FileOperationExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Confine every path to `dir`.
    pub fn with_base_dir(mut self, dir: PathBuf) -> Self {
        self.base_dir = Some(dir);
        self
    }

    fn resolve(&self, action: &Action, key: &str) -> Result<PathBuf, ExecutorError> {
        validate_path(require_str(action, key)?, self.base_dir.as_deref())
    }

    async fn create(&self, action: &Action) -> Result<serde_json::Value, ExecutorError> {
        let path = self.resolve(action, "path")?;
        let content = action.param_str("content").unwrap_or_default();
        if content.len() > MAX_WRITE_SIZE {
            return Err(ExecutorError::InvalidParameters(format!(
                "content exceeds {MAX_WRITE_SIZE} bytes"
            )));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_failure("create", parent, e))?;
        }
        fs::write(&path, content)
            .await
            .map_err(|e| io_failure("create", &path, e))?;

        Ok(json!({
            "path": path.display().to_string(),
            "bytes_written": content.len(),
        }))
    }

    async fn read(&self, action: &Action) -> Result<serde_json::Value, ExecutorError> {
        let path = self.resolve(action, "path")?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| io_failure("read", &path, e))?;
        if metadata.len() > MAX_READ_SIZE {
            return Err(ExecutorError::InvalidParameters(format!(
                "{} is {} bytes, limit is {MAX_READ_SIZE}",
                path.display(),
                metadata.len()
            )));
        }
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| io_failure("read", &path, e))?;

        Ok(json!({
            "path": path.display().to_string(),
            "content": content,
            "size": metadata.len(),
        }))
    }

    async fn copy(&self, action: &Action) -> Result<serde_json::Value, ExecutorError> {
        let source = self.resolve(action, "source")?;
        let destination = self.resolve(action, "destination")?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_failure("copy", parent, e))?;
        }
        let bytes = fs::copy(&source, &destination)
            .await
            .map_err(|e| io_failure("copy", &source, e))?;

        Ok(json!({
            "source": source.display().to_string(),
            "destination": destination.display().to_string(),
            "bytes_copied": bytes,
        }))
    }

    async fn rename(&self, action: &Action) -> Result<serde_json::Value, ExecutorError> {
        let source = self.resolve(action, "source")?;
        let destination = self.resolve(action, "destination")?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_failure("move", parent, e))?;
        }
        fs::rename(&source, &destination)
            .await
            .map_err(|e| io_failure("move", &source, e))?;

        Ok(json!({
            "source": source.display().to_string(),
            "destination": destination.display().to_string(),
        }))
    }

    async fn delete(&self, action: &Action) -> Result<serde_json::Value, ExecutorError> {
        let path = self.resolve(action, "path")?;
        if self.base_dir.as_deref().is_some_and(|base| {
            base.canonicalize().unwrap_or_else(|_| normalize_lexical(base)) == path
        }) {
            return Err(ExecutorError::NotAuthorized(
                "refusing to delete the sandbox root".to_string(),
            ));
        }

        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| io_failure("delete", &path, e))?;
        if metadata.is_dir() {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        }
        .map_err(|e| io_failure("delete", &path, e))?;

        Ok(json!({
            "path": path.display().to_string(),
            "deleted": true,
        }))
    }
}

#[async_trait]
impl Executor for FileOperationExecutor {
    fn name(&self) -> &str {
        "file_operation"
    }

    fn description(&self) -> &str {
        "Create, read, copy, move or delete files. Paths are confined to the sandbox directory when one is configured."
    }

    async fn execute(
        &self,
        action: &Action,
        _ctx: &ExecutionContext,
    ) -> Result<ActionOutput, ExecutorError> {
        let start = Instant::now();
        let operation = require_str(action, "operation")?;

        let result = match operation {
            "create" | "write" => self.create(action).await?,
            "read" => self.read(action).await?,
            "copy" => self.copy(action).await?,
            "move" => self.rename(action).await?,
            "delete" => self.delete(action).await?,
            other => {
                return Err(ExecutorError::InvalidParameters(format!(
                    "unknown operation '{other}'"
                )));
            }
        };

        Ok(ActionOutput::success(result, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(operation: &str) -> Action {
        Action::new(operation, "file_operation").with_param("operation", operation)
    }

    async fn run(
        executor: &FileOperationExecutor,
        action: Action,
    ) -> Result<ActionOutput, ExecutorError> {
        executor.execute(&action, &ExecutionContext::detached()).await
    }

    #[test]
    fn test_normalize_lexical() {
        assert_eq!(
            normalize_lexical(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_lexical(Path::new("/../x")), PathBuf::from("/x"));
    }

    #[test]
    fn test_validate_path_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate_path("../../etc/passwd", Some(dir.path())).unwrap_err();
        assert!(matches!(err, ExecutorError::NotAuthorized(_)));

        let err = validate_path("/etc/passwd", Some(dir.path())).unwrap_err();
        assert!(matches!(err, ExecutorError::NotAuthorized(_)));
    }

    #[test]
    fn test_validate_path_allows_new_nested_file() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = validate_path("new/sub/file.txt", Some(dir.path())).unwrap();
        assert!(resolved.ends_with("new/sub/file.txt"));
    }

    #[tokio::test]
    async fn test_create_read_copy_move_delete() {
        let dir = tempfile::tempdir().unwrap();
        let executor = FileOperationExecutor::new().with_base_dir(dir.path().to_path_buf());

        run(
            &executor,
            op("create")
                .with_param("path", "notes/a.txt")
                .with_param("content", "hello"),
        )
        .await
        .unwrap();

        let read = run(&executor, op("read").with_param("path", "notes/a.txt"))
            .await
            .unwrap();
        assert_eq!(read.result["content"], "hello");

        run(
            &executor,
            op("copy")
                .with_param("source", "notes/a.txt")
                .with_param("destination", "notes/b.txt"),
        )
        .await
        .unwrap();
        assert!(dir.path().join("notes/b.txt").exists());

        run(
            &executor,
            op("move")
                .with_param("source", "notes/b.txt")
                .with_param("destination", "archive/b.txt"),
        )
        .await
        .unwrap();
        assert!(!dir.path().join("notes/b.txt").exists());
        assert!(dir.path().join("archive/b.txt").exists());

        run(&executor, op("delete").with_param("path", "notes"))
            .await
            .unwrap();
        assert!(!dir.path().join("notes").exists());
    }

    #[tokio::test]
    async fn test_read_missing_file_is_not_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let executor = FileOperationExecutor::new().with_base_dir(dir.path().to_path_buf());
        let err = run(&executor, op("read").with_param("path", "absent.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidParameters(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_refuses_to_delete_sandbox_root() {
        let dir = tempfile::tempdir().unwrap();
        let executor = FileOperationExecutor::new().with_base_dir(dir.path().to_path_buf());
        let err = run(&executor, op("delete").with_param("path", "."))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::NotAuthorized(_)));
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let executor = FileOperationExecutor::new();
        let err = run(&executor, op("truncate")).await.unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidParameters(_)));
    }
}
