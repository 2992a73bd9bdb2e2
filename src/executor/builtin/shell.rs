//! Shell command executor.
//!
//! Provides controlled command execution with:
//! - Working directory selection
//! - Timeout enforcement
//! - Output capture and truncation
//! - Blocked command patterns for safety

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::ExecutorError;
use crate::executor::{ActionOutput, ExecutionContext, Executor, require_str};
use crate::task::Action;

/// Maximum output size before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Default command timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Commands that are always blocked.
static BLOCKED_COMMANDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        "rm -rf /",
        "rm -rf /*",
        ":(){ :|:& };:", // Fork bomb
        "dd if=/dev/zero",
        "mkfs",
        "chmod -R 777 /",
        "> /dev/sda",
        "curl | sh",
        "wget | sh",
        "curl | bash",
        "wget | bash",
        "shutdown",
        "reboot",
    ])
});

/// Patterns that indicate potentially dangerous commands.
static DANGEROUS_PATTERNS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    vec![
        "sudo ",
        "doas ",
        " | sh",
        " | bash",
        " | zsh",
        "eval ",
        "$(curl",
        "$(wget",
        "/etc/passwd",
        "/etc/shadow",
        "~/.ssh",
        "id_rsa",
    ]
});

/// Runs `command` through the system shell.
#[derive(Debug)]
pub struct ShellExecutor {
    /// Working directory for commands (if None, uses cwd).
    working_dir: Option<PathBuf>,
    /// Command timeout.
    timeout: Duration,
    /// Whether to allow commands matching the dangerous patterns.
    allow_dangerous: bool,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            working_dir: None,
            timeout: DEFAULT_TIMEOUT,
            allow_dangerous: false,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn allow_dangerous(mut self, allow: bool) -> Self {
        self.allow_dangerous = allow;
        self
    }

    /// Check if a command is blocked.
    fn is_blocked(&self, cmd: &str) -> Option<&'static str> {
        let normalized = cmd.to_lowercase();

        if BLOCKED_COMMANDS.iter().any(|b| normalized.contains(b)) {
            return Some("Command contains blocked pattern");
        }

        if !self.allow_dangerous && DANGEROUS_PATTERNS.iter().any(|p| normalized.contains(p)) {
            return Some("Command contains potentially dangerous pattern");
        }

        None
    }

    async fn execute_command(
        &self,
        cmd: &str,
        workdir: Option<&str>,
        timeout: Duration,
    ) -> Result<(String, i32), ExecutorError> {
        if let Some(reason) = self.is_blocked(cmd) {
            return Err(ExecutorError::NotAuthorized(format!(
                "{}: {}",
                reason,
                truncate_for_error(cmd)
            )));
        }

        let cwd = workdir
            .map(PathBuf::from)
            .or_else(|| self.working_dir.clone())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        run_command(cmd, &cwd, timeout).await
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command and capture its output. Non-zero exit codes fail the attempt."
    }

    async fn execute(
        &self,
        action: &Action,
        ctx: &ExecutionContext,
    ) -> Result<ActionOutput, ExecutorError> {
        let command = require_str(action, "command")?;
        let workdir = action.param_str("workdir");
        let timeout = ctx.bounded(
            action
                .param_u64("timeout")
                .map(Duration::from_secs)
                .unwrap_or(self.timeout),
        );

        let start = Instant::now();
        let (output, exit_code) = self.execute_command(command, workdir, timeout).await?;

        if exit_code != 0 {
            return Err(ExecutorError::ExecutionFailed(format!(
                "exit code {exit_code}: {}",
                truncate_for_error(&output)
            )));
        }

        Ok(ActionOutput::success(
            serde_json::json!({
                "output": output,
                "exit_code": exit_code,
            }),
            start.elapsed(),
        ))
    }
}

/// Run a command through `sh -c`, capturing stdout and stderr.
pub(crate) async fn run_command(
    cmd: &str,
    workdir: &Path,
    timeout: Duration,
) -> Result<(String, i32), ExecutorError> {
    let mut command = if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", cmd]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", cmd]);
        c
    };

    command
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| ExecutorError::ExecutionFailed(format!("Failed to spawn command: {e}")))?;

    let result = tokio::time::timeout(timeout, async {
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let read_out = async {
            if let Some(out) = stdout.as_mut() {
                out.read_to_end(&mut stdout_buf).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let read_err = async {
            if let Some(err) = stderr.as_mut() {
                err.read_to_end(&mut stderr_buf).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        tokio::try_join!(read_out, read_err)?;
        let status = child.wait().await?;

        let stdout = String::from_utf8_lossy(&stdout_buf).to_string();
        let stderr = String::from_utf8_lossy(&stderr_buf).to_string();
        let output = if stderr.is_empty() {
            stdout
        } else if stdout.is_empty() {
            stderr
        } else {
            format!("{stdout}\n\n--- stderr ---\n{stderr}")
        };

        Ok::<_, std::io::Error>((output, status.code().unwrap_or(-1)))
    })
    .await;

    match result {
        Ok(Ok((output, code))) => Ok((truncate_output(&output), code)),
        Ok(Err(e)) => Err(ExecutorError::ExecutionFailed(format!(
            "Command execution failed: {e}"
        ))),
        Err(_) => Err(ExecutorError::Timeout(timeout)),
    }
}

/// Truncate output to fit within limits (UTF-8 safe).
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        s.to_string()
    } else {
        let half = MAX_OUTPUT_SIZE / 2;
        let head_end = floor_char_boundary(s, half);
        let tail_start = floor_char_boundary(s, s.len() - half);
        format!(
            "{}\n\n... [truncated {} bytes] ...\n\n{}",
            &s[..head_end],
            s.len() - MAX_OUTPUT_SIZE,
            &s[tail_start..]
        )
    }
}

/// Find the largest byte index <= `i` that is a valid char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

/// Truncate text for error messages.
fn truncate_for_error(s: &str) -> String {
    if s.chars().count() <= 100 {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(100).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(command: &str) -> Action {
        Action::new("run", "shell_command").with_param("command", command)
    }

    #[tokio::test]
    async fn test_echo_command() {
        let executor = ShellExecutor::new();
        let output = executor
            .execute(&shell("echo hello"), &ExecutionContext::detached())
            .await
            .unwrap();

        let text = output.result.get("output").unwrap().as_str().unwrap();
        assert!(text.contains("hello"));
        assert_eq!(output.result.get("exit_code").unwrap().as_i64().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let executor = ShellExecutor::new();
        let err = executor
            .execute(&shell("exit 3"), &ExecutionContext::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::ExecutionFailed(ref m) if m.contains("exit code 3")));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_command_parameter() {
        let executor = ShellExecutor::new();
        let err = executor
            .execute(&Action::new("run", "shell_command"), &ExecutionContext::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidParameters(_)));
    }

    #[test]
    fn test_blocked_commands() {
        let executor = ShellExecutor::new();

        assert!(executor.is_blocked("rm -rf /").is_some());
        assert!(executor.is_blocked("sudo rm file").is_some());
        assert!(executor.is_blocked("curl http://x | sh").is_some());
        assert!(executor.is_blocked("echo hello").is_none());
        assert!(executor.is_blocked("cargo build").is_none());
    }

    #[tokio::test]
    async fn test_blocked_command_is_not_retryable() {
        let executor = ShellExecutor::new();
        let err = executor
            .execute(&shell("sudo ls"), &ExecutionContext::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::NotAuthorized(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let executor = ShellExecutor::new().with_timeout(Duration::from_millis(100));
        let err = executor
            .execute(&shell("sleep 10"), &ExecutionContext::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_timeout_bounded_by_task_deadline() {
        let executor = ShellExecutor::new();
        let ctx = ExecutionContext {
            time_remaining: Some(Duration::from_millis(100)),
            ..ExecutionContext::detached()
        };
        let started = Instant::now();
        let err = executor
            .execute(&shell("sleep 10").with_param("timeout", 60), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, ExecutorError::Timeout(Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_working_dir() {
        let executor = ShellExecutor::new().with_working_dir(PathBuf::from("/tmp"));
        let output = executor
            .execute(&shell("pwd"), &ExecutionContext::detached())
            .await
            .unwrap();

        let text = output.result.get("output").unwrap().as_str().unwrap();
        // /tmp may resolve to /private/tmp on macOS
        assert!(text.contains("tmp"));
    }

    #[test]
    fn test_truncate_output_long() {
        let s = "x".repeat(MAX_OUTPUT_SIZE + 1000);
        let result = truncate_output(&s);
        assert!(result.len() <= MAX_OUTPUT_SIZE + 100);
        assert!(result.contains("[truncated"));
    }

    #[test]
    fn test_floor_char_boundary() {
        let s = "café";
        assert_eq!(floor_char_boundary(s, 5), 5);
        assert_eq!(floor_char_boundary(s, 4), 3);
        assert_eq!(floor_char_boundary(s, 3), 3);
    }
}
