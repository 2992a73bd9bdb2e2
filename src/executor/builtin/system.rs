//! System-check executor: read-only probes of the local host.
//!
//! Supported `check_type` values: `disk`, `memory`, `cpu`, `network`,
//! `general`. Optional thresholds (`max_disk_percent`,
//! `max_memory_percent`) turn a probe into a pass/fail check.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ExecutorError;
use crate::executor::builtin::shell::run_command;
use crate::executor::{ActionOutput, ExecutionContext, Executor};
use crate::task::Action;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Executor for `system_check` actions.
#[derive(Debug, Default)]
pub struct SystemCheckExecutor;

impl SystemCheckExecutor {
    pub fn new() -> Self {
        Self
    }

    async fn check_disk(&self, path: &str, timeout: Duration) -> Result<Value, ExecutorError> {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let (output, code) = run_command(&format!("df -Pk {path}"), &cwd, timeout).await?;
        if code != 0 {
            return Err(ExecutorError::ExecutionFailed(format!(
                "df exited with {code}: {output}"
            )));
        }
        parse_df(&output).ok_or_else(|| {
            ExecutorError::ExecutionFailed(format!("unrecognized df output: {output}"))
        })
    }

    async fn check_memory(&self, timeout: Duration) -> Result<Value, ExecutorError> {
        match tokio::fs::read_to_string("/proc/meminfo").await {
            Ok(raw) => parse_meminfo(&raw).ok_or_else(|| {
                ExecutorError::ExecutionFailed("unrecognized /proc/meminfo format".to_string())
            }),
            Err(_) => {
                let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
                let (output, _) = run_command("vm_stat", &cwd, timeout).await?;
                Ok(json!({ "raw": output }))
            }
        }
    }

    async fn check_cpu(&self) -> Result<Value, ExecutorError> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let load = match tokio::fs::read_to_string("/proc/loadavg").await {
            Ok(raw) => parse_loadavg(&raw),
            Err(_) => None,
        };

        Ok(json!({
            "cores": cores,
            "load_average": load,
        }))
    }

    async fn check_network(
        &self,
        target: Option<&str>,
        timeout: Duration,
    ) -> Result<Value, ExecutorError> {
        let loopback = tokio::net::TcpListener::bind("127.0.0.1:0").await.is_ok();

        let reachable = match target {
            Some(addr) => {
                let connect = tokio::net::TcpStream::connect(addr);
                Some(matches!(
                    tokio::time::timeout(timeout, connect).await,
                    Ok(Ok(_))
                ))
            }
            None => None,
        };

        if reachable == Some(false) {
            return Err(ExecutorError::ExecutionFailed(format!(
                "target {} unreachable",
                target.unwrap_or_default()
            )));
        }

        Ok(json!({
            "loopback": loopback,
            "target": target,
            "reachable": reachable,
        }))
    }
}

#[async_trait]
impl Executor for SystemCheckExecutor {
    fn name(&self) -> &str {
        "system_check"
    }

    fn description(&self) -> &str {
        "Probe disk, memory, CPU or network state of the local host."
    }

    async fn execute(
        &self,
        action: &Action,
        ctx: &ExecutionContext,
    ) -> Result<ActionOutput, ExecutorError> {
        let start = Instant::now();
        let check_type = action.param_str("check_type").unwrap_or("general");
        let path = action.param_str("path").unwrap_or(".");
        let probe = ctx.bounded(PROBE_TIMEOUT);
        let connect = ctx.bounded(CONNECT_TIMEOUT);

        let report = match check_type {
            "disk" => json!({ "disk": self.check_disk(path, probe).await? }),
            "memory" => json!({ "memory": self.check_memory(probe).await? }),
            "cpu" => json!({ "cpu": self.check_cpu().await? }),
            "network" => json!({
                "network": self.check_network(action.param_str("target"), connect).await?
            }),
            "general" => json!({
                "disk": self.check_disk(path, probe).await?,
                "memory": self.check_memory(probe).await?,
                "cpu": self.check_cpu().await?,
            }),
            other => {
                return Err(ExecutorError::InvalidParameters(format!(
                    "unknown check_type '{other}'"
                )));
            }
        };

        enforce_threshold(action, &report, "max_disk_percent", "/disk/used_percent")?;
        enforce_threshold(action, &report, "max_memory_percent", "/memory/used_percent")?;

        Ok(ActionOutput::success(
            json!({ "check_type": check_type, "report": report }),
            start.elapsed(),
        ))
    }
}

/// Fail the attempt when a reported percentage is above the action's limit.
fn enforce_threshold(
    action: &Action,
    report: &Value,
    param: &str,
    pointer: &str,
) -> Result<(), ExecutorError> {
    let Some(limit) = action.parameters.get(param).and_then(Value::as_f64) else {
        return Ok(());
    };
    match report.pointer(pointer).and_then(Value::as_f64) {
        Some(used) if used > limit => Err(ExecutorError::ExecutionFailed(format!(
            "{pointer} at {used:.1}% exceeds {param} {limit:.1}%"
        ))),
        _ => Ok(()),
    }
}

/// Parse POSIX `df -Pk` output (header plus one data line).
fn parse_df(output: &str) -> Option<Value> {
    let line = output.lines().nth(1)?;
    let cols: Vec<&str> = line.split_whitespace().collect();
    if cols.len() < 6 {
        return None;
    }
    let total_kb: u64 = cols[1].parse().ok()?;
    let used_kb: u64 = cols[2].parse().ok()?;
    let available_kb: u64 = cols[3].parse().ok()?;
    let used_percent = if total_kb > 0 {
        used_kb as f64 * 100.0 / total_kb as f64
    } else {
        0.0
    };
    Some(json!({
        "filesystem": cols[0],
        "mount": cols[5],
        "total_kb": total_kb,
        "used_kb": used_kb,
        "available_kb": available_kb,
        "used_percent": used_percent,
    }))
}

fn parse_meminfo(raw: &str) -> Option<Value> {
    let field = |name: &str| -> Option<u64> {
        raw.lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total_kb = field("MemTotal:")?;
    let available_kb = field("MemAvailable:").or_else(|| field("MemFree:"))?;
    let used_percent = if total_kb > 0 {
        (total_kb - available_kb.min(total_kb)) as f64 * 100.0 / total_kb as f64
    } else {
        0.0
    };
    Some(json!({
        "total_kb": total_kb,
        "available_kb": available_kb,
        "used_percent": used_percent,
    }))
}

fn parse_loadavg(raw: &str) -> Option<[f64; 3]> {
    let mut parts = raw.split_whitespace().map(|p| p.parse::<f64>().ok());
    Some([parts.next()??, parts.next()??, parts.next()??])
}
