use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use task_orchestrator::executor::builtin::{self, LlmConfig};
use task_orchestrator::store::{FileTaskStore, InMemoryTaskStore};
use task_orchestrator::{ActionRegistry, Scheduler, SchedulerConfig, Task, TaskSnapshot, TaskStore};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing();

    let Some(tasks_path) = std::env::args().nth(1) else {
        eprintln!("Usage: task-orchestrator <tasks.json>");
        eprintln!("  tasks.json holds a JSON array of task definitions.");
        std::process::exit(2);
    };

    let config = SchedulerConfig::from_env().context("invalid scheduler configuration")?;
    let llm_config = LlmConfig::from_env().context("invalid LLM configuration")?;

    eprintln!("Task orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Workers: {}", config.max_concurrent_tasks);
    eprintln!("   Queue capacity: {}", config.queue_capacity);

    // ── Registry ────────────────────────────────────────────────────────
    let registry = Arc::new(ActionRegistry::new());
    builtin::register_defaults(&registry, &llm_config).await?;

    // ── Store ───────────────────────────────────────────────────────────
    let store: Arc<dyn TaskStore> = match std::env::var("ORCH_STORE_DIR") {
        Ok(dir) => {
            eprintln!("   Store: {dir}");
            Arc::new(
                FileTaskStore::open(&dir)
                    .await
                    .with_context(|| format!("failed to open task store at {dir}"))?,
            )
        }
        Err(_) => {
            eprintln!("   Store: in-memory");
            Arc::new(InMemoryTaskStore::new())
        }
    };
    store.health_check().await.context("task store is not usable")?;

    // ── Tasks ───────────────────────────────────────────────────────────
    let raw = tokio::fs::read_to_string(&tasks_path)
        .await
        .with_context(|| format!("failed to read {tasks_path}"))?;
    let tasks: Vec<Task> =
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {tasks_path}"))?;

    // ── Scheduler ───────────────────────────────────────────────────────
    let scheduler = Scheduler::new(config, registry, store)?;

    let mut events = scheduler.subscribe();
    let event_logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::info!(
                    task_id = %event.task_id,
                    kind = ?event.kind,
                    detail = %event.detail,
                    "event"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event log skipped {} events", n)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let recovered = scheduler.start().await?;
    if recovered > 0 {
        eprintln!("   Recovered {recovered} pending tasks from the store");
    }
    let health = scheduler.health_check().await;
    if !health.healthy {
        eprintln!("   Scheduler unhealthy: {}", serde_json::to_string(&health)?);
    }

    let mut ids = Vec::with_capacity(tasks.len());
    for task in tasks {
        let name = task.name.clone();
        match scheduler.submit(task).await {
            Ok(id) => ids.push(id),
            Err(e) => tracing::error!(name = %name, "Rejected task: {}", e),
        }
    }

    // Wait until every submitted task is terminal, or Ctrl-C.
    let wait_all = async {
        loop {
            let mut done = true;
            for id in &ids {
                if !scheduler.get_status(*id).await?.status.is_terminal() {
                    done = false;
                    break;
                }
            }
            if done {
                return Ok::<_, anyhow::Error>(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };
    tokio::select! {
        result = wait_all => result?,
        _ = tokio::signal::ctrl_c() => eprintln!("Interrupted, shutting down"),
    }

    scheduler.shutdown().await;

    let mut snapshots: Vec<TaskSnapshot> = Vec::with_capacity(ids.len());
    for id in &ids {
        snapshots.push(scheduler.get_status(*id).await?);
    }
    println!("{}", serde_json::to_string_pretty(&snapshots)?);

    let metrics = scheduler.metrics().await;
    eprintln!(
        "   {} tasks processed, {:.0}% succeeded, {:.2}s average",
        metrics.tasks_processed, metrics.success_rate, metrics.average_execution_secs
    );

    drop(scheduler);
    event_logger.abort();
    Ok(())
}

/// Console logging filtered by `RUST_LOG` (default `info`), plus a daily
/// rolling file under `ORCH_LOG_DIR` when set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match std::env::var("ORCH_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "orchestrator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter())
                .with(console)
                .with(file)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry()
                .with(filter())
                .with(console)
                .init();
            None
        }
    }
}
