//! Throughput counters and the health report.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::task::TaskStatus;

/// Point-in-time performance figures for a scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    /// Tasks that reached a terminal state.
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    /// Percentage of processed tasks that completed.
    pub success_rate: f64,
    /// Mean active (unpaused) time of processed tasks, in seconds.
    pub average_execution_secs: f64,
    pub uptime_secs: f64,
    pub executors: usize,
    pub running: usize,
    pub queued: usize,
}

/// Lock-free counters fed by the terminal path of every task.
pub(crate) struct MetricsRecorder {
    started: Instant,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    active_micros: AtomicU64,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            active_micros: AtomicU64::new(0),
        }
    }

    pub fn record(&self, status: TaskStatus, active_time: Duration) {
        let counter = match status {
            TaskStatus::Completed => &self.succeeded,
            TaskStatus::Failed => &self.failed,
            TaskStatus::Cancelled => &self.cancelled,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(active_time.as_micros()).unwrap_or(u64::MAX);
        self.active_micros
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
                Some(total.saturating_add(micros))
            })
            .ok();
    }

    pub fn snapshot(&self, executors: usize, running: usize, queued: usize) -> SchedulerMetrics {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let cancelled = self.cancelled.load(Ordering::Relaxed);
        let processed = succeeded + failed + cancelled;

        let (success_rate, average_execution_secs) = if processed == 0 {
            (0.0, 0.0)
        } else {
            let active = self.active_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            (
                succeeded as f64 / processed as f64 * 100.0,
                active / processed as f64,
            )
        };

        SchedulerMetrics {
            tasks_processed: processed,
            tasks_succeeded: succeeded,
            tasks_failed: failed,
            tasks_cancelled: cancelled,
            success_rate,
            average_execution_secs,
            uptime_secs: self.started.elapsed().as_secs_f64(),
            executors,
            running,
            queued,
        }
    }
}

/// Result of checking one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub detail: String,
}

impl ComponentHealth {
    pub(crate) fn ok(detail: impl Into<String>) -> Self {
        Self {
            healthy: true,
            detail: detail.into(),
        }
    }

    pub(crate) fn failing(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: detail.into(),
        }
    }
}

/// Combined health of the store, the executor registry and the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub store: ComponentHealth,
    pub executors: ComponentHealth,
    pub dispatcher: ComponentHealth,
}

impl HealthReport {
    pub(crate) fn new(
        store: ComponentHealth,
        executors: ComponentHealth,
        dispatcher: ComponentHealth,
    ) -> Self {
        Self {
            healthy: store.healthy && executors.healthy && dispatcher.healthy,
            store,
            executors,
            dispatcher,
        }
    }
}
