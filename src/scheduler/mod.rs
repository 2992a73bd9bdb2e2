//! Task scheduler: admission, priority dispatch, bounded concurrency and
//! cooperative pause/resume/cancel.
//!
//! One dispatcher task pops the highest-priority entry whose dependencies
//! have settled whenever a worker slot is free and hands it to a worker. Control requests post a signal
//! that the worker honors at its next checkpoint; they never interrupt an
//! executor call.

pub mod events;
mod metrics;
mod queue;
mod retry;
mod table;
mod worker;

pub use events::{EventKind, SchedulerEvent};
pub use metrics::{ComponentHealth, HealthReport, SchedulerMetrics};

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{Mutex, Notify, Semaphore, broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{ConfigError, SchedulerError};
use crate::executor::ActionRegistry;
use crate::scheduler::metrics::MetricsRecorder;
use crate::scheduler::queue::{QueueEntry, RunQueue};
use crate::scheduler::retry::BackoffPolicy;
use crate::scheduler::table::{ControlSignal, TaskTable};
use crate::store::TaskStore;
use crate::task::{StateTransition, Task, TaskSnapshot, TaskStatus};

/// State shared by the scheduler front end, the dispatcher and workers.
///
/// Lock order: `queue` before `table`.
pub(crate) struct Shared {
    pub config: SchedulerConfig,
    pub registry: Arc<ActionRegistry>,
    pub store: Arc<dyn TaskStore>,
    pub table: TaskTable,
    pub queue: Mutex<RunQueue>,
    pub queue_notify: Notify,
    pub events: broadcast::Sender<SchedulerEvent>,
    pub backoff: BackoffPolicy,
    pub metrics: MetricsRecorder,
}

impl Shared {
    pub fn emit(&self, task_id: Uuid, kind: EventKind, detail: serde_json::Value) {
        // No subscribers is fine.
        let _ = self.events.send(SchedulerEvent::new(task_id, kind, detail));
    }

    /// Save the current record, retrying with backoff. On final failure the
    /// task is flagged for reconciliation and keeps its in-memory state.
    pub async fn persist(&self, id: Uuid) -> Result<(), SchedulerError> {
        let Some(task) = self.table.get(id).await else {
            return Err(SchedulerError::TaskNotFound { id });
        };

        let attempts = self.config.persist_retries.saturating_add(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.store.save(&task).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(task_id = %id, attempt, "Store write failed: {}", e);
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.backoff.delay(attempt)).await;
                    }
                }
            }
        }

        let err = SchedulerError::PersistenceFailure {
            id,
            attempts,
            reason: last_error,
        };
        tracing::warn!(task_id = %id, "{}", err);
        let _ = self
            .table
            .update(id, |e| e.task.needs_reconciliation = true)
            .await;
        Err(err)
    }

    /// Status of any task this scheduler knows of, admitted or stored.
    pub async fn task_status(&self, id: Uuid) -> Option<TaskStatus> {
        if let Some(status) = self.table.status(id).await {
            return Some(status);
        }
        match self.store.load(id).await {
            Ok(task) => task.map(|t| t.status),
            Err(e) => {
                tracing::warn!(task_id = %id, "Could not load task status: {}", e);
                None
            }
        }
    }

    /// Pop the best entry whose dependencies have all settled. Entries
    /// still waiting on an admitted, unfinished task go back untouched.
    async fn next_ready(&self) -> Option<QueueEntry> {
        let mut queue = self.queue.lock().await;
        let mut blocked = Vec::new();
        let mut ready = None;
        while let Some(entry) = queue.pop() {
            if self.dependencies_settled(entry.task_id).await {
                ready = Some(entry);
                break;
            }
            blocked.push(entry);
        }
        for entry in blocked {
            queue.push(entry);
        }
        ready
    }

    async fn dependencies_settled(&self, id: Uuid) -> bool {
        for dep in self.table.dependencies(id).await {
            if let Some(status) = self.table.status(dep).await {
                if !status.is_terminal() {
                    return false;
                }
            }
        }
        true
    }

    /// Claim a popped task for a worker. Pending tasks move to running;
    /// resumed tasks already are. Anything else was paused or cancelled
    /// while queued and is skipped.
    async fn begin_run(&self, id: Uuid) -> bool {
        self.table
            .update(id, |e| {
                match e.task.status {
                    TaskStatus::Pending => {
                        if e.task
                            .transition_to(TaskStatus::Running, Some("dispatched".to_string()))
                            .is_err()
                        {
                            return false;
                        }
                    }
                    TaskStatus::Running => {}
                    _ => return false,
                }
                e.in_worker = true;
                true
            })
            .await
            .unwrap_or(false)
    }
}

enum DispatcherState {
    Idle,
    Running(JoinHandle<()>),
    Stopped,
}

/// Priority scheduler over an [`ActionRegistry`] and a [`TaskStore`].
pub struct Scheduler {
    shared: Arc<Shared>,
    slots: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Mutex<DispatcherState>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Scheduler {
    /// Create a scheduler. Nothing is dispatched until [`Scheduler::start`].
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<ActionRegistry>,
        store: Arc<dyn TaskStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        let slots = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        let shared = Arc::new(Shared {
            queue: Mutex::new(RunQueue::new(config.queue_capacity)),
            backoff: BackoffPolicy::from_config(&config),
            config,
            registry,
            store,
            table: TaskTable::new(),
            queue_notify: Notify::new(),
            events,
            metrics: MetricsRecorder::new(),
        });

        Ok(Self {
            shared,
            slots,
            shutdown_tx,
            dispatcher: Mutex::new(DispatcherState::Idle),
            workers: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Re-admit pending tasks from the store and start dispatching.
    /// Returns the number of recovered tasks.
    pub async fn start(&self) -> Result<usize, SchedulerError> {
        let mut dispatcher = self.dispatcher.lock().await;
        if !matches!(*dispatcher, DispatcherState::Idle) {
            return Err(SchedulerError::AlreadyStarted);
        }

        let pending = self
            .shared
            .store
            .list_pending(self.shared.config.queue_capacity)
            .await?;
        let mut recovered = 0;
        for task in pending {
            if self.shared.table.contains(task.id).await {
                continue;
            }
            let id = task.id;
            match self.admit(task).await {
                Ok(_) => recovered += 1,
                Err(e) => tracing::warn!(task_id = %id, "Could not re-admit stored task: {}", e),
            }
        }

        let handle = tokio::spawn(dispatch_loop(
            Arc::clone(&self.shared),
            Arc::clone(&self.slots),
            Arc::clone(&self.workers),
            self.shutdown_tx.subscribe(),
        ));
        *dispatcher = DispatcherState::Running(handle);

        tracing::info!(
            max_concurrent = self.shared.config.max_concurrent_tasks,
            recovered,
            "Scheduler started"
        );
        Ok(recovered)
    }

    /// Stop dispatching and wait for in-flight workers to release their
    /// tasks. Queued tasks stay pending in the store.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.shared.queue_notify.notify_waiters();

        let previous = std::mem::replace(
            &mut *self.dispatcher.lock().await,
            DispatcherState::Stopped,
        );
        if let DispatcherState::Running(handle) = previous {
            if let Err(e) = handle.await {
                tracing::error!("Dispatcher ended abnormally: {}", e);
            }
        }

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().await);
        let in_flight = workers.len();
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                tracing::error!("Worker ended abnormally: {}", e);
            }
        }

        tracing::info!(in_flight, queued = self.queued_len().await, "Scheduler stopped");
    }

    /// Admit a new task into the run queue.
    pub async fn submit(&self, task: Task) -> Result<Uuid, SchedulerError> {
        if *self.shutdown_tx.borrow() {
            return Err(SchedulerError::ShuttingDown);
        }
        if task.actions.is_empty() {
            return Err(SchedulerError::InvalidTask {
                reason: "task has no actions".to_string(),
            });
        }
        if task.status != TaskStatus::Pending {
            return Err(SchedulerError::InvalidTask {
                reason: format!("task must be pending, not {}", task.status),
            });
        }
        for &dep in &task.dependencies {
            if dep == task.id {
                return Err(SchedulerError::InvalidTask {
                    reason: "task cannot depend on itself".to_string(),
                });
            }
            // Dependencies must already exist, which also rules out cycles.
            if self.shared.task_status(dep).await.is_none() {
                return Err(SchedulerError::InvalidTask {
                    reason: format!("unknown dependency {dep}"),
                });
            }
        }
        self.admit(task).await
    }

    async fn admit(&self, task: Task) -> Result<Uuid, SchedulerError> {
        let id = task.id;
        let priority = task.priority;
        let name = task.name.clone();
        {
            let mut queue = self.shared.queue.lock().await;
            let seq = queue.reserve()?;
            self.shared.table.insert(task, seq).await?;
            queue.push(QueueEntry {
                priority,
                seq,
                task_id: id,
            });
        }
        self.shared.queue_notify.notify_one();

        tracing::info!(task_id = %id, name = %name, priority = %priority, "Task admitted");
        self.shared
            .emit(id, EventKind::Admitted, json!({ "priority": priority }));
        let _ = self.shared.persist(id).await;
        Ok(id)
    }

    /// Ask a running task to pause at its next checkpoint.
    pub async fn request_pause(&self, id: Uuid) -> Result<(), SchedulerError> {
        if !self.shared.table.contains(id).await {
            return Err(self.not_admitted(id, TaskStatus::Paused).await);
        }

        let mut queue = self.shared.queue.lock().await;
        let paused_in_queue = self
            .shared
            .table
            .update(id, |e| -> Result<bool, SchedulerError> {
                match e.task.status {
                    TaskStatus::Running if e.signal == Some(ControlSignal::Cancel) => {
                        Err(invalid(id, TaskStatus::Running, TaskStatus::Paused))
                    }
                    TaskStatus::Running if !e.in_worker => {
                        // Resumed but not yet dispatched: no worker to signal.
                        e.task
                            .transition_to(TaskStatus::Paused, Some("paused while queued".into()))
                            .map_err(|t| invalid(id, t.from, t.to))?;
                        Ok(true)
                    }
                    TaskStatus::Running => {
                        e.signal = Some(ControlSignal::Pause);
                        e.wake.notify_one();
                        Ok(false)
                    }
                    other => Err(invalid(id, other, TaskStatus::Paused)),
                }
            })
            .await??;

        if paused_in_queue {
            queue.remove(id);
            drop(queue);
            self.shared
                .emit(id, EventKind::Paused, json!({ "status": TaskStatus::Paused }));
            let _ = self.shared.persist(id).await;
        }
        tracing::info!(task_id = %id, "Pause requested");
        Ok(())
    }

    /// Re-queue a paused task at its original priority and position.
    pub async fn request_resume(&self, id: Uuid) -> Result<(), SchedulerError> {
        if !self.shared.table.contains(id).await {
            return Err(self.not_admitted(id, TaskStatus::Running).await);
        }

        {
            let mut queue = self.shared.queue.lock().await;
            let entry = self
                .shared
                .table
                .update(id, |e| -> Result<QueueEntry, SchedulerError> {
                    if e.task.status != TaskStatus::Paused {
                        return Err(invalid(id, e.task.status, TaskStatus::Running));
                    }
                    e.task
                        .transition_to(TaskStatus::Running, Some("resumed".to_string()))
                        .map_err(|t| invalid(id, t.from, t.to))?;
                    e.signal = None;
                    Ok(QueueEntry {
                        priority: e.task.priority,
                        seq: e.seq,
                        task_id: id,
                    })
                })
                .await??;
            queue.push(entry);
        }
        self.shared.queue_notify.notify_one();

        tracing::info!(task_id = %id, "Task resumed");
        self.shared.emit(id, EventKind::Resumed, json!({}));
        let _ = self.shared.persist(id).await;
        Ok(())
    }

    /// Cancel a running or paused task. A worker, if any, stops at its next
    /// checkpoint and discards the in-flight attempt's result.
    pub async fn request_cancel(&self, id: Uuid) -> Result<(), SchedulerError> {
        if !self.shared.table.contains(id).await {
            return Err(self.not_admitted(id, TaskStatus::Cancelled).await);
        }

        let mut queue = self.shared.queue.lock().await;
        let cancelled_now = self
            .shared
            .table
            .update(id, |e| -> Result<bool, SchedulerError> {
                match e.task.status {
                    TaskStatus::Running if e.in_worker => {
                        e.signal = Some(ControlSignal::Cancel);
                        e.wake.notify_one();
                        Ok(false)
                    }
                    TaskStatus::Running | TaskStatus::Paused => {
                        let from = e.task.next_action;
                        e.task.skip_remaining(from);
                        e.task
                            .transition_to(TaskStatus::Cancelled, Some("cancelled".to_string()))
                            .map_err(|t| invalid(id, t.from, t.to))?;
                        e.signal = None;
                        self.shared
                            .metrics
                            .record(TaskStatus::Cancelled, e.task.active_time);
                        Ok(true)
                    }
                    other => Err(invalid(id, other, TaskStatus::Cancelled)),
                }
            })
            .await??;

        if cancelled_now {
            queue.remove(id);
            drop(queue);
            self.shared.queue_notify.notify_one();
            tracing::info!(task_id = %id, "Task cancelled");
            let _ = self.shared.persist(id).await;
            self.shared.emit(
                id,
                EventKind::Terminal,
                json!({ "status": TaskStatus::Cancelled, "reason": "cancelled" }),
            );
        } else {
            tracing::info!(task_id = %id, "Cancel requested");
        }
        Ok(())
    }

    /// Snapshot of a task, from memory or, failing that, the store.
    pub async fn get_status(&self, id: Uuid) -> Result<TaskSnapshot, SchedulerError> {
        self.get_task(id).await.map(|t| TaskSnapshot::from(&t))
    }

    /// Full task record.
    pub async fn get_task(&self, id: Uuid) -> Result<Task, SchedulerError> {
        if let Some(task) = self.shared.table.get(id).await {
            return Ok(task);
        }
        self.shared
            .store
            .load(id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id })
    }

    pub async fn get_history(&self, id: Uuid) -> Result<Vec<StateTransition>, SchedulerError> {
        self.get_task(id).await.map(|t| t.history)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.shared.events.subscribe()
    }

    /// Count of admitted tasks per status.
    pub async fn summary(&self) -> HashMap<TaskStatus, usize> {
        self.shared.table.summary().await
    }

    /// Tasks currently held by a worker.
    pub async fn running_tasks(&self) -> Vec<Uuid> {
        self.shared.table.in_worker().await
    }

    /// Tasks waiting in the run queue.
    pub async fn queued_len(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    /// Throughput counters since the scheduler was created.
    pub async fn metrics(&self) -> SchedulerMetrics {
        let running = self.shared.table.in_worker().await.len();
        let queued = self.queued_len().await;
        self.shared
            .metrics
            .snapshot(self.shared.registry.count().await, running, queued)
    }

    /// Check the store, the executor registry and the dispatcher.
    pub async fn health_check(&self) -> HealthReport {
        let store = match self.shared.store.health_check().await {
            Ok(()) => ComponentHealth::ok("store reachable"),
            Err(e) => ComponentHealth::failing(e.to_string()),
        };

        let executors = match self.shared.registry.count().await {
            0 => ComponentHealth::failing("no executors registered"),
            n => ComponentHealth::ok(format!("{n} executors registered")),
        };

        let dispatcher = match &*self.dispatcher.lock().await {
            DispatcherState::Idle => ComponentHealth::failing("not started"),
            DispatcherState::Running(handle) if handle.is_finished() => {
                ComponentHealth::failing("dispatcher exited")
            }
            DispatcherState::Running(_) => ComponentHealth::ok("dispatching"),
            DispatcherState::Stopped => ComponentHealth::failing("shut down"),
        };

        let report = HealthReport::new(store, executors, dispatcher);
        if !report.healthy {
            tracing::warn!(?report, "Scheduler unhealthy");
        }
        report
    }

    /// Control request for a task this scheduler never admitted.
    async fn not_admitted(&self, id: Uuid, to: TaskStatus) -> SchedulerError {
        match self.shared.store.load(id).await {
            Ok(Some(task)) => invalid(id, task.status, to),
            _ => SchedulerError::TaskNotFound { id },
        }
    }
}

fn invalid(id: Uuid, from: TaskStatus, to: TaskStatus) -> SchedulerError {
    SchedulerError::InvalidTransition { id, from, to }
}

/// Pop tasks whenever a worker slot is free until shutdown.
async fn dispatch_loop(
    shared: Arc<Shared>,
    slots: Arc<Semaphore>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let entry = loop {
            let notified = shared.queue_notify.notified();
            if let Some(entry) = shared.next_ready().await {
                break Some(entry);
            }
            if *shutdown.borrow() {
                break None;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => break None,
                _ = notified => {}
            }
        };
        let Some(entry) = entry else {
            break;
        };

        if !shared.begin_run(entry.task_id).await {
            tracing::debug!(task_id = %entry.task_id, "Skipping task no longer runnable");
            continue;
        }

        let handle = tokio::spawn(worker::run_task(
            Arc::clone(&shared),
            entry.task_id,
            permit,
        ));
        let mut workers = workers.lock().await;
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
    }
    tracing::debug!("Dispatcher stopped");
}
