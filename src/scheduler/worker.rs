//! Task worker: runs one task's actions in order until it finishes,
//! fails, is cancelled or pauses.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::json;
use tokio::sync::{Notify, OwnedSemaphorePermit};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::ExecutorError;
use crate::executor::{ExecutionContext, Executor};
use crate::scheduler::Shared;
use crate::scheduler::events::EventKind;
use crate::scheduler::retry::allowed_attempts;
use crate::scheduler::table::ControlSignal;
use crate::task::{
    Action, ActionResult, ActionStatus, Task, TaskError, TaskErrorKind, TaskStatus, TaskType,
    TransitionError,
};

/// Deadline used when a task's budget does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// How a run segment ended.
#[derive(Debug)]
enum Outcome {
    Completed,
    Failed(TaskError),
    Cancelled,
    Paused,
}

impl Outcome {
    fn status_and_reason(&self) -> (TaskStatus, String) {
        match self {
            Self::Completed => (TaskStatus::Completed, "all actions succeeded".to_string()),
            Self::Failed(err) => (TaskStatus::Failed, err.message.clone()),
            Self::Cancelled => (TaskStatus::Cancelled, "cancelled".to_string()),
            Self::Paused => (TaskStatus::Paused, "paused".to_string()),
        }
    }
}

/// What a checkpoint found, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    TimedOut,
    Cancel,
    Pause,
}

/// Drive a dispatched task. Holds its worker slot until the record is released.
pub(crate) async fn run_task(shared: Arc<Shared>, task_id: Uuid, permit: OwnedSemaphorePermit) {
    let Some(task) = shared.table.get(task_id).await else {
        tracing::error!(task_id = %task_id, "Dispatched task missing from table");
        return;
    };
    let Some(wake) = shared.table.wake_handle(task_id).await else {
        return;
    };

    let worker = Worker::new(Arc::clone(&shared), &task, wake);
    shared.emit(
        task_id,
        EventKind::Started,
        json!({
            "next_action": task.next_action,
            "resumed": task.history.iter().any(|t| t.from == TaskStatus::Paused),
        }),
    );
    tracing::info!(
        task_id = %task_id,
        name = %task.name,
        priority = %task.priority,
        "Task started"
    );

    let outcome = AssertUnwindSafe(worker.run())
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            tracing::error!(task_id = %task_id, "Worker panicked");
            Outcome::Failed(TaskError::new(
                TaskErrorKind::ExecutorFailure,
                "worker panicked",
            ))
        });
    worker.finish(outcome).await;
    drop(permit);
}

struct Worker {
    shared: Arc<Shared>,
    task_id: Uuid,
    task_name: String,
    task_type: TaskType,
    timeout: Duration,
    segment_start: Instant,
    deadline: Instant,
    wake: Arc<Notify>,
}

impl Worker {
    fn new(shared: Arc<Shared>, task: &Task, wake: Arc<Notify>) -> Self {
        let timeout = task.timeout.unwrap_or(shared.config.task_timeout);
        let now = Instant::now();
        // Time spent before a pause counts against the same budget.
        let budget = timeout.saturating_sub(task.active_time);
        let deadline = now
            .checked_add(budget)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        Self {
            shared,
            task_id: task.id,
            task_name: task.name.clone(),
            task_type: task.task_type,
            timeout,
            segment_start: now,
            deadline,
            wake,
        }
    }

    async fn run(&self) -> Outcome {
        if let Some(err) = self.unmet_dependency().await {
            return Outcome::Failed(err);
        }

        loop {
            let next = self
                .shared
                .table
                .update(self.task_id, |e| {
                    let index = e.task.next_action;
                    e.task.actions.get(index).cloned().map(|a| (index, a))
                })
                .await;

            let (index, action) = match next {
                Ok(Some(next)) => next,
                Ok(None) => return Outcome::Completed,
                Err(e) => {
                    tracing::error!(task_id = %self.task_id, "Lost task record: {}", e);
                    return Outcome::Cancelled;
                }
            };

            match self.checkpoint().await {
                Some(Interrupt::TimedOut) => return Outcome::Failed(self.timeout_error(index)),
                Some(Interrupt::Cancel) => return Outcome::Cancelled,
                Some(Interrupt::Pause) => return Outcome::Paused,
                None => {}
            }

            if let Some(outcome) = self.run_action(index, action).await {
                return outcome;
            }
        }
    }

    /// The dispatcher only hands over tasks whose dependencies have settled;
    /// any that did not complete fail this task.
    async fn unmet_dependency(&self) -> Option<TaskError> {
        for dep in self.shared.table.dependencies(self.task_id).await {
            let problem = match self.shared.task_status(dep).await {
                Some(TaskStatus::Completed) => continue,
                Some(status) => format!("dependency {dep} is {status}"),
                None => format!("dependency {dep} not found"),
            };
            tracing::warn!(task_id = %self.task_id, dependency = %dep, "{}", problem);
            return Some(TaskError::new(TaskErrorKind::DependencyFailed, problem));
        }
        None
    }

    /// Run one action through its retry budget. `None` means it succeeded
    /// and the task moves on to the next action.
    async fn run_action(&self, index: usize, action: Action) -> Option<Outcome> {
        let executor = match self.shared.registry.resolve(&action.action_type).await {
            Ok(executor) => executor,
            Err(e) => {
                let message = e.to_string();
                tracing::error!(
                    task_id = %self.task_id,
                    action = %action.name,
                    "{}",
                    message
                );
                self.update_action(index, |a| {
                    a.status = ActionStatus::Failed;
                    a.error = Some(message.clone());
                })
                .await;
                return Some(Outcome::Failed(
                    TaskError::new(TaskErrorKind::UnknownActionType, message).at_action(index),
                ));
            }
        };

        let max_retries = action.max_retries.unwrap_or(self.shared.config.max_retries);

        loop {
            let attempt = self
                .update_action(index, |a| {
                    a.status = ActionStatus::Running;
                    a.attempt_count += 1;
                    a.attempt_count
                })
                .await
                .unwrap_or(1);

            self.shared.emit(
                self.task_id,
                EventKind::ActionAttempted,
                json!({ "action_index": index, "action": action.name, "attempt": attempt }),
            );
            tracing::debug!(
                task_id = %self.task_id,
                action = %action.name,
                attempt,
                "Executing action"
            );

            let Attempt { result, retryable } =
                self.attempt(executor.as_ref(), &action, index, attempt).await;
            let interrupt = self.checkpoint().await;

            if result.success {
                return match interrupt {
                    Some(Interrupt::TimedOut) => {
                        self.record(index, &result, ActionStatus::Succeeded).await;
                        Some(Outcome::Failed(self.timeout_error(index)))
                    }
                    Some(Interrupt::Cancel) => {
                        self.discard(index).await;
                        Some(Outcome::Cancelled)
                    }
                    Some(Interrupt::Pause) => {
                        self.record(index, &result, ActionStatus::Succeeded).await;
                        self.advance(index).await;
                        Some(Outcome::Paused)
                    }
                    None => {
                        self.record(index, &result, ActionStatus::Succeeded).await;
                        self.advance(index).await;
                        None
                    }
                };
            }

            let error = result.error.clone().unwrap_or_default();
            match interrupt {
                Some(Interrupt::TimedOut) => {
                    self.record(index, &result, ActionStatus::Failed).await;
                    return Some(Outcome::Failed(self.timeout_error(index)));
                }
                Some(Interrupt::Cancel) => {
                    self.discard(index).await;
                    return Some(Outcome::Cancelled);
                }
                _ => {}
            }

            let has_budget = retryable
                && (attempt < allowed_attempts(max_retries, self.rearm_count(index).await)
                    || self.try_rearm(index, &action).await);

            if !has_budget {
                self.record(index, &result, ActionStatus::Failed).await;
                tracing::error!(
                    task_id = %self.task_id,
                    action = %action.name,
                    attempts = attempt,
                    "Action failed: {}",
                    error
                );
                let message = if retryable {
                    format!("action '{}' failed after {attempt} attempts: {error}", action.name)
                } else {
                    format!("action '{}' failed: {error}", action.name)
                };
                return Some(Outcome::Failed(
                    TaskError::new(TaskErrorKind::ExecutorFailure, message).at_action(index),
                ));
            }

            // The failed attempt is recorded; the action stays pending so a
            // paused task picks its budget back up on resume.
            self.record(index, &result, ActionStatus::Pending).await;
            if interrupt == Some(Interrupt::Pause) {
                return Some(Outcome::Paused);
            }

            let delay = self.shared.backoff.delay(attempt);
            tracing::warn!(
                task_id = %self.task_id,
                action = %action.name,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                "Retrying action: {}",
                error
            );
            self.shared.emit(
                self.task_id,
                EventKind::ActionRetried,
                json!({
                    "action_index": index,
                    "action": action.name,
                    "scope": "action",
                    "next_attempt": attempt + 1,
                    "delay_ms": delay.as_millis() as u64,
                    "error": error,
                }),
            );

            self.wait_backoff(delay).await;
            match self.checkpoint().await {
                Some(Interrupt::TimedOut) => {
                    self.update_action(index, |a| a.status = ActionStatus::Failed)
                        .await;
                    return Some(Outcome::Failed(self.timeout_error(index)));
                }
                Some(Interrupt::Cancel) => return Some(Outcome::Cancelled),
                Some(Interrupt::Pause) => return Some(Outcome::Paused),
                None => {}
            }
        }
    }

    /// One executor call. Never interrupted; a panic counts as a retryable failure.
    async fn attempt(
        &self,
        executor: &dyn Executor,
        action: &Action,
        index: usize,
        attempt: u32,
    ) -> Attempt {
        let ctx = ExecutionContext {
            task_id: self.task_id,
            task_name: self.task_name.clone(),
            task_type: self.task_type,
            action_index: index,
            attempt,
            time_remaining: Some(self.deadline.saturating_duration_since(Instant::now())),
        };

        let started = Instant::now();
        let outcome = AssertUnwindSafe(executor.execute(action, &ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(ExecutorError::ExecutionFailed(format!(
                    "executor '{}' panicked",
                    executor.name()
                )))
            });
        let elapsed = started.elapsed();

        match outcome {
            Ok(output) => Attempt {
                result: ActionResult {
                    success: true,
                    output: output.result,
                    error: None,
                    duration: output.duration.max(elapsed),
                    attempt,
                },
                retryable: false,
            },
            Err(e) => Attempt {
                result: ActionResult {
                    success: false,
                    output: serde_json::Value::Null,
                    error: Some(e.to_string()),
                    duration: elapsed,
                    attempt,
                },
                retryable: e.is_retryable(),
            },
        }
    }

    /// Evaluate timeout, then cancel, then pause.
    async fn checkpoint(&self) -> Option<Interrupt> {
        if Instant::now() >= self.deadline {
            return Some(Interrupt::TimedOut);
        }
        match self.shared.table.take_signal(self.task_id).await {
            Some(ControlSignal::Cancel) => Some(Interrupt::Cancel),
            Some(ControlSignal::Pause) => Some(Interrupt::Pause),
            None => None,
        }
    }

    /// Sleep out a backoff delay, waking early for the deadline or a control signal.
    async fn wait_backoff(&self, delay: Duration) {
        let until = Instant::now().checked_add(delay).unwrap_or(self.deadline);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(until) => return,
                _ = tokio::time::sleep_until(self.deadline) => return,
                _ = self.wake.notified() => {
                    // A stale wake-up from an already handled signal keeps waiting.
                    if self.shared.table.has_signal(self.task_id).await {
                        return;
                    }
                }
            }
        }
    }

    async fn rearm_count(&self, index: usize) -> u32 {
        self.shared
            .table
            .update(self.task_id, |e| {
                e.task.actions.get(index).map(|a| a.rearm_count).unwrap_or(0)
            })
            .await
            .unwrap_or(0)
    }

    /// Spend one task-level retry to give the action a fresh budget.
    async fn try_rearm(&self, index: usize, action: &Action) -> bool {
        let rearmed = self
            .shared
            .table
            .update(self.task_id, |e| {
                if e.task.retry_count >= e.task.max_retries {
                    return None;
                }
                e.task.retry_count += 1;
                if let Some(a) = e.task.actions.get_mut(index) {
                    a.rearm_count += 1;
                }
                e.task.touch();
                Some(e.task.retry_count)
            })
            .await
            .ok()
            .flatten();

        match rearmed {
            Some(retry_count) => {
                tracing::warn!(
                    task_id = %self.task_id,
                    action = %action.name,
                    retry_count,
                    "Action budget exhausted, retrying at task level"
                );
                self.shared.emit(
                    self.task_id,
                    EventKind::ActionRetried,
                    json!({
                        "action_index": index,
                        "action": action.name,
                        "scope": "task",
                        "retry_count": retry_count,
                    }),
                );
                true
            }
            None => false,
        }
    }

    async fn update_action<F, R>(&self, index: usize, f: F) -> Option<R>
    where
        F: FnOnce(&mut Action) -> R,
    {
        self.shared
            .table
            .update(self.task_id, |e| {
                e.task.touch();
                e.task.actions.get_mut(index).map(f)
            })
            .await
            .ok()
            .flatten()
    }

    async fn record(&self, index: usize, result: &ActionResult, status: ActionStatus) {
        self.update_action(index, |a| {
            a.status = status;
            if result.success {
                a.result = Some(result.output.clone());
                a.error = None;
            } else {
                a.error = result.error.clone();
            }
        })
        .await;
    }

    /// Cancelled mid-attempt: the attempt's result is dropped.
    async fn discard(&self, index: usize) {
        self.update_action(index, |a| {
            a.status = ActionStatus::Skipped;
            a.result = None;
        })
        .await;
    }

    async fn advance(&self, index: usize) {
        let _ = self
            .shared
            .table
            .update(self.task_id, |e| e.task.next_action = index + 1)
            .await;
    }

    fn timeout_error(&self, index: usize) -> TaskError {
        TaskError::new(
            TaskErrorKind::TaskTimeout,
            format!("task exceeded its {:?} timeout", self.timeout),
        )
        .at_action(index)
    }

    /// Apply the outcome to the record, release ownership and persist.
    async fn finish(&self, outcome: Outcome) {
        let active = self.segment_start.elapsed();

        let applied = self
            .shared
            .table
            .update(self.task_id, |e| -> Result<Outcome, TransitionError> {
                // A control request accepted after the last checkpoint still
                // takes effect; it is never dropped in favor of completion.
                let outcome = match (outcome, e.signal.take()) {
                    (Outcome::Completed, Some(ControlSignal::Cancel)) => {
                        if let Some(last) = e.task.next_action.checked_sub(1) {
                            if let Some(action) = e.task.actions.get_mut(last) {
                                action.status = ActionStatus::Skipped;
                                action.result = None;
                            }
                        }
                        Outcome::Cancelled
                    }
                    (Outcome::Completed, Some(ControlSignal::Pause)) => Outcome::Paused,
                    (outcome, _) => outcome,
                };

                e.in_worker = false;
                e.task.active_time += active;
                match &outcome {
                    Outcome::Completed => {
                        e.task.result = Some(serde_json::Value::Array(
                            e.task
                                .actions
                                .iter()
                                .map(|a| a.result.clone().unwrap_or(serde_json::Value::Null))
                                .collect(),
                        ));
                    }
                    Outcome::Failed(err) => {
                        e.task.error = Some(err.clone());
                        let from = e.task.next_action;
                        e.task.skip_remaining(from);
                    }
                    Outcome::Cancelled => {
                        let from = e.task.next_action;
                        e.task.skip_remaining(from);
                    }
                    Outcome::Paused => {}
                }

                let (status, reason) = outcome.status_and_reason();
                e.task.transition_to(status, Some(reason))?;
                if status.is_terminal() {
                    self.shared.metrics.record(status, e.task.active_time);
                }
                Ok(outcome)
            })
            .await;

        let outcome = match applied {
            Ok(Ok(applied)) => applied,
            Ok(Err(e)) => {
                tracing::error!(task_id = %self.task_id, "Cannot release task: {}", e);
                return;
            }
            Err(e) => {
                tracing::error!(task_id = %self.task_id, "Cannot release task: {}", e);
                return;
            }
        };
        let (status, reason) = outcome.status_and_reason();

        match &outcome {
            Outcome::Completed => {
                tracing::info!(task_id = %self.task_id, name = %self.task_name, "Task completed")
            }
            Outcome::Failed(err) => {
                tracing::error!(task_id = %self.task_id, name = %self.task_name, "Task failed: {}", err)
            }
            Outcome::Cancelled => {
                tracing::info!(task_id = %self.task_id, name = %self.task_name, "Task cancelled")
            }
            Outcome::Paused => {
                tracing::info!(task_id = %self.task_id, name = %self.task_name, "Task paused")
            }
        }

        if status.is_terminal() {
            // Dependents of this task may be runnable now.
            self.shared.queue_notify.notify_one();
        }

        let _ = self.shared.persist(self.task_id).await;

        let kind = if status == TaskStatus::Paused {
            EventKind::Paused
        } else {
            EventKind::Terminal
        };
        let error = match &outcome {
            Outcome::Failed(err) => Some(err.clone()),
            _ => None,
        };
        self.shared.emit(
            self.task_id,
            kind,
            json!({ "status": status, "reason": reason, "error": error }),
        );
    }
}

/// Outcome of one executor call plus its retry classification.
struct Attempt {
    result: ActionResult,
    retryable: bool,
}
