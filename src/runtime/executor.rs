//! Per-task execution pipeline.
//!
//! One executor instance serves the whole replica; each call to
//! [`TaskExecutor::process_task`] drives exactly one task through:
//! lock acquisition, reload, expiry/executability checks, validation,
//! handler invocation, result classification, and the single atomic
//! commit that closes the attempt log and rewrites the task row.
//!
//! A commit that cannot land (lock lost or store down) is dropped on the
//! floor intentionally: the lock expires and the stale-lock reaper turns
//! the row back into a retry.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::observability::EngineMetrics;
use super::registry::HandlerRegistry;
use crate::alert::AlertSink;
use crate::config::SchedulerOptions;
use crate::handlers::TaskExecutionResult;
use crate::providers::{AttemptClose, StoreError, TaskCommit, TaskStore};
use crate::task::{now_ms, truncate_error_detail, Task, TaskId, TaskPriority, TaskStatus};

pub struct TaskExecutor {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    alerts: Arc<dyn AlertSink>,
    options: SchedulerOptions,
    instance_id: String,
    metrics: Arc<EngineMetrics>,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        alerts: Arc<dyn AlertSink>,
        options: SchedulerOptions,
        instance_id: String,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            registry,
            alerts,
            options,
            instance_id,
            metrics,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Acquire the task lock and run the pipeline. Returns `true` only for
    /// a successfully completed attempt.
    pub async fn process_task(&self, task: &Task) -> bool {
        match self.acquire_lock(task).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = %task.id, "lost lock race, skipping task");
                return false;
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "lock acquisition failed");
                return false;
            }
        }
        self.execute_locked(task.id).await
    }

    /// Fetch a task by id and process it (manual `retry-now` dispatch).
    pub async fn process_task_by_id(&self, id: TaskId) -> bool {
        match self.store.get_task(id).await {
            Ok(Some(task)) => self.process_task(&task).await,
            Ok(None) => {
                warn!(task_id = %id, "task no longer exists");
                false
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "failed to load task for dispatch");
                false
            }
        }
    }

    async fn acquire_lock(&self, task: &Task) -> Result<bool, StoreError> {
        let now = now_ms();
        let lock_until = now + self.options.lock_duration.as_millis() as i64;
        let acquired = self
            .store
            .acquire_task_lock(task.id, task.version, &self.instance_id, lock_until, now)
            .await?;
        if acquired {
            debug!(task_id = %task.id, lock_until, "acquired task lock");
        }
        Ok(acquired)
    }

    async fn execute_locked(&self, id: TaskId) -> bool {
        // Reload under the lock to observe current state.
        let task = match self.store.get_task(id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id = %id, "task vanished after lock acquisition");
                return false;
            }
            Err(e) => {
                error!(task_id = %id, error = %e, "reload failed; leaving lock to expire");
                return false;
            }
        };

        let now = now_ms();

        if task.is_expired(now) {
            info!(task_id = %id, "task expired before execution");
            if let Err(e) = self.store.mark_expired(id, &self.instance_id, now).await {
                error!(task_id = %id, error = %e, "failed to mark task expired");
            }
            self.metrics.record_expired();
            return false;
        }

        if !(task.status.is_executable() || task.status == TaskStatus::Processing) {
            warn!(task_id = %id, status = %task.status, "task not executable, releasing lock");
            if let Err(e) = self.store.release_task_lock(id, &self.instance_id, now).await {
                error!(task_id = %id, error = %e, "failed to release lock");
            }
            return false;
        }

        info!(
            task_id = %id,
            task_type = %task.task_type,
            reference_id = %task.reference_id,
            attempt = task.retry_count + 1,
            "starting task execution"
        );

        let started_at = now;
        let log = match self
            .store
            .open_attempt(crate::task::NewExecutionLog {
                task_id: id,
                attempt_number: task.retry_count + 1,
                executor_instance: self.instance_id.clone(),
                started_at,
                request_payload: Some(request_snapshot(&task)),
            })
            .await
        {
            Ok(log) => log,
            Err(e) => {
                error!(task_id = %id, error = %e, "failed to open attempt log; leaving lock to expire");
                return false;
            }
        };

        let result = self.run_handler(&task).await;
        let completed_at = now_ms();
        let duration_ms = completed_at.saturating_sub(started_at);

        if result.success {
            self.handle_success(&task, log.id, result, completed_at, duration_ms).await
        } else {
            self.handle_failure(&task, log.id, result, completed_at, duration_ms).await;
            false
        }
    }

    /// Validate and invoke the handler, converting panics into retryable
    /// failures and missing handlers into permanent ones.
    async fn run_handler(&self, task: &Task) -> TaskExecutionResult {
        let Some(handler) = self.registry.handler_for(task.task_type) else {
            error!(task_id = %task.id, task_type = %task.task_type, "no handler registered");
            return TaskExecutionResult::permanent(
                format!("No handler registered for task type: {}", task.task_type),
                "HANDLER_NOT_REGISTERED",
            );
        };

        if let Err(e) = handler.validate(task) {
            error!(task_id = %task.id, error = %e, "task validation failed");
            return TaskExecutionResult::permanent(e.to_string(), "VALIDATION_ERROR");
        }

        match AssertUnwindSafe(handler.execute(task)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic);
                error!(task_id = %task.id, panic = %message, "handler panicked");
                let mut result = TaskExecutionResult::failure_with_type(
                    format!("handler panicked: {message}"),
                    "PANIC",
                );
                result.error_detail = Some(truncate_error_detail(&message));
                result
            }
        }
    }

    async fn handle_success(
        &self,
        task: &Task,
        log_id: i64,
        result: TaskExecutionResult,
        completed_at: i64,
        duration_ms: i64,
    ) -> bool {
        info!(task_id = %task.id, duration_ms, "task completed");

        // Recurring tasks are rescheduled externally; flag them for the
        // operator instead of guessing an occurrence.
        if matches!(&task.cron_expression, Some(expr) if !expr.is_empty()) {
            info!(task_id = %task.id, "recurring task completed; rescheduling is external");
        }

        let close = AttemptClose {
            status: TaskStatus::Completed,
            completed_at,
            duration_ms,
            success: true,
            error_message: None,
            error_stack_trace: None,
            error_type: None,
            http_status_code: result.http_status_code,
            response_payload: Some(result.response_data.clone()),
        };
        let commit = TaskCommit {
            status: TaskStatus::Completed,
            retry_count: task.retry_count,
            scheduled_time: task.scheduled_time,
            completed_at: Some(completed_at),
            execution_duration_ms: Some(duration_ms),
            execution_result: Some(result.response_data),
            last_error: None,
            last_error_stack_trace: None,
        };

        if self.commit(task.id, log_id, close, commit).await {
            self.metrics.record_success();
            true
        } else {
            false
        }
    }

    async fn handle_failure(
        &self,
        task: &Task,
        log_id: i64,
        result: TaskExecutionResult,
        completed_at: i64,
        duration_ms: i64,
    ) {
        warn!(
            task_id = %task.id,
            error = result.error_message.as_deref().unwrap_or("unknown"),
            error_type = result.error_type.as_deref().unwrap_or("-"),
            retryable = result.retryable,
            "task attempt failed"
        );
        self.metrics.record_failure();

        let close = AttemptClose {
            status: TaskStatus::Failed,
            completed_at,
            duration_ms,
            success: false,
            error_message: result.error_message.clone(),
            error_stack_trace: result.error_detail.as_deref().map(truncate_error_detail),
            error_type: result.error_type.clone(),
            http_status_code: result.http_status_code,
            response_payload: Some(result.response_data.clone()),
        };

        if !result.retryable {
            self.dead_letter(task, log_id, close, result, completed_at, duration_ms).await;
            return;
        }

        let new_retry_count = task.retry_count + 1;
        let max_retries = task.effective_max_retries(self.options.default_max_retries);

        if new_retry_count >= max_retries {
            self.max_retries_exceeded(task, log_id, close, result, completed_at, duration_ms)
                .await;
            return;
        }

        self.schedule_retry(task, log_id, close, result, new_retry_count, duration_ms)
            .await;
    }

    async fn dead_letter(
        &self,
        task: &Task,
        log_id: i64,
        close: AttemptClose,
        result: TaskExecutionResult,
        completed_at: i64,
        duration_ms: i64,
    ) {
        error!(
            task_id = %task.id,
            error_type = result.error_type.as_deref().unwrap_or("-"),
            "task failed permanently, moving to dead letter"
        );

        let commit = TaskCommit {
            status: TaskStatus::DeadLetter,
            retry_count: task.retry_count,
            scheduled_time: task.scheduled_time,
            completed_at: Some(completed_at),
            execution_duration_ms: Some(duration_ms),
            execution_result: task.execution_result.clone(),
            last_error: result.error_message.clone(),
            last_error_stack_trace: result.error_detail.as_deref().map(truncate_error_detail),
        };

        if self.commit(task.id, log_id, close, commit).await {
            self.metrics.record_dead_letter();
            if task.priority >= TaskPriority::High {
                let alerts = Arc::clone(&self.alerts);
                let mut snapshot = task.clone();
                snapshot.status = TaskStatus::DeadLetter;
                snapshot.last_error = result.error_message.clone();
                let error = result.error_message.unwrap_or_else(|| "Unknown error".to_string());
                tokio::spawn(async move {
                    alerts.task_failure(&snapshot, &error).await;
                });
            }
        }
    }

    async fn max_retries_exceeded(
        &self,
        task: &Task,
        log_id: i64,
        close: AttemptClose,
        result: TaskExecutionResult,
        completed_at: i64,
        duration_ms: i64,
    ) {
        error!(task_id = %task.id, retry_count = task.retry_count, "task exceeded max retries");

        let commit = TaskCommit {
            status: TaskStatus::MaxRetriesExceeded,
            retry_count: task.retry_count,
            scheduled_time: task.scheduled_time,
            completed_at: Some(completed_at),
            execution_duration_ms: Some(duration_ms),
            execution_result: task.execution_result.clone(),
            last_error: result.error_message.clone(),
            last_error_stack_trace: result.error_detail.as_deref().map(truncate_error_detail),
        };

        if self.commit(task.id, log_id, close, commit).await {
            self.metrics.record_max_retries_exceeded();
            let alerts = Arc::clone(&self.alerts);
            let mut snapshot = task.clone();
            snapshot.status = TaskStatus::MaxRetriesExceeded;
            snapshot.last_error = result.error_message.clone();
            tokio::spawn(async move {
                alerts.max_retries_exceeded(&snapshot).await;
            });
        }
    }

    async fn schedule_retry(
        &self,
        task: &Task,
        log_id: i64,
        close: AttemptClose,
        result: TaskExecutionResult,
        new_retry_count: u32,
        duration_ms: i64,
    ) {
        let delay_ms = match result.custom_retry_delay_ms {
            Some(delay) => delay,
            None => match self.registry.handler_for(task.task_type) {
                Some(handler) => {
                    handler.next_retry_delay_ms(task, self.options.default_retry_delay_hours)
                }
                // Unregistered types never reach here; keep a sane fallback.
                None => crate::handlers::with_jitter(
                    self.options.default_retry_delay_hours as i64 * 3_600_000,
                ),
            },
        };
        let next_retry_time = now_ms() + delay_ms;

        info!(
            task_id = %task.id,
            retry = new_retry_count,
            next_retry_time,
            "scheduling task retry"
        );

        let commit = TaskCommit {
            status: TaskStatus::RetryPending,
            retry_count: new_retry_count,
            scheduled_time: next_retry_time,
            completed_at: None,
            execution_duration_ms: Some(duration_ms),
            execution_result: task.execution_result.clone(),
            last_error: result.error_message.clone(),
            last_error_stack_trace: result.error_detail.as_deref().map(truncate_error_detail),
        };

        if self.commit(task.id, log_id, close, commit).await {
            self.metrics.record_retry();
        }
    }

    /// Single transactional boundary per attempt. `false` means the lock
    /// was lost or the store failed; either way the reaper owns recovery.
    async fn commit(&self, task_id: TaskId, log_id: i64, close: AttemptClose, commit: TaskCommit) -> bool {
        match self
            .store
            .commit_attempt(task_id, &self.instance_id, log_id, close, commit, now_ms())
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                warn!(task_id = %task_id, "lock lost before commit; attempt result dropped");
                false
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "attempt commit failed; leaving lock to expire");
                false
            }
        }
    }
}

/// Snapshot of what this attempt was asked to do, stored on the log row.
fn request_snapshot(task: &Task) -> serde_json::Value {
    json!({
        "taskId": task.id.to_string(),
        "taskType": task.task_type.as_str(),
        "referenceId": task.reference_id,
        "secondaryReferenceId": task.secondary_reference_id,
        "attemptNumber": task.retry_count + 1,
        "taskPayload": task.payload,
    })
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
