//! Management surface: task creation, queries, and operator state
//! commands.
//!
//! A [`Client`] works against any [`TaskStore`] and is what an HTTP layer
//! or admin CLI talks to. It never touches task rows the engine has
//! locked: every write is a version-checked conditional update, and a lost
//! race surfaces as a conflict instead of clobbering executor state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::providers::{OperatorUpdate, StoreError, TaskQuery, TaskStore};
use crate::task::{now_ms, ExecutionLog, NewTask, Task, TaskId, TaskStatus, TaskType};

/// What `create_task` should do when a live duplicate exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Idempotent success: hand back the existing live task.
    #[default]
    ReturnExisting,
    /// Refuse with [`ClientError::Duplicate`].
    Reject,
}

/// Task creation request with duplicate-prevention controls.
#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    pub task: NewTask,
    /// Enforce at most one live task per `(reference_id, type)`.
    pub prevent_duplicates: bool,
    pub duplicate_policy: DuplicatePolicy,
}

impl CreateTaskRequest {
    pub fn new(task: NewTask) -> Self {
        Self {
            task,
            prevent_duplicates: false,
            duplicate_policy: DuplicatePolicy::default(),
        }
    }

    pub fn prevent_duplicates(mut self, policy: DuplicatePolicy) -> Self {
        self.prevent_duplicates = true;
        self.duplicate_policy = policy;
        self
    }
}

/// A task together with its attempt history, newest first.
#[derive(Debug, Clone)]
pub struct TaskWithHistory {
    pub task: Task,
    pub history: Vec<ExecutionLog>,
}

/// Aggregated counts for dashboards.
#[derive(Debug, Clone, Default)]
pub struct TaskStatistics {
    pub status_distribution: HashMap<String, u64>,
    pub type_status_distribution: HashMap<String, HashMap<String, u64>>,
    /// PENDING + SCHEDULED + RETRY_PENDING.
    pub pending_count: u64,
    pub processing_count: u64,
    /// FAILED + MAX_RETRIES_EXCEEDED.
    pub failed_count: u64,
    pub completed_count: u64,
}

/// Management errors, with the HTTP status an API layer should map each
/// variant to.
#[derive(Debug, Clone)]
pub enum ClientError {
    /// 404.
    NotFound { task_id: TaskId },
    /// 409: the requested transition is not legal from the current status.
    InvalidState { message: String },
    /// 409: the task is locked by an executor right now.
    Locked { task_id: TaskId },
    /// 409: a live task already exists for this `(reference_id, type)`.
    Duplicate {
        reference_id: String,
        task_type: TaskType,
    },
    /// 400.
    InvalidInput { message: String },
    /// 502: the store itself failed.
    Store(StoreError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::NotFound { task_id } => write!(f, "Task not found: {task_id}"),
            ClientError::InvalidState { message } => f.write_str(message),
            ClientError::Locked { task_id } => {
                write!(f, "Task {task_id} is currently being processed")
            }
            ClientError::Duplicate {
                reference_id,
                task_type,
            } => write!(
                f,
                "Active task already exists for reference {reference_id} with type {task_type}"
            ),
            ClientError::InvalidInput { message } => write!(f, "Invalid input: {message}"),
            ClientError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<StoreError> for ClientError {
    fn from(e: StoreError) -> Self {
        ClientError::Store(e)
    }
}

pub struct Client {
    store: Arc<dyn TaskStore>,
    /// Pushes task ids to the runtime for immediate dispatch (`retry-now`).
    dispatch: Option<mpsc::Sender<TaskId>>,
}

impl Client {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            dispatch: None,
        }
    }

    /// Attach a runtime dispatch handle; without one, `retry_task_now`
    /// still resets the task and the next poll picks it up.
    pub fn with_dispatch(mut self, dispatch: mpsc::Sender<TaskId>) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    // ===== Creation =====

    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<Task, ClientError> {
        if request.task.reference_id.trim().is_empty() {
            return Err(ClientError::InvalidInput {
                message: "reference_id is required".to_string(),
            });
        }

        if request.prevent_duplicates {
            if let Some(existing) = self
                .store
                .find_active_task(&request.task.reference_id, request.task.task_type)
                .await?
            {
                warn!(
                    reference_id = %existing.reference_id,
                    task_type = %existing.task_type,
                    existing_task = %existing.id,
                    "active task already exists for reference"
                );
                return match request.duplicate_policy {
                    DuplicatePolicy::ReturnExisting => Ok(existing),
                    DuplicatePolicy::Reject => Err(ClientError::Duplicate {
                        reference_id: existing.reference_id,
                        task_type: existing.task_type,
                    }),
                };
            }
        }

        let task = self.store.insert_task(request.task).await?;
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            reference_id = %task.reference_id,
            "created task"
        );
        Ok(task)
    }

    /// Create a batch; failures are logged and skipped, successes returned.
    pub async fn create_tasks(&self, requests: Vec<CreateTaskRequest>) -> Vec<Task> {
        let mut created = Vec::with_capacity(requests.len());
        for request in requests {
            let reference = request.task.reference_id.clone();
            match self.create_task(request).await {
                Ok(task) => created.push(task),
                Err(e) => {
                    warn!(reference_id = %reference, error = %e, "failed to create task in batch")
                }
            }
        }
        created
    }

    // ===== Reads =====

    pub async fn get_task(&self, id: TaskId) -> Result<Task, ClientError> {
        self.store
            .get_task(id)
            .await?
            .ok_or(ClientError::NotFound { task_id: id })
    }

    pub async fn get_task_with_history(&self, id: TaskId) -> Result<TaskWithHistory, ClientError> {
        let task = self.get_task(id).await?;
        let history = self.store.list_attempts(id).await?;
        Ok(TaskWithHistory { task, history })
    }

    pub async fn tasks_by_reference(&self, reference_id: &str) -> Result<Vec<Task>, ClientError> {
        Ok(self.store.list_by_reference(reference_id).await?)
    }

    pub async fn search_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, ClientError> {
        Ok(self.store.search_tasks(query).await?)
    }

    // ===== State commands =====

    /// Cancel a non-terminal, non-locked task.
    pub async fn cancel_task(&self, id: TaskId, reason: Option<&str>) -> Result<Task, ClientError> {
        let task = self.get_task(id).await?;
        self.refuse_terminal_or_locked(&task, "cancel")?;

        let now = now_ms();
        let update = OperatorUpdate {
            status: TaskStatus::Cancelled,
            scheduled_time: None,
            completed_at: Some(now),
            last_error: Some(format!(
                "Cancelled: {}",
                reason.unwrap_or("Manual cancellation")
            )),
            clear_lock: false,
        };
        self.apply_operator_update(&task, update, now).await?;
        info!(task_id = %id, reason = reason.unwrap_or("-"), "cancelled task");
        self.get_task(id).await
    }

    /// Pause a non-terminal, non-locked task.
    pub async fn pause_task(&self, id: TaskId) -> Result<Task, ClientError> {
        let task = self.get_task(id).await?;
        self.refuse_terminal_or_locked(&task, "pause")?;

        let now = now_ms();
        let update = OperatorUpdate {
            status: TaskStatus::Paused,
            scheduled_time: None,
            completed_at: None,
            last_error: None,
            clear_lock: false,
        };
        self.apply_operator_update(&task, update, now).await?;
        info!(task_id = %id, "paused task");
        self.get_task(id).await
    }

    /// Resume a paused task for immediate execution.
    pub async fn resume_task(&self, id: TaskId) -> Result<Task, ClientError> {
        let task = self.get_task(id).await?;
        if task.status != TaskStatus::Paused {
            return Err(ClientError::InvalidState {
                message: format!(
                    "Can only resume paused tasks, current status: {}",
                    task.status
                ),
            });
        }

        let now = now_ms();
        let update = OperatorUpdate {
            status: TaskStatus::Pending,
            scheduled_time: Some(now),
            completed_at: None,
            last_error: None,
            clear_lock: false,
        };
        self.apply_operator_update(&task, update, now).await?;
        info!(task_id = %id, "resumed task");
        self.get_task(id).await
    }

    /// Manually schedule a retry of a failed or paused task.
    pub async fn retry_task(&self, id: TaskId, scheduled_time: Option<i64>) -> Result<Task, ClientError> {
        let task = self.get_task(id).await?;
        self.refuse_not_retryable(&task)?;

        let now = now_ms();
        let update = OperatorUpdate {
            status: TaskStatus::RetryPending,
            scheduled_time: Some(scheduled_time.unwrap_or(now)),
            completed_at: None,
            last_error: None,
            clear_lock: true,
        };
        self.apply_operator_update(&task, update, now).await?;
        info!(task_id = %id, scheduled_time = ?scheduled_time, "scheduled manual retry");
        self.get_task(id).await
    }

    /// Reset a failed or paused task and dispatch it immediately.
    pub async fn retry_task_now(&self, id: TaskId) -> Result<Task, ClientError> {
        let task = self.get_task(id).await?;
        self.refuse_not_retryable(&task)?;

        let now = now_ms();
        let update = OperatorUpdate {
            status: TaskStatus::Pending,
            scheduled_time: Some(now),
            completed_at: None,
            last_error: None,
            clear_lock: true,
        };
        self.apply_operator_update(&task, update, now).await?;

        match &self.dispatch {
            Some(dispatch) => {
                if dispatch.send(id).await.is_err() {
                    warn!(task_id = %id, "runtime dispatch channel closed; task waits for next poll");
                }
            }
            None => {
                warn!(task_id = %id, "no runtime attached; task waits for next poll");
            }
        }

        info!(task_id = %id, "triggered immediate retry");
        self.get_task(id).await
    }

    /// Cancel a batch; returns how many cancellations succeeded.
    pub async fn cancel_tasks(&self, ids: &[TaskId], reason: Option<&str>) -> u64 {
        let mut cancelled = 0;
        for id in ids {
            match self.cancel_task(*id, reason).await {
                Ok(_) => cancelled += 1,
                Err(e) => warn!(task_id = %id, error = %e, "failed to cancel task in batch"),
            }
        }
        cancelled
    }

    // ===== Statistics & retention =====

    pub async fn statistics(&self) -> Result<TaskStatistics, ClientError> {
        let mut stats = TaskStatistics::default();

        for (status, count) in self.store.status_counts().await? {
            stats
                .status_distribution
                .insert(status.as_str().to_string(), count);
            match status {
                TaskStatus::Pending | TaskStatus::Scheduled | TaskStatus::RetryPending => {
                    stats.pending_count += count
                }
                TaskStatus::Processing => stats.processing_count += count,
                TaskStatus::Failed | TaskStatus::MaxRetriesExceeded => stats.failed_count += count,
                TaskStatus::Completed => stats.completed_count += count,
                _ => {}
            }
        }

        for (task_type, status, count) in self.store.type_status_counts().await? {
            stats
                .type_status_distribution
                .entry(task_type.as_str().to_string())
                .or_default()
                .insert(status.as_str().to_string(), count);
        }

        Ok(stats)
    }

    /// Delete terminal tasks (and their logs) older than the retention
    /// horizon. Returns the number of tasks removed.
    pub async fn cleanup_old_tasks(&self, retention_days: u32) -> Result<u64, ClientError> {
        let cutoff = now_ms() - retention_days as i64 * 24 * 60 * 60 * 1000;
        let deleted = self.store.delete_finished_before(cutoff).await?;
        info!(deleted, retention_days, "cleaned up old tasks");
        Ok(deleted)
    }

    // ===== Preconditions =====

    fn refuse_terminal_or_locked(&self, task: &Task, action: &str) -> Result<(), ClientError> {
        if task.status.is_terminal() {
            return Err(ClientError::InvalidState {
                message: format!(
                    "Cannot {action} task in terminal state: {}",
                    task.status
                ),
            });
        }
        if task.is_locked(now_ms()) {
            return Err(ClientError::Locked { task_id: task.id });
        }
        Ok(())
    }

    fn refuse_not_retryable(&self, task: &Task) -> Result<(), ClientError> {
        if !task.status.is_failure() && task.status != TaskStatus::Paused {
            return Err(ClientError::InvalidState {
                message: format!(
                    "Can only retry failed or paused tasks, current status: {}",
                    task.status
                ),
            });
        }
        if task.is_locked(now_ms()) {
            return Err(ClientError::Locked { task_id: task.id });
        }
        Ok(())
    }

    async fn apply_operator_update(
        &self,
        task: &Task,
        update: OperatorUpdate,
        now: i64,
    ) -> Result<(), ClientError> {
        let applied = self
            .store
            .operator_update(task.id, task.version, update, now)
            .await?;
        if !applied {
            // An executor (or another operator) won the race.
            return Err(ClientError::InvalidState {
                message: format!("Task {} was modified concurrently; re-read and retry", task.id),
            });
        }
        Ok(())
    }
}
