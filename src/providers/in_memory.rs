//! In-memory task store for tests and local development.
//!
//! Implements the same conditional-update semantics as the SQLite store so
//! engine behavior (lock races, operator conflicts, reap idempotence) can
//! be exercised without a database file.

use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{AttemptClose, OperatorUpdate, StoreError, TaskCommit, TaskQuery, TaskStore};
use crate::task::{
    now_ms, ExecutionLog, NewExecutionLog, NewTask, Task, TaskId, TaskStatus, TaskType,
};

#[derive(Debug, Clone)]
struct ClusterLease {
    locked_by: String,
    lock_until: i64,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    logs: Vec<ExecutionLog>,
    next_log_id: i64,
    cluster: HashMap<String, ClusterLease>,
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    inner: Mutex<Inner>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TaskStore for InMemoryTaskStore {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn insert_task(&self, new: NewTask) -> Result<Task, StoreError> {
        let now = now_ms();
        let scheduled_time = new.scheduled_time.unwrap_or(now);
        let status = if scheduled_time > now {
            TaskStatus::Scheduled
        } else {
            TaskStatus::Pending
        };
        let task = Task {
            id: TaskId::new(),
            task_type: new.task_type,
            status,
            priority: new.priority,
            reference_id: new.reference_id,
            secondary_reference_id: new.secondary_reference_id,
            description: new.description,
            payload: new.payload,
            metadata: new.metadata,
            scheduled_time,
            expires_at: new.expires_at,
            retry_count: 0,
            max_retries: new.max_retries,
            retry_delay_hours: new.retry_delay_hours,
            cron_expression: new.cron_expression,
            last_error: None,
            last_error_stack_trace: None,
            execution_result: None,
            locked_by: None,
            locked_until: None,
            version: 0,
            created_at: now,
            updated_at: now,
            created_by: new.created_by,
            started_at: None,
            completed_at: None,
            execution_duration_ms: None,
        };
        let mut g = self.inner.lock().await;
        g.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.lock().await.tasks.get(&id).cloned())
    }

    async fn fetch_due_tasks(&self, now_ms: i64, limit: u32) -> Result<Vec<Task>, StoreError> {
        let g = self.inner.lock().await;
        let mut due: Vec<Task> = g
            .tasks
            .values()
            .filter(|t| {
                t.status.is_executable()
                    && t.scheduled_time <= now_ms
                    && !t.is_locked(now_ms)
                    && !matches!(t.expires_at, Some(at) if at <= now_ms)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .value()
                .cmp(&a.priority.value())
                .then(a.scheduled_time.cmp(&b.scheduled_time))
        });
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn acquire_task_lock(
        &self,
        id: TaskId,
        expected_version: i64,
        instance: &str,
        lock_until_ms: i64,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut g = self.inner.lock().await;
        let Some(task) = g.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if task.version != expected_version || task.is_locked(now_ms) {
            return Ok(false);
        }
        task.locked_by = Some(instance.to_string());
        task.locked_until = Some(lock_until_ms);
        task.status = TaskStatus::Processing;
        task.started_at = Some(now_ms);
        task.updated_at = now_ms;
        task.version += 1;
        Ok(true)
    }

    async fn release_task_lock(&self, id: TaskId, instance: &str, now_ms: i64) -> Result<bool, StoreError> {
        let mut g = self.inner.lock().await;
        let Some(task) = g.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if task.locked_by.as_deref() != Some(instance) {
            return Ok(false);
        }
        task.locked_by = None;
        task.locked_until = None;
        task.updated_at = now_ms;
        task.version += 1;
        Ok(true)
    }

    async fn mark_expired(&self, id: TaskId, instance: &str, now_ms: i64) -> Result<bool, StoreError> {
        let mut g = self.inner.lock().await;
        let Some(task) = g.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if task.locked_by.as_deref() != Some(instance) {
            return Ok(false);
        }
        task.status = TaskStatus::Expired;
        task.completed_at = Some(now_ms);
        task.locked_by = None;
        task.locked_until = None;
        task.updated_at = now_ms;
        task.version += 1;
        Ok(true)
    }

    async fn open_attempt(&self, new: NewExecutionLog) -> Result<ExecutionLog, StoreError> {
        let mut g = self.inner.lock().await;
        g.next_log_id += 1;
        let log = ExecutionLog {
            id: g.next_log_id,
            task_id: new.task_id,
            attempt_number: new.attempt_number,
            status: TaskStatus::Processing,
            executor_instance: new.executor_instance,
            started_at: new.started_at,
            completed_at: None,
            duration_ms: None,
            success: false,
            error_message: None,
            error_stack_trace: None,
            error_type: None,
            http_status_code: None,
            request_payload: new.request_payload,
            response_payload: None,
            notes: None,
            created_at: now_ms(),
        };
        g.logs.push(log.clone());
        Ok(log)
    }

    async fn commit_attempt(
        &self,
        task_id: TaskId,
        instance: &str,
        log_id: i64,
        close: AttemptClose,
        commit: TaskCommit,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut g = self.inner.lock().await;
        // Conditional check first: both writes land or neither does.
        match g.tasks.get(&task_id) {
            Some(t) if t.locked_by.as_deref() == Some(instance) => {}
            _ => return Ok(false),
        }

        if let Some(log) = g.logs.iter_mut().find(|l| l.id == log_id) {
            log.status = close.status;
            log.completed_at = Some(close.completed_at);
            log.duration_ms = Some(close.duration_ms);
            log.success = close.success;
            log.error_message = close.error_message;
            log.error_stack_trace = close.error_stack_trace;
            log.error_type = close.error_type;
            log.http_status_code = close.http_status_code;
            log.response_payload = close.response_payload;
        }

        let task = g
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::permanent("commit_attempt", "task vanished"))?;
        task.status = commit.status;
        task.retry_count = commit.retry_count;
        task.scheduled_time = commit.scheduled_time;
        task.completed_at = commit.completed_at;
        task.execution_duration_ms = commit.execution_duration_ms;
        task.execution_result = commit.execution_result;
        task.last_error = commit.last_error;
        task.last_error_stack_trace = commit.last_error_stack_trace;
        task.locked_by = None;
        task.locked_until = None;
        task.updated_at = now_ms;
        task.version += 1;
        Ok(true)
    }

    async fn list_attempts(&self, task_id: TaskId) -> Result<Vec<ExecutionLog>, StoreError> {
        let g = self.inner.lock().await;
        let mut logs: Vec<ExecutionLog> = g.logs.iter().filter(|l| l.task_id == task_id).cloned().collect();
        logs.sort_by(|a, b| b.attempt_number.cmp(&a.attempt_number));
        Ok(logs)
    }

    async fn find_stale_tasks(&self, threshold_ms: i64) -> Result<Vec<Task>, StoreError> {
        let g = self.inner.lock().await;
        Ok(g.tasks
            .values()
            .filter(|t| {
                t.locked_by.is_some()
                    && t.status == TaskStatus::Processing
                    && matches!(t.locked_until, Some(until) if until < threshold_ms)
            })
            .cloned()
            .collect())
    }

    async fn reset_stale_tasks(
        &self,
        ids: &[TaskId],
        next_retry_ms: i64,
        now_ms: i64,
    ) -> Result<u64, StoreError> {
        let mut g = self.inner.lock().await;
        let mut reset = 0;
        for id in ids {
            if let Some(task) = g.tasks.get_mut(id) {
                if task.status != TaskStatus::Processing {
                    continue;
                }
                task.locked_by = None;
                task.locked_until = None;
                task.status = TaskStatus::RetryPending;
                task.last_error = Some("Task execution timed out or instance crashed".to_string());
                task.scheduled_time = next_retry_ms;
                task.updated_at = now_ms;
                task.version += 1;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn acquire_cluster_lock(
        &self,
        name: &str,
        instance: &str,
        lease_ms: i64,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut g = self.inner.lock().await;
        match g.cluster.get(name) {
            Some(lease) if lease.lock_until > now_ms && lease.locked_by != instance => Ok(false),
            _ => {
                g.cluster.insert(
                    name.to_string(),
                    ClusterLease {
                        locked_by: instance.to_string(),
                        lock_until: now_ms + lease_ms,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release_cluster_lock(&self, name: &str, instance: &str) -> Result<(), StoreError> {
        let mut g = self.inner.lock().await;
        if matches!(g.cluster.get(name), Some(lease) if lease.locked_by == instance) {
            g.cluster.remove(name);
        }
        Ok(())
    }

    async fn find_active_task(
        &self,
        reference_id: &str,
        task_type: TaskType,
    ) -> Result<Option<Task>, StoreError> {
        let g = self.inner.lock().await;
        Ok(g.tasks
            .values()
            .find(|t| {
                t.reference_id == reference_id && t.task_type == task_type && !t.status.is_terminal()
            })
            .cloned())
    }

    async fn list_by_reference(&self, reference_id: &str) -> Result<Vec<Task>, StoreError> {
        let g = self.inner.lock().await;
        let mut tasks: Vec<Task> = g
            .tasks
            .values()
            .filter(|t| t.reference_id == reference_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn search_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, StoreError> {
        let g = self.inner.lock().await;
        let mut tasks: Vec<Task> = g
            .tasks
            .values()
            .filter(|t| {
                query.task_type.map_or(true, |ty| t.task_type == ty)
                    && query.status.map_or(true, |s| t.status == s)
                    && query
                        .reference_id
                        .as_ref()
                        .map_or(true, |r| &t.reference_id == r)
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let start = (query.offset as usize).min(tasks.len());
        let end = (start + query.limit.max(1) as usize).min(tasks.len());
        Ok(tasks[start..end].to_vec())
    }

    async fn operator_update(
        &self,
        id: TaskId,
        expected_version: i64,
        update: OperatorUpdate,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut g = self.inner.lock().await;
        let Some(task) = g.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if task.version != expected_version || task.is_locked(now_ms) {
            return Ok(false);
        }
        task.status = update.status;
        if let Some(v) = update.scheduled_time {
            task.scheduled_time = v;
        }
        if let Some(v) = update.completed_at {
            task.completed_at = Some(v);
        }
        if let Some(v) = update.last_error {
            task.last_error = Some(v);
        }
        if update.clear_lock {
            task.locked_by = None;
            task.locked_until = None;
        }
        task.updated_at = now_ms;
        task.version += 1;
        Ok(true)
    }

    async fn status_counts(&self) -> Result<Vec<(TaskStatus, u64)>, StoreError> {
        let g = self.inner.lock().await;
        let mut counts: HashMap<TaskStatus, u64> = HashMap::new();
        for task in g.tasks.values() {
            *counts.entry(task.status).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn type_status_counts(&self) -> Result<Vec<(TaskType, TaskStatus, u64)>, StoreError> {
        let g = self.inner.lock().await;
        let mut counts: HashMap<(TaskType, TaskStatus), u64> = HashMap::new();
        for task in g.tasks.values() {
            *counts.entry((task.task_type, task.status)).or_default() += 1;
        }
        Ok(counts.into_iter().map(|((t, s), n)| (t, s, n)).collect())
    }

    async fn delete_finished_before(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let mut g = self.inner.lock().await;
        let doomed: Vec<TaskId> = g
            .tasks
            .values()
            .filter(|t| {
                t.status.is_terminal() && matches!(t.completed_at, Some(at) if at < cutoff_ms)
            })
            .map(|t| t.id)
            .collect();
        for id in &doomed {
            g.tasks.remove(id);
        }
        g.logs.retain(|l| !doomed.contains(&l.task_id));
        Ok(doomed.len() as u64)
    }
}
