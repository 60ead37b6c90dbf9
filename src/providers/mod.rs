//! Store abstraction for durable task state.
//!
//! A [`TaskStore`] is responsible for:
//! 1. **Persistence**: the task table and the append-only execution log.
//! 2. **Acquisition**: conditional-update task locking so that at most one
//!    replica executes a task at a time.
//! 3. **Cluster mutexes**: named leases that keep the poller and reaper
//!    singletons across replicas.
//!
//! The engine needs only four primitives from the backing database:
//! batch candidate selection, conditional update with version bump,
//! lease upsert, and read-your-writes within a replica. Anything offering
//! those can back a store implementation; `FOR UPDATE SKIP LOCKED` is an
//! optimization, not a requirement, because the per-task conditional
//! update is what guarantees exclusivity.
//!
//! # Atomic boundary
//!
//! [`TaskStore::commit_attempt`] is the one transactional boundary of an
//! execution: the log row close and the task row rewrite either both land
//! or both roll back. If a commit is lost, the task lock simply expires
//! and the stale-lock reaper recovers the row.

use async_trait::async_trait;
use serde_json::Value;

use crate::task::{ExecutionLog, NewExecutionLog, NewTask, Task, TaskId, TaskStatus, TaskType};

pub mod error;
pub mod in_memory;
pub mod sqlite;

pub use error::StoreError;

/// Terminal state + final field values written by [`TaskStore::commit_attempt`].
///
/// The executor computes the complete post-attempt row image; the store
/// writes it verbatim (plus `updated_at` and the version bump) so every
/// outcome branch converges on one code path.
#[derive(Debug, Clone)]
pub struct TaskCommit {
    pub status: TaskStatus,
    pub retry_count: u32,
    pub scheduled_time: i64,
    pub completed_at: Option<i64>,
    pub execution_duration_ms: Option<i64>,
    pub execution_result: Option<Value>,
    pub last_error: Option<String>,
    pub last_error_stack_trace: Option<String>,
}

/// Fields closing an execution-log row.
#[derive(Debug, Clone)]
pub struct AttemptClose {
    pub status: TaskStatus,
    pub completed_at: i64,
    pub duration_ms: i64,
    pub success: bool,
    pub error_message: Option<String>,
    pub error_stack_trace: Option<String>,
    pub error_type: Option<String>,
    pub http_status_code: Option<u16>,
    pub response_payload: Option<Value>,
}

/// Conditional write for operator-initiated transitions
/// (cancel / pause / resume / retry).
///
/// Applied only when the version matches and the row is not locked; a lost
/// race means an executor got there first and the operator must re-read.
#[derive(Debug, Clone)]
pub struct OperatorUpdate {
    pub status: TaskStatus,
    /// `Some` overwrites; `None` leaves the column untouched.
    pub scheduled_time: Option<i64>,
    pub completed_at: Option<i64>,
    pub last_error: Option<String>,
    pub clear_lock: bool,
}

/// Filter for management searches.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub task_type: Option<TaskType>,
    pub status: Option<TaskStatus>,
    pub reference_id: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

impl TaskQuery {
    pub fn new() -> Self {
        Self {
            limit: 50,
            ..Default::default()
        }
    }
}

/// Durable store contract (see module docs).
///
/// Implementations must be thread-safe: the poller, the reaper, executor
/// tasks, and management clients all call in concurrently.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Implementation name, for logs and diagnostics.
    fn name(&self) -> &str {
        "unknown"
    }

    // ===== Task rows =====

    /// Insert a fresh task. Status is `Pending`, or `Scheduled` when
    /// `scheduled_time` lies in the future.
    async fn insert_task(&self, new: NewTask) -> Result<Task, StoreError>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Select up to `limit` ready tasks ordered by (priority desc,
    /// scheduled_time asc).
    ///
    /// Predicate: executable status, due, unlocked or lock expired, not
    /// past `expires_at`. This is candidate selection only — winners are
    /// decided by [`acquire_task_lock`](Self::acquire_task_lock).
    async fn fetch_due_tasks(&self, now_ms: i64, limit: u32) -> Result<Vec<Task>, StoreError>;

    /// Atomically claim a task for execution.
    ///
    /// Succeeds only if the version still matches and the row is unlocked
    /// (or its lock expired). On success the row becomes
    /// `PROCESSING`/`started_at = now` with the lease and a version bump.
    /// Returns `false` on a lost race.
    async fn acquire_task_lock(
        &self,
        id: TaskId,
        expected_version: i64,
        instance: &str,
        lock_until_ms: i64,
        now_ms: i64,
    ) -> Result<bool, StoreError>;

    /// Clear the lock without changing status. Used when a claimed task
    /// turns out not to be executable after reload.
    async fn release_task_lock(&self, id: TaskId, instance: &str, now_ms: i64) -> Result<bool, StoreError>;

    /// Transition a claimed task to `Expired` and clear the lock.
    async fn mark_expired(&self, id: TaskId, instance: &str, now_ms: i64) -> Result<bool, StoreError>;

    // ===== Execution log =====

    /// Open an attempt row (`PROCESSING`, `success = false`).
    async fn open_attempt(&self, new: NewExecutionLog) -> Result<ExecutionLog, StoreError>;

    /// Close the attempt row and rewrite the task row in one transaction,
    /// conditional on `locked_by = instance`. Returns `false` (after
    /// rollback) if the lock was lost.
    async fn commit_attempt(
        &self,
        task_id: TaskId,
        instance: &str,
        log_id: i64,
        close: AttemptClose,
        commit: TaskCommit,
        now_ms: i64,
    ) -> Result<bool, StoreError>;

    async fn list_attempts(&self, task_id: TaskId) -> Result<Vec<ExecutionLog>, StoreError>;

    // ===== Stale locks =====

    /// Tasks still `PROCESSING` whose lock expired before `threshold_ms`.
    async fn find_stale_tasks(&self, threshold_ms: i64) -> Result<Vec<Task>, StoreError>;

    /// Bulk-reset stale tasks to `RETRY_PENDING` with a synthetic error and
    /// `scheduled_time = next_retry_ms`. Conditional on status =
    /// `PROCESSING`, which makes a repeated reap a no-op. Returns the
    /// number of rows reset.
    async fn reset_stale_tasks(
        &self,
        ids: &[TaskId],
        next_retry_ms: i64,
        now_ms: i64,
    ) -> Result<u64, StoreError>;

    // ===== Cluster mutex =====

    /// Acquire or renew the named cluster lease. Succeeds when the lease is
    /// free, expired, or already held by `instance`.
    async fn acquire_cluster_lock(
        &self,
        name: &str,
        instance: &str,
        lease_ms: i64,
        now_ms: i64,
    ) -> Result<bool, StoreError>;

    /// Release the named lease if held by `instance`.
    async fn release_cluster_lock(&self, name: &str, instance: &str) -> Result<(), StoreError>;

    // ===== Management =====

    /// The live (non-terminal) task for a `(reference_id, type)` pair, if any.
    async fn find_active_task(
        &self,
        reference_id: &str,
        task_type: TaskType,
    ) -> Result<Option<Task>, StoreError>;

    /// All tasks for a reference, newest first.
    async fn list_by_reference(&self, reference_id: &str) -> Result<Vec<Task>, StoreError>;

    async fn search_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, StoreError>;

    /// Version-checked operator transition. Returns `false` on conflict.
    async fn operator_update(
        &self,
        id: TaskId,
        expected_version: i64,
        update: OperatorUpdate,
        now_ms: i64,
    ) -> Result<bool, StoreError>;

    /// Row counts grouped by status.
    async fn status_counts(&self) -> Result<Vec<(TaskStatus, u64)>, StoreError>;

    /// Row counts grouped by (type, status).
    async fn type_status_counts(&self) -> Result<Vec<(TaskType, TaskStatus, u64)>, StoreError>;

    /// Retention sweep: delete terminal tasks completed before `cutoff_ms`
    /// together with their execution logs. Returns deleted task count.
    async fn delete_finished_before(&self, cutoff_ms: i64) -> Result<u64, StoreError>;
}
