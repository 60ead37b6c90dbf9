//! SQLite-backed task store.
//!
//! Timestamps are epoch-millis integers, JSON documents are TEXT columns,
//! and the schema is bootstrapped on connect with `CREATE TABLE IF NOT
//! EXISTS` so in-memory databases (tests) and fresh files work without a
//! migration step.
//!
//! SQLite has no `FOR UPDATE SKIP LOCKED`; `fetch_due_tasks` is plain
//! candidate selection and exclusivity comes from the conditional update in
//! `acquire_task_lock` (the lease-table substitution allowed by the store
//! contract). The cluster mutex uses an upsert whose WHERE clause only
//! fires for free, expired, or self-held leases.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use super::{AttemptClose, OperatorUpdate, StoreError, TaskCommit, TaskQuery, TaskStore};
use crate::task::{
    ExecutionLog, NewExecutionLog, NewTask, Task, TaskId, TaskPriority, TaskStatus, TaskType,
};

pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Connect and bootstrap the schema.
    ///
    /// `database_url` accepts e.g. `sqlite:./tasks.db` or `sqlite::memory:`.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        if database_url.contains(":memory:") || database_url.contains("mode=memory") {
            // A multi-connection pool would give each connection its own
            // private in-memory database.
            return Self::new_in_memory().await;
        }
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests and local development.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        // A single connection keeps every handle on the same in-memory db.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 5,
                reference_id TEXT NOT NULL,
                secondary_reference_id TEXT,
                description TEXT,
                payload TEXT NOT NULL DEFAULT '{}',
                metadata TEXT NOT NULL DEFAULT '{}',
                scheduled_time INTEGER NOT NULL,
                expires_at INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER,
                retry_delay_hours INTEGER,
                cron_expression TEXT,
                last_error TEXT,
                last_error_stack_trace TEXT,
                execution_result TEXT,
                locked_by TEXT,
                locked_until INTEGER,
                version INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                created_by TEXT,
                started_at INTEGER,
                completed_at INTEGER,
                execution_duration_ms INTEGER
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                attempt_number INTEGER NOT NULL,
                status TEXT NOT NULL,
                executor_instance TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                completed_at INTEGER,
                duration_ms INTEGER,
                success INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                error_stack_trace TEXT,
                error_type TEXT,
                http_status_code INTEGER,
                request_payload TEXT,
                response_payload TEXT,
                notes TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cluster_locks (
                name TEXT PRIMARY KEY,
                locked_by TEXT NOT NULL,
                locked_at INTEGER NOT NULL,
                lock_until INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status_scheduled ON tasks(status, scheduled_time)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_priority_scheduled ON tasks(priority DESC, scheduled_time ASC)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_reference ON tasks(reference_id)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_locked ON tasks(locked_by, locked_until) WHERE locked_by IS NOT NULL")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_logs_task ON execution_logs(task_id)")
            .execute(pool)
            .await?;
        Ok(())
    }
}

/// Classify a sqlx error: lock contention and I/O are worth retrying,
/// everything else is treated as permanent.
fn db_err(operation: &str, e: sqlx::Error) -> StoreError {
    let retryable = match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let msg = db.message().to_lowercase();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    };
    if retryable {
        StoreError::retryable(operation, e.to_string())
    } else {
        StoreError::permanent(operation, e.to_string())
    }
}

fn row_to_task(row: &SqliteRow) -> Result<Task, StoreError> {
    let op = "row_to_task";
    let id: String = row.try_get("id").map_err(|e| db_err(op, e))?;
    let task_type: String = row.try_get("task_type").map_err(|e| db_err(op, e))?;
    let status: String = row.try_get("status").map_err(|e| db_err(op, e))?;
    let payload: String = row.try_get("payload").map_err(|e| db_err(op, e))?;
    let metadata: String = row.try_get("metadata").map_err(|e| db_err(op, e))?;
    let execution_result: Option<String> = row.try_get("execution_result").map_err(|e| db_err(op, e))?;

    Ok(Task {
        id: TaskId::parse(&id).ok_or_else(|| StoreError::permanent(op, format!("bad task id: {id}")))?,
        task_type: TaskType::parse(&task_type)
            .ok_or_else(|| StoreError::permanent(op, format!("unknown task type: {task_type}")))?,
        status: TaskStatus::parse(&status)
            .ok_or_else(|| StoreError::permanent(op, format!("unknown status: {status}")))?,
        priority: TaskPriority::from_value(row.try_get("priority").map_err(|e| db_err(op, e))?),
        reference_id: row.try_get("reference_id").map_err(|e| db_err(op, e))?,
        secondary_reference_id: row.try_get("secondary_reference_id").map_err(|e| db_err(op, e))?,
        description: row.try_get("description").map_err(|e| db_err(op, e))?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| StoreError::permanent(op, format!("bad payload json: {e}")))?,
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| StoreError::permanent(op, format!("bad metadata json: {e}")))?,
        scheduled_time: row.try_get("scheduled_time").map_err(|e| db_err(op, e))?,
        expires_at: row.try_get("expires_at").map_err(|e| db_err(op, e))?,
        retry_count: row.try_get::<i64, _>("retry_count").map_err(|e| db_err(op, e))? as u32,
        max_retries: row
            .try_get::<Option<i64>, _>("max_retries")
            .map_err(|e| db_err(op, e))?
            .map(|v| v as u32),
        retry_delay_hours: row
            .try_get::<Option<i64>, _>("retry_delay_hours")
            .map_err(|e| db_err(op, e))?
            .map(|v| v as u32),
        cron_expression: row.try_get("cron_expression").map_err(|e| db_err(op, e))?,
        last_error: row.try_get("last_error").map_err(|e| db_err(op, e))?,
        last_error_stack_trace: row.try_get("last_error_stack_trace").map_err(|e| db_err(op, e))?,
        execution_result: match execution_result {
            Some(s) => Some(
                serde_json::from_str(&s)
                    .map_err(|e| StoreError::permanent(op, format!("bad result json: {e}")))?,
            ),
            None => None,
        },
        locked_by: row.try_get("locked_by").map_err(|e| db_err(op, e))?,
        locked_until: row.try_get("locked_until").map_err(|e| db_err(op, e))?,
        version: row.try_get("version").map_err(|e| db_err(op, e))?,
        created_at: row.try_get("created_at").map_err(|e| db_err(op, e))?,
        updated_at: row.try_get("updated_at").map_err(|e| db_err(op, e))?,
        created_by: row.try_get("created_by").map_err(|e| db_err(op, e))?,
        started_at: row.try_get("started_at").map_err(|e| db_err(op, e))?,
        completed_at: row.try_get("completed_at").map_err(|e| db_err(op, e))?,
        execution_duration_ms: row.try_get("execution_duration_ms").map_err(|e| db_err(op, e))?,
    })
}

fn row_to_log(row: &SqliteRow) -> Result<ExecutionLog, StoreError> {
    let op = "row_to_log";
    let task_id: String = row.try_get("task_id").map_err(|e| db_err(op, e))?;
    let status: String = row.try_get("status").map_err(|e| db_err(op, e))?;
    let request_payload: Option<String> = row.try_get("request_payload").map_err(|e| db_err(op, e))?;
    let response_payload: Option<String> = row.try_get("response_payload").map_err(|e| db_err(op, e))?;
    Ok(ExecutionLog {
        id: row.try_get("id").map_err(|e| db_err(op, e))?,
        task_id: TaskId::parse(&task_id)
            .ok_or_else(|| StoreError::permanent(op, format!("bad task id: {task_id}")))?,
        attempt_number: row.try_get::<i64, _>("attempt_number").map_err(|e| db_err(op, e))? as u32,
        status: TaskStatus::parse(&status)
            .ok_or_else(|| StoreError::permanent(op, format!("unknown status: {status}")))?,
        executor_instance: row.try_get("executor_instance").map_err(|e| db_err(op, e))?,
        started_at: row.try_get("started_at").map_err(|e| db_err(op, e))?,
        completed_at: row.try_get("completed_at").map_err(|e| db_err(op, e))?,
        duration_ms: row.try_get("duration_ms").map_err(|e| db_err(op, e))?,
        success: row.try_get::<i64, _>("success").map_err(|e| db_err(op, e))? != 0,
        error_message: row.try_get("error_message").map_err(|e| db_err(op, e))?,
        error_stack_trace: row.try_get("error_stack_trace").map_err(|e| db_err(op, e))?,
        error_type: row.try_get("error_type").map_err(|e| db_err(op, e))?,
        http_status_code: row
            .try_get::<Option<i64>, _>("http_status_code")
            .map_err(|e| db_err(op, e))?
            .map(|v| v as u16),
        request_payload: match request_payload {
            Some(s) => serde_json::from_str(&s).ok(),
            None => None,
        },
        response_payload: match response_payload {
            Some(s) => serde_json::from_str(&s).ok(),
            None => None,
        },
        notes: row.try_get("notes").map_err(|e| db_err(op, e))?,
        created_at: row.try_get("created_at").map_err(|e| db_err(op, e))?,
    })
}

#[async_trait::async_trait]
impl TaskStore for SqliteTaskStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn insert_task(&self, new: NewTask) -> Result<Task, StoreError> {
        let op = "insert_task";
        let now = crate::task::now_ms();
        let id = TaskId::new();
        let scheduled_time = new.scheduled_time.unwrap_or(now);
        let status = if scheduled_time > now {
            TaskStatus::Scheduled
        } else {
            TaskStatus::Pending
        };
        let payload = serde_json::to_string(&new.payload)
            .map_err(|e| StoreError::permanent(op, e.to_string()))?;
        let metadata = serde_json::to_string(&new.metadata)
            .map_err(|e| StoreError::permanent(op, e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, task_type, status, priority, reference_id,
                secondary_reference_id, description, payload, metadata,
                scheduled_time, expires_at, retry_count, max_retries,
                retry_delay_hours, cron_expression, version,
                created_at, updated_at, created_by
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, 0, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(new.task_type.as_str())
        .bind(status.as_str())
        .bind(new.priority.value())
        .bind(&new.reference_id)
        .bind(&new.secondary_reference_id)
        .bind(&new.description)
        .bind(payload)
        .bind(metadata)
        .bind(scheduled_time)
        .bind(new.expires_at)
        .bind(new.max_retries.map(|v| v as i64))
        .bind(new.retry_delay_hours.map(|v| v as i64))
        .bind(&new.cron_expression)
        .bind(now)
        .bind(now)
        .bind(&new.created_by)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err(op, e))?;

        self.get_task(id)
            .await?
            .ok_or_else(|| StoreError::permanent(op, "inserted row not readable"))
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("get_task", e))?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn fetch_due_tasks(&self, now_ms: i64, limit: u32) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE status IN ('PENDING', 'SCHEDULED', 'FAILED', 'RETRY_PENDING')
              AND scheduled_time <= ?1
              AND (locked_by IS NULL OR locked_until < ?1)
              AND (expires_at IS NULL OR expires_at > ?1)
            ORDER BY priority DESC, scheduled_time ASC
            LIMIT ?2
            "#,
        )
        .bind(now_ms)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("fetch_due_tasks", e))?;
        rows.iter().map(row_to_task).collect()
    }

    async fn acquire_task_lock(
        &self,
        id: TaskId,
        expected_version: i64,
        instance: &str,
        lock_until_ms: i64,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                locked_by = ?1,
                locked_until = ?2,
                status = 'PROCESSING',
                started_at = ?3,
                updated_at = ?3,
                version = version + 1
            WHERE id = ?4
              AND version = ?5
              AND (locked_by IS NULL OR locked_until < ?3)
            "#,
        )
        .bind(instance)
        .bind(lock_until_ms)
        .bind(now_ms)
        .bind(id.to_string())
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("acquire_task_lock", e))?;

        let acquired = result.rows_affected() == 1;
        debug!(task_id = %id, instance, acquired, "task lock acquisition");
        Ok(acquired)
    }

    async fn release_task_lock(&self, id: TaskId, instance: &str, now_ms: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                locked_by = NULL,
                locked_until = NULL,
                updated_at = ?1,
                version = version + 1
            WHERE id = ?2 AND locked_by = ?3
            "#,
        )
        .bind(now_ms)
        .bind(id.to_string())
        .bind(instance)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("release_task_lock", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_expired(&self, id: TaskId, instance: &str, now_ms: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = 'EXPIRED',
                completed_at = ?1,
                locked_by = NULL,
                locked_until = NULL,
                updated_at = ?1,
                version = version + 1
            WHERE id = ?2 AND locked_by = ?3
            "#,
        )
        .bind(now_ms)
        .bind(id.to_string())
        .bind(instance)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("mark_expired", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn open_attempt(&self, new: NewExecutionLog) -> Result<ExecutionLog, StoreError> {
        let op = "open_attempt";
        let now = crate::task::now_ms();
        let request_payload = new
            .request_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::permanent(op, e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO execution_logs (
                task_id, attempt_number, status, executor_instance,
                started_at, success, request_payload, created_at
            ) VALUES (?, ?, 'PROCESSING', ?, ?, 0, ?, ?)
            "#,
        )
        .bind(new.task_id.to_string())
        .bind(new.attempt_number as i64)
        .bind(&new.executor_instance)
        .bind(new.started_at)
        .bind(request_payload)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err(op, e))?;

        Ok(ExecutionLog {
            id: result.last_insert_rowid(),
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
            created_at: now,
        })
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
        let op = "commit_attempt";
        let response_payload = close
            .response_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::permanent(op, e.to_string()))?;
        let execution_result = commit
            .execution_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::permanent(op, e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(|e| db_err(op, e))?;

        sqlx::query(
            r#"
            UPDATE execution_logs SET
                status = ?, completed_at = ?, duration_ms = ?, success = ?,
                error_message = ?, error_stack_trace = ?, error_type = ?,
                http_status_code = ?, response_payload = ?
            WHERE id = ?
            "#,
        )
        .bind(close.status.as_str())
        .bind(close.completed_at)
        .bind(close.duration_ms)
        .bind(close.success as i64)
        .bind(&close.error_message)
        .bind(&close.error_stack_trace)
        .bind(&close.error_type)
        .bind(close.http_status_code.map(|v| v as i64))
        .bind(response_payload)
        .bind(log_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err(op, e))?;

        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = ?, retry_count = ?, scheduled_time = ?,
                completed_at = ?, execution_duration_ms = ?,
                execution_result = ?, last_error = ?,
                last_error_stack_trace = ?,
                locked_by = NULL, locked_until = NULL,
                updated_at = ?, version = version + 1
            WHERE id = ? AND locked_by = ?
            "#,
        )
        .bind(commit.status.as_str())
        .bind(commit.retry_count as i64)
        .bind(commit.scheduled_time)
        .bind(commit.completed_at)
        .bind(commit.execution_duration_ms)
        .bind(execution_result)
        .bind(&commit.last_error)
        .bind(&commit.last_error_stack_trace)
        .bind(now_ms)
        .bind(task_id.to_string())
        .bind(instance)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err(op, e))?;

        if result.rows_affected() != 1 {
            // Lock lost between execution and commit. Roll everything back
            // and let the reaper account for the interrupted attempt.
            tx.rollback().await.map_err(|e| db_err(op, e))?;
            return Ok(false);
        }

        tx.commit().await.map_err(|e| db_err(op, e))?;
        Ok(true)
    }

    async fn list_attempts(&self, task_id: TaskId) -> Result<Vec<ExecutionLog>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_logs WHERE task_id = ? ORDER BY attempt_number DESC",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list_attempts", e))?;
        rows.iter().map(row_to_log).collect()
    }

    async fn find_stale_tasks(&self, threshold_ms: i64) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE locked_by IS NOT NULL
              AND status = 'PROCESSING'
              AND locked_until < ?
            "#,
        )
        .bind(threshold_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("find_stale_tasks", e))?;
        rows.iter().map(row_to_task).collect()
    }

    async fn reset_stale_tasks(
        &self,
        ids: &[TaskId],
        next_retry_ms: i64,
        now_ms: i64,
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            r#"
            UPDATE tasks SET
                locked_by = NULL,
                locked_until = NULL,
                status = 'RETRY_PENDING',
                last_error = 'Task execution timed out or instance crashed',
                scheduled_time = ?,
                updated_at = ?,
                version = version + 1
            WHERE id IN ({placeholders}) AND status = 'PROCESSING'
            "#
        );
        let mut query = sqlx::query(&sql).bind(next_retry_ms).bind(now_ms);
        for id in ids {
            query = query.bind(id.to_string());
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("reset_stale_tasks", e))?;
        Ok(result.rows_affected())
    }

    async fn acquire_cluster_lock(
        &self,
        name: &str,
        instance: &str,
        lease_ms: i64,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO cluster_locks (name, locked_by, locked_at, lock_until)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(name) DO UPDATE SET
                locked_by = excluded.locked_by,
                locked_at = excluded.locked_at,
                lock_until = excluded.lock_until
            WHERE cluster_locks.lock_until <= excluded.locked_at
               OR cluster_locks.locked_by = excluded.locked_by
            "#,
        )
        .bind(name)
        .bind(instance)
        .bind(now_ms)
        .bind(now_ms + lease_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("acquire_cluster_lock", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_cluster_lock(&self, name: &str, instance: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM cluster_locks WHERE name = ? AND locked_by = ?")
            .bind(name)
            .bind(instance)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("release_cluster_lock", e))?;
        Ok(())
    }

    async fn find_active_task(
        &self,
        reference_id: &str,
        task_type: TaskType,
    ) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE reference_id = ?
              AND task_type = ?
              AND status NOT IN ('COMPLETED', 'CANCELLED', 'EXPIRED',
                                 'MAX_RETRIES_EXCEEDED', 'DEAD_LETTER')
            LIMIT 1
            "#,
        )
        .bind(reference_id)
        .bind(task_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("find_active_task", e))?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn list_by_reference(&self, reference_id: &str) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE reference_id = ? ORDER BY created_at DESC")
            .bind(reference_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("list_by_reference", e))?;
        rows.iter().map(row_to_task).collect()
    }

    async fn search_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, StoreError> {
        let mut sql = String::from("SELECT * FROM tasks WHERE 1 = 1");
        if query.task_type.is_some() {
            sql.push_str(" AND task_type = ?");
        }
        if query.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if query.reference_id.is_some() {
            sql.push_str(" AND reference_id = ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&sql);
        if let Some(t) = query.task_type {
            q = q.bind(t.as_str());
        }
        if let Some(s) = query.status {
            q = q.bind(s.as_str());
        }
        if let Some(r) = &query.reference_id {
            q = q.bind(r);
        }
        q = q.bind(query.limit.max(1) as i64).bind(query.offset as i64);

        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("search_tasks", e))?;
        rows.iter().map(row_to_task).collect()
    }

    async fn operator_update(
        &self,
        id: TaskId,
        expected_version: i64,
        update: OperatorUpdate,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut sql = String::from("UPDATE tasks SET status = ?, updated_at = ?, version = version + 1");
        if update.scheduled_time.is_some() {
            sql.push_str(", scheduled_time = ?");
        }
        if update.completed_at.is_some() {
            sql.push_str(", completed_at = ?");
        }
        if update.last_error.is_some() {
            sql.push_str(", last_error = ?");
        }
        if update.clear_lock {
            sql.push_str(", locked_by = NULL, locked_until = NULL");
        }
        // Operator writes only land on unlocked rows with a matching version.
        sql.push_str(" WHERE id = ? AND version = ? AND (locked_by IS NULL OR locked_until < ?)");

        let mut q = sqlx::query(&sql).bind(update.status.as_str()).bind(now_ms);
        if let Some(v) = update.scheduled_time {
            q = q.bind(v);
        }
        if let Some(v) = update.completed_at {
            q = q.bind(v);
        }
        if let Some(v) = &update.last_error {
            q = q.bind(v);
        }
        q = q.bind(id.to_string()).bind(expected_version).bind(now_ms);

        let result = q
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("operator_update", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn status_counts(&self) -> Result<Vec<(TaskStatus, u64)>, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("status_counts", e))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let status: String = row.try_get("status").map_err(|e| db_err("status_counts", e))?;
            let n: i64 = row.try_get("n").map_err(|e| db_err("status_counts", e))?;
            if let Some(status) = TaskStatus::parse(&status) {
                out.push((status, n as u64));
            }
        }
        Ok(out)
    }

    async fn type_status_counts(&self) -> Result<Vec<(TaskType, TaskStatus, u64)>, StoreError> {
        let rows = sqlx::query(
            "SELECT task_type, status, COUNT(*) AS n FROM tasks GROUP BY task_type, status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("type_status_counts", e))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let task_type: String = row.try_get("task_type").map_err(|e| db_err("type_status_counts", e))?;
            let status: String = row.try_get("status").map_err(|e| db_err("type_status_counts", e))?;
            let n: i64 = row.try_get("n").map_err(|e| db_err("type_status_counts", e))?;
            if let (Some(t), Some(s)) = (TaskType::parse(&task_type), TaskStatus::parse(&status)) {
                out.push((t, s, n as u64));
            }
        }
        Ok(out)
    }

    async fn delete_finished_before(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let op = "delete_finished_before";
        let mut tx = self.pool.begin().await.map_err(|e| db_err(op, e))?;

        sqlx::query(
            r#"
            DELETE FROM execution_logs WHERE task_id IN (
                SELECT id FROM tasks
                WHERE status IN ('COMPLETED', 'CANCELLED', 'EXPIRED',
                                 'MAX_RETRIES_EXCEEDED', 'DEAD_LETTER')
                  AND completed_at IS NOT NULL AND completed_at < ?
            )
            "#,
        )
        .bind(cutoff_ms)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err(op, e))?;

        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE status IN ('COMPLETED', 'CANCELLED', 'EXPIRED',
                             'MAX_RETRIES_EXCEEDED', 'DEAD_LETTER')
              AND completed_at IS NOT NULL AND completed_at < ?
            "#,
        )
        .bind(cutoff_ms)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err(op, e))?;

        tx.commit().await.map_err(|e| db_err(op, e))?;
        Ok(result.rows_affected())
    }
}
