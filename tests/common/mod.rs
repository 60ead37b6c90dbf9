//! Shared helpers for integration tests: scripted handlers, a recording
//! alert sink, and runtime/store setup.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use redrive::alert::AlertSink;
use redrive::handlers::{with_jitter, TaskExecutionResult, TaskHandler, ValidationError};
use redrive::providers::in_memory::InMemoryTaskStore;
use redrive::providers::sqlite::SqliteTaskStore;
use redrive::providers::{OperatorUpdate, TaskStore};
use redrive::runtime::{HandlerRegistry, Runtime};
use redrive::task::{now_ms, Task, TaskId, TaskType};
use redrive::SchedulerOptions;

pub const HOUR_MS: i64 = 3_600_000;

/// Options for tests that drive `poll_once` / `reap_stale_tasks` manually:
/// background loops tick far in the future and never interfere.
pub fn manual_options() -> SchedulerOptions {
    SchedulerOptions {
        poll_interval: Duration::from_secs(3600),
        stale_check_interval: Duration::from_secs(3600),
        shutdown_grace: Duration::from_secs(1),
        ..Default::default()
    }
}

pub async fn sqlite_store() -> Arc<SqliteTaskStore> {
    Arc::new(SqliteTaskStore::new_in_memory().await.expect("sqlite store"))
}

pub fn memory_store() -> Arc<InMemoryTaskStore> {
    Arc::new(InMemoryTaskStore::new())
}

/// One scripted attempt outcome.
pub enum StubOutcome {
    Result(TaskExecutionResult),
    Panic(String),
}

/// Handler that replays a script of outcomes and then a fallback, while
/// counting invocations. `retry_delay_ms` pins the backoff for tests that
/// assert schedules exactly.
pub struct StubHandler {
    task_type: TaskType,
    script: std::sync::Mutex<VecDeque<StubOutcome>>,
    fallback: TaskExecutionResult,
    pub calls: AtomicU32,
    retry_delay_ms: Option<i64>,
    validation_error: Option<String>,
}

impl StubHandler {
    pub fn succeeding(task_type: TaskType) -> Self {
        Self::with_fallback(task_type, TaskExecutionResult::success())
    }

    pub fn with_fallback(task_type: TaskType, fallback: TaskExecutionResult) -> Self {
        Self {
            task_type,
            script: std::sync::Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicU32::new(0),
            retry_delay_ms: None,
            validation_error: None,
        }
    }

    pub fn script(self, outcomes: Vec<StubOutcome>) -> Self {
        *self.script.lock().unwrap() = outcomes.into();
        self
    }

    pub fn retry_delay_ms(mut self, delay_ms: i64) -> Self {
        self.retry_delay_ms = Some(delay_ms);
        self
    }

    pub fn failing_validation(mut self, message: &str) -> Self {
        self.validation_error = Some(message.to_string());
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for StubHandler {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    fn validate(&self, task: &Task) -> Result<(), ValidationError> {
        if let Some(message) = &self.validation_error {
            return Err(ValidationError::new(message.clone()));
        }
        if task.reference_id.trim().is_empty() {
            return Err(ValidationError::new("Task reference ID is required"));
        }
        Ok(())
    }

    async fn execute(&self, _task: &Task) -> TaskExecutionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(StubOutcome::Result(result)) => result,
            Some(StubOutcome::Panic(message)) => panic!("{message}"),
            None => self.fallback.clone(),
        }
    }

    fn next_retry_delay_ms(&self, task: &Task, default_delay_hours: u32) -> i64 {
        match self.retry_delay_ms {
            Some(delay) => delay,
            None => with_jitter(
                task.effective_retry_delay_hours(default_delay_hours) as i64 * HOUR_MS,
            ),
        }
    }
}

/// Handler with the 1 h / 2 h / 4 h exponential ladder, for schedule
/// window assertions.
pub struct LadderHandler {
    inner: StubHandler,
}

impl LadderHandler {
    pub fn new(task_type: TaskType, fallback: TaskExecutionResult) -> Self {
        Self {
            inner: StubHandler::with_fallback(task_type, fallback),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.inner.call_count()
    }
}

#[async_trait]
impl TaskHandler for LadderHandler {
    fn task_type(&self) -> TaskType {
        self.inner.task_type()
    }

    async fn execute(&self, task: &Task) -> TaskExecutionResult {
        self.inner.execute(task).await
    }

    fn next_retry_delay_ms(&self, task: &Task, default_delay_hours: u32) -> i64 {
        if task.retry_count < 3 {
            return with_jitter(HOUR_MS << task.retry_count);
        }
        with_jitter(default_delay_hours as i64 * HOUR_MS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertEvent {
    MaxRetriesExceeded { task_id: TaskId },
    TaskFailure { task_id: TaskId, error: String },
    EngineError { title: String },
}

/// Sink that records every alert for assertions.
#[derive(Default)]
pub struct RecordingAlerts {
    events: std::sync::Mutex<Vec<AlertEvent>>,
}

impl RecordingAlerts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn max_retries_exceeded(&self, task: &Task) {
        self.events
            .lock()
            .unwrap()
            .push(AlertEvent::MaxRetriesExceeded { task_id: task.id });
    }

    async fn task_failure(&self, task: &Task, error: &str) {
        self.events.lock().unwrap().push(AlertEvent::TaskFailure {
            task_id: task.id,
            error: error.to_string(),
        });
    }

    async fn engine_error(&self, title: &str, _message: &str, _details: Option<&str>) {
        self.events.lock().unwrap().push(AlertEvent::EngineError {
            title: title.to_string(),
        });
    }
}

pub async fn start_runtime(
    store: Arc<dyn TaskStore>,
    handlers: Vec<Arc<dyn TaskHandler>>,
    alerts: Arc<dyn AlertSink>,
    options: SchedulerOptions,
) -> Arc<Runtime> {
    let mut builder = HandlerRegistry::builder();
    for handler in handlers {
        builder = builder.register(handler);
    }
    Runtime::start_with_store(store, Arc::new(builder.build()), alerts, options).await
}

/// Make an existing task eligible for the next poll (status permitting).
pub async fn make_due(store: &dyn TaskStore, id: TaskId) {
    let task = store.get_task(id).await.unwrap().expect("task exists");
    let update = OperatorUpdate {
        status: task.status,
        scheduled_time: Some(now_ms() - 1_000),
        completed_at: None,
        last_error: None,
        clear_lock: false,
    };
    let applied = store
        .operator_update(id, task.version, update, now_ms())
        .await
        .unwrap();
    assert!(applied, "make_due lost a race");
}

/// Let spawned fire-and-forget work (alerts) settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
