//! Domain model: tasks, execution logs, and their lifecycle vocabulary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Current wall-clock time as unix milliseconds.
///
/// All persisted timestamps in the store are epoch-millis integers.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Opaque task identifier (UUID v4 under the hood).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The closed set of task types this deployment can execute.
///
/// Each type maps to exactly one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    /// Cancel an order in the order service.
    OrderCancel,
    /// Refund a payment in full through the payment service.
    PaymentRefund,
    /// Refund part of a payment.
    PaymentPartialRefund,
    /// Void a pending payment authorization.
    PaymentVoid,
    /// Deliver a webhook notification.
    WebhookNotification,
    /// Extension point for deployment-specific handlers.
    Custom,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::OrderCancel,
        TaskType::PaymentRefund,
        TaskType::PaymentPartialRefund,
        TaskType::PaymentVoid,
        TaskType::WebhookNotification,
        TaskType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::OrderCancel => "ORDER_CANCEL",
            TaskType::PaymentRefund => "PAYMENT_REFUND",
            TaskType::PaymentPartialRefund => "PAYMENT_PARTIAL_REFUND",
            TaskType::PaymentVoid => "PAYMENT_VOID",
            TaskType::WebhookNotification => "WEBHOOK_NOTIFICATION",
            TaskType::Custom => "CUSTOM",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            TaskType::OrderCancel => "Order Cancellation",
            TaskType::PaymentRefund => "Payment Refund",
            TaskType::PaymentPartialRefund => "Partial Payment Refund",
            TaskType::PaymentVoid => "Payment Void",
            TaskType::WebhookNotification => "Webhook Notification",
            TaskType::Custom => "Custom Task",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        TaskType::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution priority. Higher values run first within a poll batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// Numeric weight used for ordering in the store (`ORDER BY priority DESC`).
    pub fn value(&self) -> i32 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Normal => 5,
            TaskPriority::High => 8,
            TaskPriority::Critical => 10,
        }
    }

    pub fn from_value(v: i32) -> Self {
        match v {
            1 => TaskPriority::Low,
            8 => TaskPriority::High,
            10 => TaskPriority::Critical,
            _ => TaskPriority::Normal,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

/// Task lifecycle states.
///
/// Terminal states are never re-read for execution and never transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Created and waiting to be picked up.
    Pending,
    /// Waiting for a future `scheduled_time`.
    Scheduled,
    /// Locked by an executor and currently running.
    Processing,
    /// Finished successfully. Terminal.
    Completed,
    /// Last attempt failed; eligible for re-fetch.
    Failed,
    /// Waiting for its next retry at `scheduled_time`.
    RetryPending,
    /// Retry ceiling reached. Terminal; needs manual intervention.
    MaxRetriesExceeded,
    /// Cancelled by an operator. Terminal.
    Cancelled,
    /// Suspended by an operator; resumable.
    Paused,
    /// Deadline passed before execution. Terminal.
    Expired,
    /// Permanently failed; parked for investigation. Terminal.
    DeadLetter,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 11] = [
        TaskStatus::Pending,
        TaskStatus::Scheduled,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::RetryPending,
        TaskStatus::MaxRetriesExceeded,
        TaskStatus::Cancelled,
        TaskStatus::Paused,
        TaskStatus::Expired,
        TaskStatus::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Scheduled => "SCHEDULED",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::RetryPending => "RETRY_PENDING",
            TaskStatus::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Expired => "EXPIRED",
            TaskStatus::DeadLetter => "DEAD_LETTER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        TaskStatus::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// Eligible to be picked up by the poller.
    pub fn is_executable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Scheduled | TaskStatus::Failed | TaskStatus::RetryPending
        )
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Cancelled
                | TaskStatus::Expired
                | TaskStatus::MaxRetriesExceeded
                | TaskStatus::DeadLetter
        )
    }

    /// Failure states that an operator may manually retry.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::MaxRetriesExceeded | TaskStatus::DeadLetter
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted task row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// Business entity this task operates on (order id, payment id, ...).
    pub reference_id: String,
    /// Secondary correlation id (e.g. transaction id for a refund).
    pub secondary_reference_id: Option<String>,
    pub description: Option<String>,
    /// Handler input data.
    pub payload: Value,
    /// Control knobs (per-task retry overrides, endpoints, ...).
    pub metadata: Value,
    /// Earliest eligible execution time (unix millis).
    pub scheduled_time: i64,
    /// Abandon the task once this deadline passes.
    pub expires_at: Option<i64>,
    pub retry_count: u32,
    pub max_retries: Option<u32>,
    pub retry_delay_hours: Option<u32>,
    /// Reserved for recurring tasks; execution of the schedule is external.
    pub cron_expression: Option<String>,
    pub last_error: Option<String>,
    pub last_error_stack_trace: Option<String>,
    pub execution_result: Option<Value>,
    pub locked_by: Option<String>,
    pub locked_until: Option<i64>,
    /// Optimistic-concurrency counter; strictly increases on every write.
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub created_by: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub execution_duration_ms: Option<i64>,
}

impl Task {
    /// Task-specific retry ceiling, or the configured default.
    pub fn effective_max_retries(&self, default_max_retries: u32) -> u32 {
        self.max_retries.unwrap_or(default_max_retries)
    }

    /// Task-specific backoff base in hours, or the configured default.
    pub fn effective_retry_delay_hours(&self, default_retry_delay_hours: u32) -> u32 {
        self.retry_delay_hours.unwrap_or(default_retry_delay_hours)
    }

    pub fn is_locked(&self, now_ms: i64) -> bool {
        match (&self.locked_by, self.locked_until) {
            (Some(_), Some(until)) => until > now_ms,
            _ => false,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_ms)
    }

    /// Read a string out of the payload object, with a fallback.
    pub fn payload_str(&self, key: &str, default: &str) -> String {
        match self.payload.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => default.to_string(),
            Some(other) => other.to_string(),
        }
    }

    /// Read an unsigned integer out of the metadata object.
    pub fn metadata_u32(&self, key: &str) -> Option<u32> {
        self.metadata.get(key).and_then(Value::as_u64).map(|v| v as u32)
    }
}

/// Everything needed to insert a fresh task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub reference_id: String,
    pub secondary_reference_id: Option<String>,
    pub description: Option<String>,
    pub payload: Value,
    pub metadata: Value,
    /// Defaults to now; a future time starts the task in `Scheduled`.
    pub scheduled_time: Option<i64>,
    pub expires_at: Option<i64>,
    pub max_retries: Option<u32>,
    pub retry_delay_hours: Option<u32>,
    pub cron_expression: Option<String>,
    pub created_by: Option<String>,
}

impl NewTask {
    pub fn new(task_type: TaskType, reference_id: impl Into<String>) -> Self {
        Self {
            task_type,
            priority: TaskPriority::Normal,
            reference_id: reference_id.into(),
            secondary_reference_id: None,
            description: None,
            payload: Value::Object(Default::default()),
            metadata: Value::Object(Default::default()),
            scheduled_time: None,
            expires_at: None,
            max_retries: None,
            retry_delay_hours: None,
            cron_expression: None,
            created_by: None,
        }
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn scheduled_at(mut self, at_ms: i64) -> Self {
        self.scheduled_time = Some(at_ms);
        self
    }

    pub fn expires_at(mut self, at_ms: i64) -> Self {
        self.expires_at = Some(at_ms);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }
}

/// Maximum bytes of error detail persisted per attempt.
pub const ERROR_DETAIL_CAP: usize = 4096;

/// Truncate an error detail blob to [`ERROR_DETAIL_CAP`] at a char boundary.
pub fn truncate_error_detail(detail: &str) -> String {
    if detail.len() <= ERROR_DETAIL_CAP {
        return detail.to_string();
    }
    let mut cut = ERROR_DETAIL_CAP;
    while !detail.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &detail[..cut])
}

/// One row per execution attempt. Append-only; never mutated after close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: i64,
    pub task_id: TaskId,
    /// 1-based; equals `retry_count + 1` at attempt start.
    pub attempt_number: u32,
    /// Terminal status of this attempt (PROCESSING while open).
    pub status: TaskStatus,
    pub executor_instance: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub success: bool,
    pub error_message: Option<String>,
    pub error_stack_trace: Option<String>,
    pub error_type: Option<String>,
    pub http_status_code: Option<u16>,
    /// Snapshot of what the attempt was asked to do.
    pub request_payload: Option<Value>,
    pub response_payload: Option<Value>,
    pub notes: Option<String>,
    pub created_at: i64,
}

/// Open a new attempt row.
#[derive(Debug, Clone)]
pub struct NewExecutionLog {
    pub task_id: TaskId,
    pub attempt_number: u32,
    pub executor_instance: String,
    pub started_at: i64,
    pub request_payload: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_classification() {
        for s in TaskStatus::ALL {
            // A state is never both executable and terminal.
            assert!(!(s.is_executable() && s.is_terminal()), "{s}");
        }
        assert!(TaskStatus::Pending.is_executable());
        assert!(TaskStatus::RetryPending.is_executable());
        assert!(!TaskStatus::Processing.is_executable());
        assert!(!TaskStatus::Paused.is_executable());
        assert!(TaskStatus::DeadLetter.is_terminal());
        assert!(TaskStatus::DeadLetter.is_failure());
        assert!(TaskStatus::MaxRetriesExceeded.is_failure());
        assert!(!TaskStatus::Completed.is_failure());
    }

    #[test]
    fn status_codes_round_trip() {
        for s in TaskStatus::ALL {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::parse("RETRY_PENDING"), Some(TaskStatus::RetryPending));
        assert!(TaskStatus::parse("bogus").is_none());
    }

    #[test]
    fn type_codes_round_trip() {
        for t in TaskType::ALL {
            assert_eq!(TaskType::parse(t.as_str()), Some(t));
        }
    }

    #[test]
    fn priority_ordering_matches_values() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert_eq!(TaskPriority::from_value(8), TaskPriority::High);
        // Unknown weights fall back to Normal.
        assert_eq!(TaskPriority::from_value(7), TaskPriority::Normal);
    }

    fn sample_task() -> Task {
        Task {
            id: TaskId::new(),
            task_type: TaskType::OrderCancel,
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            reference_id: "ORD-1".into(),
            secondary_reference_id: None,
            description: None,
            payload: json!({"reason": "fraud", "attempts": 3}),
            metadata: json!({"retryDelayHours": 6}),
            scheduled_time: 0,
            expires_at: None,
            retry_count: 0,
            max_retries: None,
            retry_delay_hours: None,
            cron_expression: None,
            last_error: None,
            last_error_stack_trace: None,
            execution_result: None,
            locked_by: None,
            locked_until: None,
            version: 0,
            created_at: 0,
            updated_at: 0,
            created_by: None,
            started_at: None,
            completed_at: None,
            execution_duration_ms: None,
        }
    }

    #[test]
    fn effective_retry_settings() {
        let mut task = sample_task();
        assert_eq!(task.effective_max_retries(5), 5);
        task.max_retries = Some(2);
        assert_eq!(task.effective_max_retries(5), 2);
        assert_eq!(task.effective_retry_delay_hours(24), 24);
        task.retry_delay_hours = Some(6);
        assert_eq!(task.effective_retry_delay_hours(24), 6);
    }

    #[test]
    fn lock_and_expiry_predicates() {
        let mut task = sample_task();
        let now = now_ms();
        assert!(!task.is_locked(now));
        task.locked_by = Some("host:1".into());
        task.locked_until = Some(now + 10_000);
        assert!(task.is_locked(now));
        task.locked_until = Some(now - 1);
        assert!(!task.is_locked(now));

        assert!(!task.is_expired(now));
        task.expires_at = Some(now - 1);
        assert!(task.is_expired(now));
    }

    #[test]
    fn payload_and_metadata_accessors() {
        let task = sample_task();
        assert_eq!(task.payload_str("reason", "none"), "fraud");
        assert_eq!(task.payload_str("missing", "none"), "none");
        // Non-string values are stringified rather than dropped.
        assert_eq!(task.payload_str("attempts", "0"), "3");
        assert_eq!(task.metadata_u32("retryDelayHours"), Some(6));
        assert_eq!(task.metadata_u32("missing"), None);
    }

    #[test]
    fn error_detail_truncation() {
        let short = "boom";
        assert_eq!(truncate_error_detail(short), "boom");
        let long = "x".repeat(ERROR_DETAIL_CAP + 100);
        let cut = truncate_error_detail(&long);
        assert!(cut.len() <= ERROR_DETAIL_CAP + 3);
        assert!(cut.ends_with("..."));
    }
}
