//! Handler contract and the execution-result envelope.
//!
//! A handler is a stateless value that performs one kind of external
//! side-effect. Handlers never manage locks, transactions, or retries —
//! they translate a task into a remote call and the remote outcome into a
//! [`TaskExecutionResult`]. Domain failures are values, not errors; the
//! executor turns panics into retryable failures on its own.

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;

use crate::clients::ServiceError;
use crate::task::{truncate_error_detail, Task, TaskType};

pub mod order_cancel;
pub mod payment_partial_refund;
pub mod payment_refund;
pub mod payment_void;
pub mod webhook;

pub use order_cancel::OrderCancelHandler;
pub use payment_partial_refund::PaymentPartialRefundHandler;
pub use payment_refund::PaymentRefundHandler;
pub use payment_void::PaymentVoidHandler;
pub use webhook::WebhookNotificationHandler;

/// Pre-flight validation failure. Always a permanent failure path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ValidationError {}

/// Everything the executor needs to classify an attempt and update the
/// task record — a plain value, deliberately not an error hierarchy.
#[derive(Debug, Clone)]
pub struct TaskExecutionResult {
    pub success: bool,
    pub error_message: Option<String>,
    /// Classification tag for analysis (e.g. `ORDER_NOT_FOUND`, `HTTP_503`).
    pub error_type: Option<String>,
    /// Full error chain, persisted into the stack-trace slot (truncated).
    pub error_detail: Option<String>,
    pub http_status_code: Option<u16>,
    /// Response data from the external service.
    pub response_data: Value,
    /// Whether this failure should be retried. Validation-style failures
    /// must not be.
    pub retryable: bool,
    /// Overrides the handler's backoff when set.
    pub custom_retry_delay_ms: Option<i64>,
    pub notes: Option<String>,
}

impl TaskExecutionResult {
    fn base(success: bool) -> Self {
        Self {
            success,
            error_message: None,
            error_type: None,
            error_detail: None,
            http_status_code: None,
            response_data: Value::Object(Default::default()),
            retryable: true,
            custom_retry_delay_ms: None,
            notes: None,
        }
    }

    pub fn success() -> Self {
        Self::base(true)
    }

    pub fn success_with(response_data: Value) -> Self {
        Self {
            response_data,
            ..Self::base(true)
        }
    }

    /// Retryable failure without classification.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::base(false)
        }
    }

    /// Retryable failure with an error-type tag.
    pub fn failure_with_type(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            error_type: Some(error_type.into()),
            ..Self::base(false)
        }
    }

    /// Retryable failure from an error value; the chain lands in the
    /// detail slot.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut detail = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            detail.push_str("\ncaused by: ");
            detail.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            error_message: Some(error.to_string()),
            error_type: Some(error_type_name(error)),
            error_detail: Some(truncate_error_detail(&detail)),
            ..Self::base(false)
        }
    }

    /// Non-retryable failure (dead-letters the task).
    pub fn permanent(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            error_type: Some(error_type.into()),
            retryable: false,
            ..Self::base(false)
        }
    }

    /// HTTP failure classified by status: 408, 429 and 5xx are retryable,
    /// everything else is permanent.
    pub fn http_failure(status: u16, message: impl Into<String>) -> Self {
        let retryable = status >= 500 || status == 408 || status == 429;
        Self {
            error_message: Some(message.into()),
            error_type: Some(format!("HTTP_{status}")),
            http_status_code: Some(status),
            retryable,
            ..Self::base(false)
        }
    }

    pub fn with_custom_retry_delay(mut self, delay_ms: i64) -> Self {
        self.custom_retry_delay_ms = Some(delay_ms);
        self
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status_code = Some(status);
        self
    }
}

/// A short type tag for an error value, mirroring exception-class names in
/// log analysis tooling.
fn error_type_name(error: &(dyn std::error::Error + 'static)) -> String {
    if error.downcast_ref::<ServiceError>().is_some() {
        "SERVICE_ERROR".to_string()
    } else if let Some(e) = error.downcast_ref::<reqwest::Error>() {
        if e.is_timeout() {
            "TIMEOUT".to_string()
        } else {
            "CONNECTION_ERROR".to_string()
        }
    } else {
        "UNEXPECTED_ERROR".to_string()
    }
}

/// Handler for one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The task type this handler executes.
    fn task_type(&self) -> TaskType;

    /// Pre-flight check. Failures take the permanent-failure path without
    /// touching the remote service.
    fn validate(&self, task: &Task) -> Result<(), ValidationError> {
        if task.reference_id.trim().is_empty() {
            return Err(ValidationError::new("Task reference ID is required"));
        }
        Ok(())
    }

    /// Perform the external effect. Domain failures come back as failure
    /// results; this must not panic for expected outcomes.
    async fn execute(&self, task: &Task) -> TaskExecutionResult;

    /// Delay before the next retry, in milliseconds. The default honors a
    /// per-task `retryDelayHours` override and otherwise backs off by the
    /// effective delay-hours setting, with jitter.
    fn next_retry_delay_ms(&self, task: &Task, default_delay_hours: u32) -> i64 {
        if let Some(hours) = task.metadata_u32("retryDelayHours") {
            return with_jitter(hours_ms(hours));
        }
        with_jitter(hours_ms(task.effective_retry_delay_hours(default_delay_hours)))
    }
}

pub(crate) fn hours_ms(hours: u32) -> i64 {
    hours as i64 * 60 * 60 * 1000
}

/// Backoff ladder shared by the payment handlers: 2 h, 6 h, 9 h, then the
/// default delay. Deliberately slower than the order ladder to reduce the
/// window for duplicate-effect risk while a payment provider is flapping.
pub(crate) fn payment_retry_delay_ms(task: &Task, default_delay_hours: u32) -> i64 {
    if let Some(hours) = task.metadata_u32("retryDelayHours") {
        return with_jitter(hours_ms(hours));
    }
    let base = match task.retry_count {
        0 => hours_ms(2),
        n @ 1..=2 => hours_ms(3 + 3 * n),
        _ => hours_ms(default_delay_hours),
    };
    with_jitter(base)
}

/// Add uniform jitter from `[base/10, base/4]` on top of `base`.
///
/// Spreads retries across the fleet so a recovering downstream is not hit
/// by every replica at the same instant.
pub fn with_jitter(base_ms: i64) -> i64 {
    if base_ms <= 0 {
        return 0;
    }
    let low = base_ms / 10;
    let high = base_ms / 4;
    if high <= low {
        return base_ms + low;
    }
    base_ms + rand::thread_rng().gen_range(low..=high)
}

/// Read a string field out of the task payload with a fallback; shared by
/// the concrete handlers.
pub(crate) fn payload_str(task: &Task, key: &str, default: &str) -> String {
    task.payload_str(key, default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_constructors() {
        let r = TaskExecutionResult::success();
        assert!(r.success);
        assert!(r.error_message.is_none());
        let r = TaskExecutionResult::success_with(serde_json::json!({"orderId": "ORD-1"}));
        assert_eq!(r.response_data["orderId"], "ORD-1");
    }

    #[test]
    fn plain_failures_default_to_retryable() {
        let r = TaskExecutionResult::failure("boom");
        assert!(!r.success);
        assert!(r.retryable);
        let r = TaskExecutionResult::failure_with_type("odd body", "UNEXPECTED_STATUS");
        assert!(r.retryable);
        assert_eq!(r.error_type.as_deref(), Some("UNEXPECTED_STATUS"));
    }

    #[test]
    fn permanent_failures_never_retry() {
        let r = TaskExecutionResult::permanent("Order not found", "ORDER_NOT_FOUND");
        assert!(!r.retryable);
        assert_eq!(r.error_type.as_deref(), Some("ORDER_NOT_FOUND"));
    }

    #[test]
    fn http_failure_classification() {
        for status in [500, 502, 503, 504, 408, 429] {
            assert!(TaskExecutionResult::http_failure(status, "err").retryable, "{status}");
        }
        for status in [400, 401, 403, 404, 409, 422] {
            assert!(!TaskExecutionResult::http_failure(status, "err").retryable, "{status}");
        }
        let r = TaskExecutionResult::http_failure(503, "unavailable");
        assert_eq!(r.error_type.as_deref(), Some("HTTP_503"));
        assert_eq!(r.http_status_code, Some(503));
    }

    #[test]
    fn from_error_captures_chain() {
        let e = ServiceError::transport("order-service", "connection refused");
        let r = TaskExecutionResult::from_error(&e);
        assert!(!r.success);
        assert!(r.retryable);
        assert_eq!(r.error_type.as_deref(), Some("SERVICE_ERROR"));
        assert!(r.error_detail.unwrap().contains("connection refused"));
    }

    #[test]
    fn jitter_stays_in_band() {
        let base = hours_ms(1);
        for _ in 0..200 {
            let d = with_jitter(base);
            assert!(d >= base + base / 10, "{d}");
            assert!(d <= base + base / 4, "{d}");
        }
    }

    #[test]
    fn jitter_handles_degenerate_bases() {
        assert_eq!(with_jitter(0), 0);
        assert_eq!(with_jitter(-5), 0);
        // Tiny bases where low == high must not panic.
        let d = with_jitter(7);
        assert!(d >= 7);
    }
}
