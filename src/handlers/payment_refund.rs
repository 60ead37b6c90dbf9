//! Handler for `PAYMENT_REFUND` tasks (full refund).
//!
//! Expected payload fields:
//! - `amount` (optional, full refund when absent)
//! - `currency` (default USD)
//! - `reason`, `requestedBy`
//!
//! `reference_id` is the payment id; `secondary_reference_id` is the
//! transaction id when known.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::{payload_str, payment_retry_delay_ms, TaskExecutionResult, TaskHandler, ValidationError};
use crate::clients::{PaymentRefundRequest, PaymentServiceClient};
use crate::task::{Task, TaskType};

/// Remote statuses that count as a completed refund.
pub(crate) fn is_refund_success(status: &str) -> bool {
    ["COMPLETED", "SUCCESS", "REFUNDED", "PROCESSED"]
        .iter()
        .any(|s| status.eq_ignore_ascii_case(s))
}

pub(crate) fn payload_amount(task: &Task) -> Option<f64> {
    match task.payload.get("amount") {
        Some(v) if v.is_number() => v.as_f64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

pub struct PaymentRefundHandler {
    payment_client: Arc<PaymentServiceClient>,
}

impl PaymentRefundHandler {
    pub fn new(payment_client: Arc<PaymentServiceClient>) -> Self {
        Self { payment_client }
    }
}

pub(crate) async fn execute_refund(
    client: &PaymentServiceClient,
    task: &Task,
    amount: Option<f64>,
    default_reason: &str,
) -> TaskExecutionResult {
    let payment_id = &task.reference_id;

    let request = PaymentRefundRequest {
        payment_id: payment_id.clone(),
        transaction_id: task.secondary_reference_id.clone(),
        amount,
        currency: payload_str(task, "currency", "USD"),
        reason: payload_str(task, "reason", default_reason),
        requested_by: payload_str(task, "requestedBy", "task-scheduler"),
        metadata: task.metadata.clone(),
    };

    match client.refund_payment(&request).await {
        Ok(response) if is_refund_success(&response.status) => {
            info!(payment_id, refund_id = ?response.refund_id, "refund processed");
            TaskExecutionResult::success_with(json!({
                "refundId": response.refund_id.unwrap_or_default(),
                "paymentId": response.payment_id,
                "status": response.status,
                "amount": response.amount.map(|a| a.to_string()).unwrap_or_default(),
                "message": response.message.unwrap_or_else(|| "Refund processed".to_string()),
                "processedAt": response.processed_at.unwrap_or_default(),
            }))
        }
        Ok(response) => {
            warn!(payment_id, status = %response.status, "refund returned unexpected status");
            TaskExecutionResult::failure_with_type(
                format!(
                    "Unexpected status: {} - {}",
                    response.status,
                    response.message.unwrap_or_else(|| "No message".to_string())
                ),
                "UNEXPECTED_STATUS",
            )
        }
        Err(e) => match e.http_status {
            Some(404) => TaskExecutionResult::permanent(
                format!("Payment not found: {payment_id}"),
                "PAYMENT_NOT_FOUND",
            )
            .with_http_status(404),
            Some(409) => TaskExecutionResult::permanent(
                format!("Payment cannot be refunded (conflict): {}", e.response_body()),
                "PAYMENT_STATE_CONFLICT",
            )
            .with_http_status(409),
            Some(400) => TaskExecutionResult::permanent(
                format!("Invalid refund request: {}", e.response_body()),
                "VALIDATION_ERROR",
            )
            .with_http_status(400),
            Some(422) => TaskExecutionResult::permanent(
                format!("Refund cannot be processed: {}", e.response_body()),
                "BUSINESS_RULE_VIOLATION",
            )
            .with_http_status(422),
            Some(status) => TaskExecutionResult::http_failure(status, e.to_string()),
            None => TaskExecutionResult::from_error(&e),
        },
    }
}

#[async_trait]
impl TaskHandler for PaymentRefundHandler {
    fn task_type(&self) -> TaskType {
        TaskType::PaymentRefund
    }

    fn validate(&self, task: &Task) -> Result<(), ValidationError> {
        if task.reference_id.trim().is_empty() {
            return Err(ValidationError::new("Payment ID (reference_id) is required"));
        }
        Ok(())
    }

    async fn execute(&self, task: &Task) -> TaskExecutionResult {
        info!(payment_id = %task.reference_id, "executing PAYMENT_REFUND");
        execute_refund(
            &self.payment_client,
            task,
            payload_amount(task),
            "Automated refund",
        )
        .await
    }

    fn next_retry_delay_ms(&self, task: &Task, default_delay_hours: u32) -> i64 {
        payment_retry_delay_ms(task, default_delay_hours)
    }
}
