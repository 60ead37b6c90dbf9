//! Handler for `PAYMENT_VOID` tasks.
//!
//! Voids a pending authorization. `reference_id` is the payment id;
//! `secondary_reference_id` is the authorization id when known.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::{payload_str, payment_retry_delay_ms, TaskExecutionResult, TaskHandler, ValidationError};
use crate::clients::{PaymentServiceClient, PaymentVoidRequest};
use crate::task::{Task, TaskType};

fn is_void_success(status: &str) -> bool {
    ["VOIDED", "SUCCESS", "COMPLETED"]
        .iter()
        .any(|s| status.eq_ignore_ascii_case(s))
}

pub struct PaymentVoidHandler {
    payment_client: Arc<PaymentServiceClient>,
}

impl PaymentVoidHandler {
    pub fn new(payment_client: Arc<PaymentServiceClient>) -> Self {
        Self { payment_client }
    }
}

#[async_trait]
impl TaskHandler for PaymentVoidHandler {
    fn task_type(&self) -> TaskType {
        TaskType::PaymentVoid
    }

    fn validate(&self, task: &Task) -> Result<(), ValidationError> {
        if task.reference_id.trim().is_empty() {
            return Err(ValidationError::new("Payment ID (reference_id) is required"));
        }
        Ok(())
    }

    async fn execute(&self, task: &Task) -> TaskExecutionResult {
        let payment_id = &task.reference_id;
        info!(payment_id, "executing PAYMENT_VOID");

        let request = PaymentVoidRequest {
            payment_id: payment_id.clone(),
            authorization_id: task.secondary_reference_id.clone(),
            reason: payload_str(task, "reason", "Automated void"),
            requested_by: payload_str(task, "requestedBy", "task-scheduler"),
        };

        match self.payment_client.void_payment(&request).await {
            Ok(response) if is_void_success(&response.status) => {
                info!(payment_id, "payment voided");
                TaskExecutionResult::success_with(json!({
                    "paymentId": response.payment_id,
                    "status": response.status,
                    "message": response.message.unwrap_or_else(|| "Payment voided".to_string()),
                    "voidedAt": response.voided_at.unwrap_or_default(),
                }))
            }
            Ok(response) => {
                warn!(payment_id, status = %response.status, "void returned unexpected status");
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
                    format!("Payment cannot be voided (conflict): {}", e.response_body()),
                    "PAYMENT_STATE_CONFLICT",
                )
                .with_http_status(409),
                Some(400) => TaskExecutionResult::permanent(
                    format!("Invalid void request: {}", e.response_body()),
                    "VALIDATION_ERROR",
                )
                .with_http_status(400),
                Some(status) => TaskExecutionResult::http_failure(status, e.to_string()),
                None => TaskExecutionResult::from_error(&e),
            },
        }
    }

    fn next_retry_delay_ms(&self, task: &Task, default_delay_hours: u32) -> i64 {
        payment_retry_delay_ms(task, default_delay_hours)
    }
}
