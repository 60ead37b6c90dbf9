//! Handler for `PAYMENT_PARTIAL_REFUND` tasks.
//!
//! Same remote call and error mapping as the full refund, but the payload
//! must carry the partial `amount` — a partial refund without one is a
//! validation failure, not a silent full refund.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::payment_refund::{execute_refund, payload_amount};
use super::{payment_retry_delay_ms, TaskExecutionResult, TaskHandler, ValidationError};
use crate::clients::PaymentServiceClient;
use crate::task::{Task, TaskType};

pub struct PaymentPartialRefundHandler {
    payment_client: Arc<PaymentServiceClient>,
}

impl PaymentPartialRefundHandler {
    pub fn new(payment_client: Arc<PaymentServiceClient>) -> Self {
        Self { payment_client }
    }
}

#[async_trait]
impl TaskHandler for PaymentPartialRefundHandler {
    fn task_type(&self) -> TaskType {
        TaskType::PaymentPartialRefund
    }

    fn validate(&self, task: &Task) -> Result<(), ValidationError> {
        if task.reference_id.trim().is_empty() {
            return Err(ValidationError::new("Payment ID (reference_id) is required"));
        }
        match payload_amount(task) {
            Some(amount) if amount > 0.0 => Ok(()),
            Some(_) => Err(ValidationError::new("Partial refund amount must be positive")),
            None => Err(ValidationError::new(
                "Partial refund requires an 'amount' payload field",
            )),
        }
    }

    async fn execute(&self, task: &Task) -> TaskExecutionResult {
        info!(payment_id = %task.reference_id, "executing PAYMENT_PARTIAL_REFUND");
        execute_refund(
            &self.payment_client,
            task,
            payload_amount(task),
            "Automated partial refund",
        )
        .await
    }

    fn next_retry_delay_ms(&self, task: &Task, default_delay_hours: u32) -> i64 {
        payment_retry_delay_ms(task, default_delay_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceClientOptions;
    use crate::task::{now_ms, TaskId, TaskPriority, TaskStatus};

    fn handler() -> PaymentPartialRefundHandler {
        PaymentPartialRefundHandler::new(Arc::new(PaymentServiceClient::new(
            ServiceClientOptions::new("http://localhost:1"),
        )))
    }

    fn task_with_payload(payload: serde_json::Value) -> Task {
        Task {
            id: TaskId::new(),
            task_type: TaskType::PaymentPartialRefund,
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            reference_id: "PAY-1".into(),
            secondary_reference_id: None,
            description: None,
            payload,
            metadata: serde_json::json!({}),
            scheduled_time: now_ms(),
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
            created_at: now_ms(),
            updated_at: now_ms(),
            created_by: None,
            started_at: None,
            completed_at: None,
            execution_duration_ms: None,
        }
    }

    #[test]
    fn amount_is_required_and_positive() {
        let h = handler();
        assert!(h.validate(&task_with_payload(serde_json::json!({"amount": 10.0}))).is_ok());
        assert!(h.validate(&task_with_payload(serde_json::json!({}))).is_err());
        assert!(h.validate(&task_with_payload(serde_json::json!({"amount": 0}))).is_err());
        assert!(h.validate(&task_with_payload(serde_json::json!({"amount": -3}))).is_err());
    }
}
