//! Handler for `ORDER_CANCEL` tasks.
//!
//! Expected payload fields (all optional):
//! - `reason`: cancellation reason
//! - `cancelledBy`: who initiated the cancellation
//!
//! `reference_id` is the order id.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::{hours_ms, payload_str, with_jitter, TaskExecutionResult, TaskHandler, ValidationError};
use crate::clients::{OrderCancelRequest, OrderServiceClient};
use crate::task::{Task, TaskType};

pub struct OrderCancelHandler {
    order_client: Arc<OrderServiceClient>,
}

impl OrderCancelHandler {
    pub fn new(order_client: Arc<OrderServiceClient>) -> Self {
        Self { order_client }
    }
}

#[async_trait]
impl TaskHandler for OrderCancelHandler {
    fn task_type(&self) -> TaskType {
        TaskType::OrderCancel
    }

    fn validate(&self, task: &Task) -> Result<(), ValidationError> {
        if task.reference_id.trim().is_empty() {
            return Err(ValidationError::new("Order ID (reference_id) is required"));
        }
        Ok(())
    }

    async fn execute(&self, task: &Task) -> TaskExecutionResult {
        let order_id = &task.reference_id;
        info!(order_id, "executing ORDER_CANCEL");

        let request = OrderCancelRequest {
            order_id: order_id.clone(),
            reason: payload_str(task, "reason", "Automated cancellation"),
            cancelled_by: payload_str(task, "cancelledBy", "task-scheduler"),
            metadata: task.metadata.clone(),
        };

        match self.order_client.cancel_order(&request).await {
            Ok(response) if response.status.eq_ignore_ascii_case("CANCELLED") => {
                info!(order_id, "order cancelled");
                TaskExecutionResult::success_with(json!({
                    "orderId": response.order_id,
                    "status": response.status,
                    "message": response.message.unwrap_or_else(|| "Order cancelled".to_string()),
                    "cancelledAt": response.cancelled_at.unwrap_or_default(),
                }))
            }
            Ok(response) => {
                warn!(order_id, status = %response.status, "order cancel returned unexpected status");
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
                    format!("Order not found: {order_id}"),
                    "ORDER_NOT_FOUND",
                )
                .with_http_status(404),
                Some(409) => TaskExecutionResult::permanent(
                    format!("Order cannot be cancelled (conflict): {}", e.response_body()),
                    "ORDER_STATE_CONFLICT",
                )
                .with_http_status(409),
                Some(400) => TaskExecutionResult::permanent(
                    format!("Invalid cancellation request: {}", e.response_body()),
                    "VALIDATION_ERROR",
                )
                .with_http_status(400),
                Some(status) => TaskExecutionResult::http_failure(status, e.to_string()),
                None => TaskExecutionResult::from_error(&e),
            },
        }
    }

    fn next_retry_delay_ms(&self, task: &Task, default_delay_hours: u32) -> i64 {
        if let Some(hours) = task.metadata_u32("retryDelayHours") {
            return with_jitter(hours_ms(hours));
        }

        // Exponential for the first retries (1 h, 2 h, 4 h), then daily.
        let retry_count = task.retry_count;
        if retry_count < 3 {
            return with_jitter(hours_ms(1) << retry_count);
        }
        with_jitter(hours_ms(default_delay_hours))
    }
}
