//! Handler for `WEBHOOK_NOTIFICATION` tasks.
//!
//! Delivers the task payload as JSON to a target URL. The URL comes from
//! metadata (`url`) so the payload stays exactly what the receiver sees.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use super::{TaskExecutionResult, TaskHandler, ValidationError};
use crate::clients::http_client;
use crate::task::{Task, TaskType};

pub struct WebhookNotificationHandler {
    client: reqwest::Client,
}

impl WebhookNotificationHandler {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
        }
    }

    fn target_url(task: &Task) -> Option<String> {
        match task.metadata.get("url") {
            Some(serde_json::Value::String(url)) if !url.trim().is_empty() => Some(url.clone()),
            _ => None,
        }
    }
}

impl Default for WebhookNotificationHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for WebhookNotificationHandler {
    fn task_type(&self) -> TaskType {
        TaskType::WebhookNotification
    }

    fn validate(&self, task: &Task) -> Result<(), ValidationError> {
        if task.reference_id.trim().is_empty() {
            return Err(ValidationError::new("Task reference ID is required"));
        }
        let url = Self::target_url(task)
            .ok_or_else(|| ValidationError::new("Webhook requires a 'url' metadata field"))?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ValidationError::new(format!("Webhook URL is not http(s): {url}")));
        }
        Ok(())
    }

    async fn execute(&self, task: &Task) -> TaskExecutionResult {
        // validate() already ran, but handlers stay safe standalone.
        let Some(url) = Self::target_url(task) else {
            return TaskExecutionResult::permanent(
                "Webhook requires a 'url' metadata field",
                "VALIDATION_ERROR",
            );
        };
        info!(reference_id = %task.reference_id, url = %url, "delivering webhook notification");

        match self.client.post(&url).json(&task.payload).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if response.status().is_success() {
                    TaskExecutionResult::success_with(json!({
                        "url": url,
                        "httpStatus": status,
                    }))
                    .with_http_status(status)
                } else {
                    let body = response.text().await.unwrap_or_default();
                    TaskExecutionResult::http_failure(
                        status,
                        format!("Webhook target returned HTTP {status}: {body}"),
                    )
                }
            }
            Err(e) => TaskExecutionResult::from_error(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{now_ms, TaskId, TaskPriority, TaskStatus};

    fn task_with_metadata(metadata: serde_json::Value) -> Task {
        Task {
            id: TaskId::new(),
            task_type: TaskType::WebhookNotification,
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            reference_id: "EVT-1".into(),
            secondary_reference_id: None,
            description: None,
            payload: serde_json::json!({"event": "order.cancelled"}),
            metadata,
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
    fn validate_requires_http_url() {
        let h = WebhookNotificationHandler::new();
        assert!(h
            .validate(&task_with_metadata(serde_json::json!({"url": "https://example.com/hook"})))
            .is_ok());
        assert!(h.validate(&task_with_metadata(serde_json::json!({}))).is_err());
        assert!(h
            .validate(&task_with_metadata(serde_json::json!({"url": "ftp://example.com"})))
            .is_err());
        assert!(h.validate(&task_with_metadata(serde_json::json!({"url": "  "}))).is_err());
    }
}
