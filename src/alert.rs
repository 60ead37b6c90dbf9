//! Outbound alerting.
//!
//! Alert delivery is fire-and-forget by construction: sinks swallow and
//! log their own delivery failures, and the executor spawns sink calls so
//! a slow webhook can never block a task commit.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{error, info, warn};

use crate::clients::http_client;
use crate::config::AlertOptions;
use crate::task::Task;

/// Destination for engine alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// A task hit its retry ceiling and needs manual intervention.
    async fn max_retries_exceeded(&self, task: &Task);

    /// A high-priority task failed permanently.
    async fn task_failure(&self, task: &Task, error: &str);

    /// Engine-internal failure worth paging on.
    async fn engine_error(&self, title: &str, message: &str, details: Option<&str>);
}

/// Sink that drops everything. Useful in tests and local development.
#[derive(Debug, Default)]
pub struct NoopAlerts;

#[async_trait]
impl AlertSink for NoopAlerts {
    async fn max_retries_exceeded(&self, _task: &Task) {}
    async fn task_failure(&self, _task: &Task, _error: &str) {}
    async fn engine_error(&self, _title: &str, _message: &str, _details: Option<&str>) {}
}

/// Chat-webhook sink (Slack-compatible payload shape).
pub struct WebhookAlerts {
    options: AlertOptions,
    client: reqwest::Client,
    application: String,
}

impl WebhookAlerts {
    pub fn new(options: AlertOptions) -> Self {
        Self {
            options,
            client: http_client(Duration::from_secs(10)),
            application: "redrive".to_string(),
        }
    }

    fn enabled(&self) -> bool {
        self.options.enabled
            && self
                .options
                .webhook_url
                .as_deref()
                .map(|u| !u.trim().is_empty())
                .unwrap_or(false)
    }

    fn task_link(&self, task: &Task) -> Option<String> {
        self.options
            .dashboard_base_url
            .as_ref()
            .map(|base| format!("{}/tasks/{}", base.trim_end_matches('/'), task.id))
    }

    async fn post(&self, payload: serde_json::Value) {
        // enabled() guarantees the URL is present.
        let Some(url) = self.options.webhook_url.as_deref() else {
            return;
        };
        match self.client.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                error!(status = %response.status(), "alert webhook rejected payload");
            }
            Err(e) => {
                error!(error = %e, "failed to deliver alert webhook");
            }
        }
    }

    fn fields_for(&self, task: &Task) -> serde_json::Value {
        json!([
            { "title": "Task ID", "value": task.id.to_string(), "short": true },
            { "title": "Task Type", "value": task.task_type.display_name(), "short": true },
            { "title": "Reference ID", "value": task.reference_id, "short": true },
            { "title": "Retry Count", "value": task.retry_count.to_string(), "short": true },
            {
                "title": "Last Error",
                "value": format!("```{}```", truncate(task.last_error.as_deref().unwrap_or("Unknown error"), 400)),
                "short": false
            }
        ])
    }
}

#[async_trait]
impl AlertSink for WebhookAlerts {
    async fn max_retries_exceeded(&self, task: &Task) {
        if !self.enabled() {
            warn!(
                task_id = %task.id,
                "alerting disabled; max-retries-exceeded alert not sent"
            );
            return;
        }
        let payload = json!({
            "channel": self.options.channel,
            "username": self.application,
            "icon_emoji": ":rotating_light:",
            "text": ":rotating_light: *Task Max Retries Exceeded - Manual Intervention Required*",
            "attachments": [{
                "color": "danger",
                "title": format!("{} - {}", task.task_type.display_name(), task.reference_id),
                "title_link": self.task_link(task),
                "fields": self.fields_for(task),
                "footer": format!("{} | Please investigate and manually retry or cancel", self.application),
            }]
        });
        self.post(payload).await;
        info!(task_id = %task.id, "max-retries-exceeded alert sent");
    }

    async fn task_failure(&self, task: &Task, error: &str) {
        if !self.enabled() {
            return;
        }
        let payload = json!({
            "channel": self.options.channel,
            "username": self.application,
            "icon_emoji": ":rotating_light:",
            "text": ":rotating_light: *Critical Task Failed*",
            "attachments": [{
                "color": "danger",
                "title": format!("Task: {}", task.task_type.display_name()),
                "title_link": self.task_link(task),
                "fields": [
                    { "title": "Task ID", "value": task.id.to_string(), "short": true },
                    { "title": "Reference", "value": task.reference_id, "short": true },
                    { "title": "Error", "value": truncate(error, 300), "short": false }
                ],
                "footer": self.application,
            }]
        });
        self.post(payload).await;
    }

    async fn engine_error(&self, title: &str, message: &str, details: Option<&str>) {
        if !self.enabled() {
            warn!(title, "alerting disabled; engine error alert not sent");
            return;
        }
        let mut fields = Vec::new();
        if let Some(details) = details {
            fields.push(json!({
                "title": "Details",
                "value": truncate(details, 500),
                "short": false
            }));
        }
        let payload = json!({
            "channel": self.options.channel,
            "username": self.application,
            "icon_emoji": ":warning:",
            "text": format!(":warning: *{title}*"),
            "attachments": [{
                "color": "warning",
                "text": message,
                "fields": fields,
                "footer": self.application,
            }]
        });
        self.post(payload).await;
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max.saturating_sub(3);
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        let t = truncate(&"é".repeat(300), 10);
        assert!(t.ends_with("..."));
        assert!(t.len() <= 10);
    }

    #[test]
    fn disabled_without_url() {
        let sink = WebhookAlerts::new(AlertOptions {
            enabled: true,
            webhook_url: None,
            channel: None,
            dashboard_base_url: None,
        });
        assert!(!sink.enabled());

        let sink = WebhookAlerts::new(AlertOptions {
            enabled: false,
            webhook_url: Some("https://hooks.example.com/x".into()),
            channel: None,
            dashboard_base_url: None,
        });
        assert!(!sink.enabled());
    }
}
