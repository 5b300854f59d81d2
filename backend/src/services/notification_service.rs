//! Webhook notifications for finished backups and restores.
//!
//! Delivery is best-effort: failures are logged and never affect the task.

use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use crate::models::settings::{NotificationSettings, WebhookChannel};
use crate::models::{Task, TaskStatus, WebhookKind};

pub struct NotificationService {
    http_client: Client,
}

impl Default for NotificationService {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationService {
    pub fn new() -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { http_client }
    }

    /// Post `task`'s outcome to every enabled channel the settings ask for.
    pub async fn notify(&self, settings: &NotificationSettings, task: &Task) {
        let wanted = match task.status {
            TaskStatus::Completed => settings.on_success,
            TaskStatus::Failed => settings.on_failure,
            _ => false,
        };
        if !wanted {
            return;
        }
        for channel in settings.channels.iter().filter(|c| c.enabled) {
            if let Err(e) = self.send(channel, task).await {
                tracing::warn!(channel = %channel.name, task_id = %task.id, "Webhook delivery failed: {}", e);
            }
        }
    }

    async fn send(&self, channel: &WebhookChannel, task: &Task) -> Result<(), reqwest::Error> {
        let body = payload(channel.kind, task);
        self.http_client
            .post(&channel.webhook_url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        tracing::debug!(channel = %channel.name, task_id = %task.id, "Webhook delivered");
        Ok(())
    }
}

fn headline(task: &Task) -> String {
    let outcome = match task.status {
        TaskStatus::Completed => "succeeded",
        _ => "failed",
    };
    format!("db-keeper: {} of '{}' {}", task.kind, task.target, outcome)
}

fn detail(task: &Task) -> String {
    match &task.error {
        Some(error) => format!("{} ({})", error.message, error.code),
        None => task.message.clone(),
    }
}

/// Request body in the shape each webhook kind expects.
pub fn payload(kind: WebhookKind, task: &Task) -> Value {
    let title = headline(task);
    let text = detail(task);
    match kind {
        WebhookKind::Slack => json!({ "text": format!("*{}*\n{}", title, text) }),
        WebhookKind::Discord => json!({ "content": format!("**{}**\n{}", title, text) }),
        WebhookKind::Teams => json!({
            "@type": "MessageCard",
            "@context": "https://schema.org/extensions",
            "summary": title,
            "themeColor": if task.status == TaskStatus::Completed { "2EB886" } else { "D00000" },
            "title": title,
            "text": text,
        }),
        WebhookKind::Generic => json!({
            "event": format!("{}.{}", task.kind, task.status),
            "title": title,
            "message": text,
            "task": task,
        }),
    }
}
