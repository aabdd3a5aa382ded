//! Outbound notifications.
//!
//! Delivery is best effort: callers log a failed send and carry on, an
//! unreachable notification service never fails an update.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::NotifyError;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// ntfy priority levels used by dockup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Default = 3,
    High = 4,
    Max = 5,
}

/// One message to deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub priority: Priority,
    /// ntfy tags, rendered as emoji by clients (`warning`, `white_check_mark`).
    pub tags: Vec<String>,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            priority: Priority::Default,
            tags: Vec::new(),
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }
}

/// A notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Send and log failures; never propagates.
pub async fn deliver(notifier: &dyn Notifier, notification: &Notification) {
    match notifier.send(notification).await {
        Ok(()) => debug!(title = %notification.title, "notification sent"),
        Err(e) => warn!(title = %notification.title, error = %e, "notification failed"),
    }
}

/// Drops every notification. Used when no topic is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, _notification: &Notification) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// ntfy connection settings.
#[derive(Debug, Clone)]
pub struct NtfyConfig {
    /// Server base URL, e.g. `https://ntfy.sh`.
    pub endpoint: String,
    pub topic: String,
    /// Access token sent as a bearer credential.
    pub token: Option<String>,
    /// URL opened when the notification is tapped (the dockup UI).
    pub click_url: Option<String>,
}

/// Publishes to an ntfy topic.
pub struct NtfyNotifier {
    client: Client,
    url: String,
    token: Option<String>,
    click_url: Option<String>,
}

impl NtfyNotifier {
    pub fn new(config: NtfyConfig) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: format!("{}/{}", config.endpoint.trim_end_matches('/'), config.topic),
            token: config.token.filter(|t| !t.is_empty()),
            click_url: config.click_url.filter(|u| !u.is_empty()),
        })
    }
}

#[async_trait]
impl Notifier for NtfyNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Title", &notification.title)
            .header("Priority", (notification.priority as u8).to_string())
            .body(notification.body.clone());
        if !notification.tags.is_empty() {
            request = request.header("Tags", notification.tags.join(","));
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(click) = &self.click_url {
            request = request.header("Click", click);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
