use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use pulsewatch_ports::{ChannelSender, RenderedNotification};

#[derive(Debug, Clone)]
pub struct WebhookSender {
    client: reqwest::Client,
    url: String,
    headers: BTreeMap<String, String>,
}

impl WebhookSender {
    pub fn new(client: reqwest::Client, url: String, headers: BTreeMap<String, String>) -> Self {
        Self {
            client,
            url,
            headers,
        }
    }
}

#[async_trait]
impl ChannelSender for WebhookSender {
    async fn send(&self, notification: &RenderedNotification) -> Result<()> {
        let body = if notification.content_type == "application/json" {
            notification.body.clone()
        } else {
            serde_json::to_string(&serde_json::json!({
                "id": notification.message_id,
                "subject": notification.subject,
                "body": notification.body,
                "priority": notification.priority,
            }))?
        };

        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        request
            .send()
            .await
            .with_context(|| format!("webhook POST to {} failed", self.url))?
            .error_for_status()
            .context("webhook rejected notification")?;
        Ok(())
    }
}
