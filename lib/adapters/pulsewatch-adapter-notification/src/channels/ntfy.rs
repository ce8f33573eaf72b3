use anyhow::{Context, Result};
use async_trait::async_trait;

use pulsewatch_domain::Priority;
use pulsewatch_ports::{ChannelSender, RenderedNotification};

/// Publishes to an ntfy topic; the body is sent as-is.
#[derive(Debug, Clone)]
pub struct NtfySender {
    client: reqwest::Client,
    url: String,
    topic: String,
}

impl NtfySender {
    pub fn new(client: reqwest::Client, url: String, topic: String) -> Self {
        Self { client, url, topic }
    }

    fn endpoint(&self) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), self.topic)
    }
}

fn ntfy_priority(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "2",
        Priority::Normal => "3",
        Priority::High => "4",
        Priority::Urgent => "5",
    }
}

#[async_trait]
impl ChannelSender for NtfySender {
    async fn send(&self, notification: &RenderedNotification) -> Result<()> {
        let endpoint = self.endpoint();
        self.client
            .post(&endpoint)
            .header("Title", notification.subject.as_str())
            .header("Priority", ntfy_priority(notification.priority))
            .header("Tags", notification.channel.as_str())
            .body(notification.body.clone())
            .send()
            .await
            .with_context(|| format!("ntfy publish to {endpoint} failed"))?
            .error_for_status()
            .context("ntfy rejected notification")?;
        Ok(())
    }
}
