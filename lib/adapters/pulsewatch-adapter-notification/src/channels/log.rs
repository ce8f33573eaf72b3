use anyhow::Result;
use async_trait::async_trait;

use pulsewatch_ports::{ChannelSender, RenderedNotification};

/// Writes notifications to the service log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSender;

#[async_trait]
impl ChannelSender for LogSender {
    async fn send(&self, notification: &RenderedNotification) -> Result<()> {
        tracing::info!(
            channel = %notification.channel,
            priority = %notification.priority,
            message_id = %notification.message_id,
            subject = %notification.subject,
            "{}",
            notification.body
        );
        Ok(())
    }
}
