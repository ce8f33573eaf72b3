pub mod log;
pub mod ntfy;
pub mod webhook;

use std::sync::Arc;

use pulsewatch_domain::ProviderConfig;
use pulsewatch_ports::ChannelSender;

pub use log::LogSender;
pub use ntfy::NtfySender;
pub use webhook::WebhookSender;

pub fn sender_for(provider: &ProviderConfig, client: &reqwest::Client) -> Arc<dyn ChannelSender> {
    let sender: Arc<dyn ChannelSender> = match provider {
        ProviderConfig::Webhook { url, headers } => Arc::new(WebhookSender::new(
            client.clone(),
            url.clone(),
            headers.clone(),
        )),
        ProviderConfig::Ntfy { url, topic } => {
            Arc::new(NtfySender::new(client.clone(), url.clone(), topic.clone()))
        }
        ProviderConfig::Log => Arc::new(LogSender),
    };
    sender
}
