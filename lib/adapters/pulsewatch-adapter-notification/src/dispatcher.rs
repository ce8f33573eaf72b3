use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use pulsewatch_domain::{
    Channel, ChannelConfig, ChannelOutcome, Clock, ComponentHealth, DispatchRecord,
    DispatchResult, NotificationMessage, NotificationsConfig, Priority,
};
use pulsewatch_ports::{
    ChannelSender, DispatchAudit, HealthReporter, NotificationPort, NotificationService,
};

use crate::channels;
use crate::templates::Templates;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub delivered: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Clone)]
struct ChannelSlot {
    enabled: bool,
    sender: Arc<dyn ChannelSender>,
}

/// Fans one message out to many channels. Every channel gets its own task
/// and its own timeout; outcomes are collected, never short-circuited.
pub struct NotificationDispatcher {
    slots: RwLock<HashMap<Channel, ChannelSlot>>,
    templates: Templates,
    audit: Arc<dyn DispatchAudit>,
    clock: Arc<dyn Clock>,
    channel_timeout: Duration,
    client: reqwest::Client,
    stats: Mutex<BTreeMap<Channel, ChannelStats>>,
    last_result: Mutex<Option<DispatchResult>>,
}

impl NotificationDispatcher {
    pub fn new(
        audit: Arc<dyn DispatchAudit>,
        clock: Arc<dyn Clock>,
        channel_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(channel_timeout)
            .build()?;
        Ok(Self {
            slots: RwLock::new(HashMap::new()),
            templates: Templates::new()?,
            audit,
            clock,
            channel_timeout,
            client,
            stats: Mutex::new(BTreeMap::new()),
            last_result: Mutex::new(None),
        })
    }

    pub fn from_config(config: &NotificationsConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let audit = crate::audit::from_path(config.audit_path.as_deref())?;
        let dispatcher = Self::new(audit, clock, config.channel_timeout)?;
        dispatcher.configure_channels(&config.channels);
        Ok(dispatcher)
    }

    /// Replaces the whole channel set in one step.
    pub fn configure_channels(&self, configs: &[ChannelConfig]) {
        let slots: HashMap<_, _> = configs
            .iter()
            .map(|config| {
                (
                    config.channel,
                    ChannelSlot {
                        enabled: config.enabled,
                        sender: channels::sender_for(&config.provider, &self.client),
                    },
                )
            })
            .collect();
        let enabled: Vec<_> = slots
            .iter()
            .filter(|(_, slot)| slot.enabled)
            .map(|(channel, _)| channel.as_str())
            .collect();
        debug!(?enabled, "notification channels configured");
        *self.slots.write().expect("channel slots lock poisoned") = slots;
    }

    /// Installs a sender directly, bypassing provider configuration.
    pub fn set_sender(&self, channel: Channel, enabled: bool, sender: Arc<dyn ChannelSender>) {
        self.slots
            .write()
            .expect("channel slots lock poisoned")
            .insert(channel, ChannelSlot { enabled, sender });
    }

    pub async fn send(
        &self,
        message: &NotificationMessage,
        channels: &BTreeSet<Channel>,
    ) -> DispatchResult {
        if let Err(err) = self.audit.record_dispatch(message, self.clock.now()) {
            warn!(message_id = %message.id, error = %err, "failed to audit dispatch; sending anyway");
        }

        let slots = self
            .slots
            .read()
            .expect("channel slots lock poisoned")
            .clone();
        let mut per_channel = BTreeMap::new();
        let mut tasks = JoinSet::new();

        for &channel in channels {
            let slot = match slots.get(&channel) {
                None => {
                    per_channel.insert(
                        channel,
                        ChannelOutcome::Failed {
                            error: "channel not configured".to_string(),
                        },
                    );
                    continue;
                }
                Some(slot) if !slot.enabled => {
                    per_channel.insert(channel, ChannelOutcome::Disabled);
                    continue;
                }
                Some(slot) => slot.clone(),
            };

            let rendered = match self.templates.render(message, channel) {
                Ok(rendered) => rendered,
                Err(err) => {
                    per_channel.insert(
                        channel,
                        ChannelOutcome::Failed {
                            error: format!("render failed: {err:#}"),
                        },
                    );
                    continue;
                }
            };

            let timeout = self.channel_timeout;
            tasks.spawn(async move {
                let outcome =
                    match tokio::time::timeout(timeout, slot.sender.send(&rendered)).await {
                        Ok(Ok(())) => ChannelOutcome::Delivered,
                        Ok(Err(err)) => ChannelOutcome::Failed {
                            error: format!("{err:#}"),
                        },
                        Err(_) => ChannelOutcome::TimedOut,
                    };
                (channel, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((channel, outcome)) => {
                    per_channel.insert(channel, outcome);
                }
                Err(err) => error!(error = %err, "notification delivery task failed"),
            }
        }
        for &channel in channels {
            per_channel
                .entry(channel)
                .or_insert_with(|| ChannelOutcome::Failed {
                    error: "delivery task aborted".to_string(),
                });
        }

        let finished_at = self.clock.now();
        for (channel, outcome) in &per_channel {
            if let Err(err) = self
                .audit
                .record_outcome(&message.id, *channel, outcome, finished_at)
            {
                warn!(message_id = %message.id, channel = %channel, error = %err, "failed to audit delivery outcome");
            }
            match outcome {
                ChannelOutcome::Failed { error } => {
                    warn!(message_id = %message.id, channel = %channel, error = %error, "channel delivery failed")
                }
                ChannelOutcome::TimedOut => {
                    warn!(message_id = %message.id, channel = %channel, timeout = ?self.channel_timeout, "channel delivery timed out")
                }
                _ => {}
            }
        }
        self.tally(&per_channel);

        let result = DispatchResult {
            message_id: message.id.clone(),
            per_channel,
        };
        *self.last_result.lock().expect("dispatch result lock poisoned") = Some(result.clone());
        result
    }

    fn tally(&self, outcomes: &BTreeMap<Channel, ChannelOutcome>) {
        let mut stats = self.stats.lock().expect("channel stats lock poisoned");
        for (channel, outcome) in outcomes {
            let entry = stats.entry(*channel).or_default();
            match outcome {
                ChannelOutcome::Delivered => entry.delivered += 1,
                ChannelOutcome::Disabled => entry.skipped += 1,
                ChannelOutcome::Failed { .. } | ChannelOutcome::TimedOut => entry.failed += 1,
            }
        }
    }

    /// Sends a canned low-priority message to a single channel.
    pub async fn send_test(&self, channel: Channel) -> DispatchResult {
        let channels = BTreeSet::from([channel]);
        let message = NotificationMessage::new(
            "Test notification",
            format!("Delivery check for the {channel} channel."),
            Priority::Low,
            channels.clone(),
            self.clock.now(),
        );
        self.send(&message, &channels).await
    }

    pub fn history(&self, limit: usize) -> Result<Vec<DispatchRecord>> {
        self.audit.recent(limit)
    }

    pub fn channel_stats(&self) -> BTreeMap<Channel, ChannelStats> {
        self.stats.lock().expect("channel stats lock poisoned").clone()
    }
}

#[async_trait]
impl NotificationPort for NotificationDispatcher {
    async fn send(
        &self,
        message: &NotificationMessage,
        channels: &BTreeSet<Channel>,
    ) -> DispatchResult {
        NotificationDispatcher::send(self, message, channels).await
    }
}

impl NotificationService for NotificationDispatcher {
    fn configure_channels(&self, configs: &[ChannelConfig]) {
        NotificationDispatcher::configure_channels(self, configs);
    }
}

impl HealthReporter for NotificationDispatcher {
    fn component_health(&self) -> ComponentHealth {
        let last = self.last_result.lock().expect("dispatch result lock poisoned");
        let Some(result) = last.as_ref() else {
            return ComponentHealth::healthy("notifications");
        };
        let attempted: Vec<_> = result
            .per_channel
            .iter()
            .filter(|(_, outcome)| **outcome != ChannelOutcome::Disabled)
            .collect();
        let failed: Vec<_> = result.failed_channels();
        if !attempted.is_empty() && failed.len() == attempted.len() {
            return ComponentHealth::critical(
                "notifications",
                "every channel failed in the last dispatch",
            );
        }
        if !failed.is_empty() {
            let names: Vec<_> = failed.iter().map(Channel::as_str).collect();
            return ComponentHealth::warning(
                "notifications",
                format!("failing channels: {}", names.join(", ")),
            );
        }
        ComponentHealth::healthy("notifications")
    }
}
