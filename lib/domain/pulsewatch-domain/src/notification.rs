use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type MessageId = String;

/// Delivery medium for notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Slack,
    Sms,
    Webhook,
    Log,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Email,
        Channel::Slack,
        Channel::Sms,
        Channel::Webhook,
        Channel::Log,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Slack => "slack",
            Channel::Sms => "sms",
            Channel::Webhook => "webhook",
            Channel::Log => "log",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|channel| channel.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown channel: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    /// Glyph used by chat-like channels.
    pub fn glyph(&self) -> &'static str {
        match self {
            Priority::Low => "ℹ️",
            Priority::Normal => "🔔",
            Priority::High => "⚠️",
            Priority::Urgent => "🚨",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub id: MessageId,
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub channels: BTreeSet<Channel>,
    pub created_at: DateTime<Utc>,
}

impl NotificationMessage {
    pub fn new(
        title: impl Into<String>,
        body: impl Into<String>,
        priority: Priority,
        channels: BTreeSet<Channel>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            body: body.into(),
            priority,
            channels,
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChannelOutcome {
    Delivered,
    /// Channel is administratively disabled; counts as success.
    Disabled,
    Failed { error: String },
    TimedOut,
}

impl ChannelOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ChannelOutcome::Delivered | ChannelOutcome::Disabled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelOutcome::Delivered => "delivered",
            ChannelOutcome::Disabled => "disabled",
            ChannelOutcome::Failed { .. } => "failed",
            ChannelOutcome::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub message_id: MessageId,
    pub per_channel: BTreeMap<Channel, ChannelOutcome>,
}

impl DispatchResult {
    pub fn all_succeeded(&self) -> bool {
        self.per_channel.values().all(ChannelOutcome::is_success)
    }

    pub fn failed_channels(&self) -> Vec<Channel> {
        self.per_channel
            .iter()
            .filter(|(_, outcome)| !outcome.is_success())
            .map(|(channel, _)| *channel)
            .collect()
    }

    pub fn outcome(&self, channel: Channel) -> Option<&ChannelOutcome> {
        self.per_channel.get(&channel)
    }
}

/// Audit entry for one dispatch and whatever outcomes were recorded for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub message: NotificationMessage,
    pub dispatched_at: DateTime<Utc>,
    pub outcomes: BTreeMap<Channel, ChannelOutcome>,
}
