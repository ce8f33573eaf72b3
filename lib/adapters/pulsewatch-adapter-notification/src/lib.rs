//! Multi-channel notification delivery with a dispatch audit trail.

pub mod audit;
pub mod channels;
pub mod dispatcher;
pub mod templates;

pub use audit::{InMemoryAuditLog, SqliteAuditLog};
pub use channels::{LogSender, NtfySender, WebhookSender};
pub use dispatcher::{ChannelStats, NotificationDispatcher};
pub use templates::Templates;
