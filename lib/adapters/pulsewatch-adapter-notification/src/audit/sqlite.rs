use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use pulsewatch_domain::{Channel, ChannelOutcome, DispatchRecord, NotificationMessage};
use pulsewatch_ports::DispatchAudit;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS dispatches (
    message_id TEXT PRIMARY KEY,
    message TEXT NOT NULL,
    dispatched_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS deliveries (
    message_id TEXT NOT NULL REFERENCES dispatches (message_id),
    channel TEXT NOT NULL,
    outcome TEXT NOT NULL,
    recorded_at INTEGER NOT NULL,
    PRIMARY KEY (message_id, channel)
);
CREATE INDEX IF NOT EXISTS dispatches_at ON dispatches (dispatched_at);
";

/// Durable dispatch history. Dispatch rows land before any channel is tried,
/// so a crash mid-dispatch leaves a record with missing outcomes.
pub struct SqliteAuditLog {
    conn: Mutex<Connection>,
}

impl SqliteAuditLog {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open audit database at {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to create audit schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl DispatchAudit for SqliteAuditLog {
    fn record_dispatch(&self, message: &NotificationMessage, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().expect("audit database lock poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO dispatches (message_id, message, dispatched_at) VALUES (?1, ?2, ?3)",
            params![message.id, serde_json::to_string(message)?, at.timestamp_millis()],
        )
        .context("failed to record dispatch")?;
        Ok(())
    }

    fn record_outcome(
        &self,
        message_id: &str,
        channel: Channel,
        outcome: &ChannelOutcome,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("audit database lock poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO deliveries (message_id, channel, outcome, recorded_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                message_id,
                channel.as_str(),
                serde_json::to_string(outcome)?,
                at.timestamp_millis()
            ],
        )
        .context("failed to record delivery outcome")?;
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<DispatchRecord>> {
        let conn = self.conn.lock().expect("audit database lock poisoned");
        let mut dispatches = conn.prepare_cached(
            "SELECT message_id, message, dispatched_at FROM dispatches ORDER BY dispatched_at DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = dispatches.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut deliveries =
            conn.prepare_cached("SELECT channel, outcome FROM deliveries WHERE message_id = ?1")?;
        let mut records = Vec::new();
        for row in rows {
            let (message_id, message, dispatched_at) = row?;
            let message: NotificationMessage =
                serde_json::from_str(&message).context("corrupt audit message")?;
            let dispatched_at = DateTime::from_timestamp_millis(dispatched_at)
                .with_context(|| format!("dispatch timestamp out of range: {dispatched_at}"))?;

            let mut outcomes = std::collections::BTreeMap::new();
            let found = deliveries.query_map(params![message_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for delivery in found {
                let (channel, outcome) = delivery?;
                let channel: Channel = channel.parse()?;
                let outcome: ChannelOutcome =
                    serde_json::from_str(&outcome).context("corrupt delivery outcome")?;
                outcomes.insert(channel, outcome);
            }

            records.push(DispatchRecord {
                message,
                dispatched_at,
                outcomes,
            });
        }
        Ok(records)
    }
}
