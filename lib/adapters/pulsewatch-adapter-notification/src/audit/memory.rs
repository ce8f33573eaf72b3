use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Utc};

use pulsewatch_domain::{Channel, ChannelOutcome, DispatchRecord, NotificationMessage};
use pulsewatch_ports::DispatchAudit;

const DEFAULT_CAPACITY: usize = 1_000;

/// Bounded audit trail; the oldest dispatches fall off first.
#[derive(Debug)]
pub struct InMemoryAuditLog {
    records: Mutex<VecDeque<DispatchRecord>>,
    capacity: usize,
}

impl InMemoryAuditLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }
}

impl Default for InMemoryAuditLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl DispatchAudit for InMemoryAuditLog {
    fn record_dispatch(&self, message: &NotificationMessage, at: DateTime<Utc>) -> Result<()> {
        let mut records = self.records.lock().expect("audit log lock poisoned");
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(DispatchRecord {
            message: message.clone(),
            dispatched_at: at,
            outcomes: BTreeMap::new(),
        });
        Ok(())
    }

    fn record_outcome(
        &self,
        message_id: &str,
        channel: Channel,
        outcome: &ChannelOutcome,
        _at: DateTime<Utc>,
    ) -> Result<()> {
        let mut records = self.records.lock().expect("audit log lock poisoned");
        let record = records
            .iter_mut()
            .rev()
            .find(|record| record.message.id == message_id)
            .ok_or_else(|| anyhow::anyhow!("no dispatch recorded for message {message_id}"))?;
        record.outcomes.insert(channel, outcome.clone());
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<DispatchRecord>> {
        let records = self.records.lock().expect("audit log lock poisoned");
        Ok(records.iter().rev().take(limit).cloned().collect())
    }
}
