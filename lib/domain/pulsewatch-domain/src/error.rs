use std::time::Duration;

use thiserror::Error;

use crate::alert::{AlertId, RuleId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetricsError {
    /// The sample was lost. Non-fatal; callers on request paths ignore it.
    #[error("sample dropped: {reason}")]
    IngestionDropped { reason: String },
    #[error("metric storage failed: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("timed out after {waited:?} waiting for a pooled connection")]
    Timeout {
        waited: Duration,
        last_error: Option<String>,
    },
    #[error("pool exhausted: all {max} connections in use")]
    Exhausted { max: usize },
    #[error("pool is closed")]
    Closed,
    #[error("failed to open connection: {0}")]
    Connect(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("no healthy instance available")]
    NoHealthyInstance,
    #[error("unknown routing strategy: {0}")]
    UnknownStrategy(String),
    #[error("unknown instance: {0}")]
    UnknownInstance(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlertError {
    #[error("unknown alert: {0}")]
    UnknownAlert(AlertId),
    #[error("unknown rule: {0}")]
    UnknownRule(RuleId),
    #[error("rule {rule_id} failed to evaluate: {reason}")]
    RuleEvaluation { rule_id: RuleId, reason: String },
}
