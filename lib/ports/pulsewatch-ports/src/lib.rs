//! Seams between the control loops and the concrete adapters.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pulsewatch_domain::{
    AggregateSnapshot, Channel, ChannelConfig, ChannelOutcome, ComponentHealth, DispatchRecord,
    DispatchResult, MessageId, MetricKind, MetricsError, NotificationMessage, PoolStats, Priority,
    Sample, ScalingDecision, ServerInstance, TagFilter,
};

/// Durable home of recorded samples. Calls are short and synchronous so
/// ingestion never has to await.
pub trait SampleBackend: Send + Sync {
    fn append(&self, samples: &[Sample]) -> Result<()>;

    /// Samples of `kind` at or after `since` whose tags match `filter`.
    fn query(&self, kind: &MetricKind, since: DateTime<Utc>, filter: &TagFilter)
    -> Result<Vec<Sample>>;

    /// Deletes samples older than `older_than`, returning how many went.
    fn purge(&self, older_than: DateTime<Utc>) -> Result<usize>;
}

/// Read side of the metric store used by the alert engine.
pub trait AggregateSource: Send + Sync {
    fn aggregate(
        &self,
        kind: &MetricKind,
        window: Duration,
        filter: &TagFilter,
    ) -> std::result::Result<AggregateSnapshot, MetricsError>;
}

/// Full metric store surface the orchestrator drives.
pub trait MetricRepository: AggregateSource + HealthReporter {
    fn record(&self, sample: Sample) -> std::result::Result<(), MetricsError>;

    fn flush(&self) -> std::result::Result<usize, MetricsError>;

    /// Drops samples past the retention window.
    fn purge_expired(&self) -> std::result::Result<usize, MetricsError>;
}

#[async_trait]
pub trait SampleCollector: Send + Sync {
    fn name(&self) -> &str;

    async fn collect(&self) -> Result<Vec<Sample>>;
}

/// Fan-out delivery of one message to a set of channels.
#[async_trait]
pub trait NotificationPort: Send + Sync {
    async fn send(
        &self,
        message: &NotificationMessage,
        channels: &BTreeSet<Channel>,
    ) -> DispatchResult;
}

/// Dispatcher surface: delivery plus runtime channel reconfiguration.
pub trait NotificationService: NotificationPort + HealthReporter {
    fn configure_channels(&self, configs: &[ChannelConfig]);
}

/// A message rendered for one particular channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedNotification {
    pub message_id: MessageId,
    pub channel: Channel,
    pub priority: Priority,
    pub subject: String,
    pub body: String,
    pub content_type: String,
}

/// Provider-side delivery for one channel.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, notification: &RenderedNotification) -> Result<()>;
}

/// Audit trail of dispatches, written before delivery is attempted.
pub trait DispatchAudit: Send + Sync {
    fn record_dispatch(&self, message: &NotificationMessage, at: DateTime<Utc>) -> Result<()>;

    fn record_outcome(
        &self,
        message_id: &str,
        channel: Channel,
        outcome: &ChannelOutcome,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Most recent dispatches first.
    fn recent(&self, limit: usize) -> Result<Vec<DispatchRecord>>;
}

/// Creates and recycles the resources handed out by the connection pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection>;

    /// Clears per-session state before the connection goes back to idle.
    async fn reset(&self, connection: &mut Self::Connection) -> Result<()>;

    fn is_valid(&self, _connection: &Self::Connection) -> bool {
        true
    }
}

/// Type-erased handle the scheduler uses to drive a pool's periodic work.
#[async_trait]
pub trait PoolControl: HealthReporter {
    /// One hysteresis tick; returns the capacity in force afterwards.
    fn resize_tick(&self) -> usize;

    /// Evicts stale idle connections and tops the pool back up to its minimum.
    async fn maintain(&self) -> Result<()>;

    fn stats(&self) -> PoolStats;
}

#[async_trait]
pub trait InstanceProber: Send + Sync {
    async fn probe(&self, instance: &ServerInstance) -> Result<()>;
}

/// Instance registry and health-probe driver of the load balancer.
#[async_trait]
pub trait InstanceRegistry: HealthReporter {
    fn register_instance(&self, id: &str, address: &str);

    fn deregister_instance(&self, id: &str) -> bool;

    /// Mean load over healthy instances; `None` when nothing is healthy.
    fn average_load(&self) -> Option<f64>;

    /// Probes every instance once and updates health flags.
    async fn run_health_checks(&self);
}

/// Threshold controller fed with the balancer's average load.
#[async_trait]
pub trait ScalingControl: Send + Sync {
    async fn on_load(&self, average_load: Option<f64>) -> Result<()>;

    fn history(&self) -> Vec<ScalingDecision>;
}

/// Applies a scaling request to whatever runs the instances.
#[async_trait]
pub trait ScaleExecutor: Send + Sync {
    async fn scale_to(&self, from: u32, to: u32) -> Result<()>;
}

pub trait HealthReporter: Send + Sync {
    fn component_health(&self) -> ComponentHealth;
}
