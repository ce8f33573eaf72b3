//! Domain models and invariants.

pub mod alert;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod notification;
pub mod pool;
pub mod routing;

pub use alert::{
    Alert, AlertId, AlertRule, AlertStatus, Comparison, CustomPredicate, Predicate, RuleId,
    Severity, Statistic, ThresholdCondition,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AlertsConfig, AutoScalerConfig, BalancerConfig, ChannelConfig, InstanceConfig, MetricsBackend,
    MetricsConfig, NotificationsConfig, OrchestratorConfig, PoolConfig, ProbeKind,
    ProviderConfig, PulsewatchConfig, RuleConfig,
};
pub use error::{AlertError, MetricsError, PoolError, RoutingError};
pub use health::{ComponentHealth, HealthLevel, SystemHealthStatus};
pub use metrics::{AggregateSnapshot, MetricKind, Sample, TagFilter};
pub use notification::{
    Channel, ChannelOutcome, DispatchRecord, DispatchResult, MessageId, NotificationMessage,
    Priority,
};
pub use pool::{AcquirePriority, PoolStats};
pub use routing::{ScalingDecision, ServerInstance};
