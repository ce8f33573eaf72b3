use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::alert::{AlertRule, Comparison, DEFAULT_MESSAGE_TEMPLATE, Severity, Statistic};
use crate::metrics::{MetricKind, TagFilter};
use crate::notification::Channel;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PulsewatchConfig {
    pub metrics: MetricsConfig,
    pub alerts: AlertsConfig,
    pub notifications: NotificationsConfig,
    pub pool: PoolConfig,
    pub balancer: BalancerConfig,
    pub autoscaler: AutoScalerConfig,
    pub orchestrator: OrchestratorConfig,
}

impl PulsewatchConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("invalid config at {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw).context("failed to parse config yaml")?;
        Ok(config)
    }

    /// Checks cross-field invariants, reporting every violation at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        let pool = &self.pool;
        if pool.min_size > pool.max_size {
            problems.push(format!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                pool.min_size, pool.max_size
            ));
        }
        if pool.max_size == 0 {
            problems.push("pool.max_size must be at least 1".to_string());
        }
        if !(pool.min_size..=pool.max_size).contains(&pool.initial_size) {
            problems.push(format!(
                "pool.initial_size ({}) must lie within [{}, {}]",
                pool.initial_size, pool.min_size, pool.max_size
            ));
        }
        if !(0.0..=1.0).contains(&pool.low_water)
            || !(0.0..=1.0).contains(&pool.high_water)
            || pool.low_water >= pool.high_water
        {
            problems.push(format!(
                "pool water marks must satisfy 0 <= low ({}) < high ({}) <= 1",
                pool.low_water, pool.high_water
            ));
        }
        if pool.resize_step == 0 {
            problems.push("pool.resize_step must be at least 1".to_string());
        }
        if pool.reserved_for_high_priority >= pool.max_size.max(1) {
            problems.push("pool.reserved_for_high_priority must be below pool.max_size".to_string());
        }

        let scaler = &self.autoscaler;
        if scaler.min_instances > scaler.max_instances {
            problems.push(format!(
                "autoscaler.min_instances ({}) exceeds autoscaler.max_instances ({})",
                scaler.min_instances, scaler.max_instances
            ));
        }
        if scaler.scale_down_threshold >= scaler.scale_up_threshold {
            problems.push(format!(
                "autoscaler.scale_down_threshold ({}) must be below scale_up_threshold ({})",
                scaler.scale_down_threshold, scaler.scale_up_threshold
            ));
        }

        if self.balancer.failure_threshold == 0 {
            problems.push("balancer.failure_threshold must be at least 1".to_string());
        }

        let intervals = [
            ("orchestrator.collection_interval", self.orchestrator.collection_interval),
            ("orchestrator.alert_interval", self.orchestrator.alert_interval),
            ("orchestrator.health_interval", self.orchestrator.health_interval),
            ("metrics.purge_interval", self.metrics.purge_interval),
            ("alerts.cleanup_interval", self.alerts.cleanup_interval),
            ("pool.resize_interval", self.pool.resize_interval),
            ("pool.maintenance_interval", self.pool.maintenance_interval),
            ("balancer.health_check_interval", self.balancer.health_check_interval),
            ("autoscaler.interval", self.autoscaler.interval),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                problems.push(format!("{name} must be non-zero"));
            }
        }

        let mut seen = BTreeSet::new();
        for rule in &self.alerts.rules {
            if !seen.insert(rule.id.as_str()) {
                problems.push(format!("duplicate alert rule id: {}", rule.id));
            }
            if rule.window.is_zero() {
                problems.push(format!("alert rule {} has a zero window", rule.id));
            }
        }

        let mut channels = BTreeSet::new();
        for channel in &self.notifications.channels {
            if !channels.insert(channel.channel) {
                problems.push(format!("channel {} configured more than once", channel.channel));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("invalid configuration:\n  - {}", problems.join("\n  - "))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricsBackend {
    Memory,
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub backend: MetricsBackend,
    pub buffer_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    #[serde(with = "humantime_serde")]
    pub purge_interval: Duration,
    pub collect_system: bool,
    /// How long a dropped batch keeps the store in `warning`.
    #[serde(with = "humantime_serde")]
    pub health_window: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            backend: MetricsBackend::Memory,
            buffer_capacity: 1024,
            retention: Duration::from_secs(30 * 24 * 3600),
            purge_interval: Duration::from_secs(3600),
            collect_system: true,
            health_window: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub rules: Vec<RuleConfig>,
    #[serde(with = "humantime_serde")]
    pub history_retention: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            history_retention: Duration::from_secs(7 * 24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    pub metric: MetricKind,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    #[serde(default)]
    pub tags: TagFilter,
    pub statistic: Statistic,
    pub comparison: Comparison,
    pub threshold: f64,
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,
    #[serde(default)]
    pub channels: BTreeSet<Channel>,
    #[serde(default)]
    pub message_template: Option<String>,
    #[serde(default)]
    pub auto_resolve: bool,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

fn default_severity() -> Severity {
    Severity::Medium
}

fn default_cooldown() -> Duration {
    Duration::from_secs(300)
}

fn default_min_samples() -> usize {
    1
}

impl RuleConfig {
    pub fn to_rule(&self) -> AlertRule {
        let mut rule = AlertRule::threshold(
            self.id.clone(),
            self.name.clone(),
            self.metric.clone(),
            self.window,
            self.statistic,
            self.comparison,
            self.threshold,
        )
        .with_severity(self.severity)
        .with_cooldown(self.cooldown)
        .with_tags(self.tags.clone())
        .with_min_samples(self.min_samples)
        .with_auto_resolve(self.auto_resolve)
        .with_message_template(
            self.message_template
                .clone()
                .unwrap_or_else(|| DEFAULT_MESSAGE_TEMPLATE.to_string()),
        );
        rule.channels = self.channels.clone();
        rule
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub channels: Vec<ChannelConfig>,
    #[serde(with = "humantime_serde")]
    pub channel_timeout: Duration,
    /// SQLite audit log location; in-memory when unset.
    pub audit_path: Option<PathBuf>,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            channels: vec![ChannelConfig {
                channel: Channel::Log,
                enabled: true,
                provider: ProviderConfig::Log,
            }],
            channel_timeout: Duration::from_secs(10),
            audit_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel: Channel,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub provider: ProviderConfig,
}

fn default_enabled() -> bool {
    true
}

/// Provider settings; opaque to everything except the sender built from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    Webhook {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    Ntfy {
        url: String,
        topic: String,
    },
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// SQLite database backing pooled connections; in-memory when unset.
    pub database_path: Option<PathBuf>,
    pub min_size: usize,
    pub max_size: usize,
    pub initial_size: usize,
    pub resize_step: usize,
    pub high_water: f64,
    pub low_water: f64,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    pub retry_on_failure: bool,
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    pub wait_for_capacity: bool,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Duration,
    pub reserved_for_high_priority: usize,
    #[serde(with = "humantime_serde")]
    pub resize_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,
    pub latency_window: usize,
    /// How long an acquisition timeout keeps the pool in `warning`.
    #[serde(with = "humantime_serde")]
    pub health_window: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            min_size: 2,
            max_size: 10,
            initial_size: 5,
            resize_step: 1,
            high_water: 0.85,
            low_water: 0.30,
            acquire_timeout: Duration::from_secs(5),
            retry_on_failure: true,
            retry_interval: Duration::from_millis(250),
            wait_for_capacity: true,
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
            reserved_for_high_priority: 0,
            resize_interval: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(60),
            latency_window: 256,
            health_window: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Http,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub strategy: String,
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
    pub probe: ProbeKind,
    pub response_window: usize,
    pub instances: Vec<InstanceConfig>,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: "round_robin".to_string(),
            health_check_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            failure_threshold: 3,
            probe: ProbeKind::Http,
            response_window: 32,
            instances: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScalerConfig {
    pub enabled: bool,
    pub min_instances: u32,
    pub max_instances: u32,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for AutoScalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_instances: 1,
            max_instances: 10,
            scale_up_threshold: 80.0,
            scale_down_threshold: 20.0,
            cooldown: Duration::from_secs(300),
            interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    #[serde(with = "humantime_serde")]
    pub collection_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub alert_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub health_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub restart_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            collection_interval: Duration::from_secs(15),
            alert_interval: Duration::from_secs(30),
            health_interval: Duration::from_secs(30),
            restart_delay: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}
