use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::{AggregateSnapshot, MetricKind, TagFilter};
use crate::notification::{Channel, Priority};

pub type RuleId = String;
pub type AlertId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            Severity::Low => Priority::Low,
            Severity::Medium => Priority::Normal,
            Severity::High => Priority::High,
            Severity::Critical => Priority::Urgent,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    Count,
    Avg,
    Min,
    Max,
    P95,
    P99,
}

impl Statistic {
    pub fn of(&self, snapshot: &AggregateSnapshot) -> f64 {
        match self {
            Statistic::Count => snapshot.count as f64,
            Statistic::Avg => snapshot.avg,
            Statistic::Min => snapshot.min,
            Statistic::Max => snapshot.max,
            Statistic::P95 => snapshot.p95,
            Statistic::P99 => snapshot.p99,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Statistic::Count => "count",
            Statistic::Avg => "avg",
            Statistic::Min => "min",
            Statistic::Max => "max",
            Statistic::P95 => "p95",
            Statistic::P99 => "p99",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl Comparison {
    pub fn holds(&self, observed: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gt => observed > threshold,
            Comparison::Gte => observed >= threshold,
            Comparison::Lt => observed < threshold,
            Comparison::Lte => observed <= threshold,
            Comparison::Eq => (observed - threshold).abs() < f64::EPSILON,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::Gt => ">",
            Comparison::Gte => ">=",
            Comparison::Lt => "<",
            Comparison::Lte => "<=",
            Comparison::Eq => "==",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCondition {
    pub statistic: Statistic,
    pub comparison: Comparison,
    pub threshold: f64,
}

type PredicateFn = dyn Fn(&AggregateSnapshot) -> anyhow::Result<bool> + Send + Sync;

/// Code-defined predicate. Errors mark the rule as "no match" for the tick.
#[derive(Clone)]
pub struct CustomPredicate {
    label: String,
    func: Arc<PredicateFn>,
}

impl CustomPredicate {
    pub fn new<F>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn(&AggregateSnapshot) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            func: Arc::new(func),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for CustomPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomPredicate")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum Predicate {
    Threshold(ThresholdCondition),
    Custom(CustomPredicate),
}

impl Predicate {
    pub fn evaluate(&self, snapshot: &AggregateSnapshot) -> anyhow::Result<bool> {
        match self {
            Predicate::Threshold(condition) => {
                let observed = condition.statistic.of(snapshot);
                if !observed.is_finite() {
                    anyhow::bail!(
                        "{} of {} is not finite",
                        condition.statistic.as_str(),
                        snapshot.kind
                    );
                }
                Ok(condition.comparison.holds(observed, condition.threshold))
            }
            Predicate::Custom(custom) => (custom.func)(snapshot),
        }
    }

    /// The value the predicate looked at, for message rendering.
    pub fn observed(&self, snapshot: &AggregateSnapshot) -> f64 {
        match self {
            Predicate::Threshold(condition) => condition.statistic.of(snapshot),
            Predicate::Custom(_) => snapshot.avg,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Predicate::Threshold(c) => {
                format!("{} {} {}", c.statistic.as_str(), c.comparison.symbol(), c.threshold)
            }
            Predicate::Custom(custom) => custom.label.clone(),
        }
    }
}

pub const DEFAULT_MESSAGE_TEMPLATE: &str =
    "{{rule}}: {{statistic}} of {{metric}} over {{window}} is {{value}} (threshold {{threshold}})";

/// Declarative alerting rule. Only `last_triggered` changes after configuration,
/// and that field lives in the alert engine.
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub id: RuleId,
    pub name: String,
    pub severity: Severity,
    pub metric: MetricKind,
    pub window: Duration,
    pub tags: TagFilter,
    pub predicate: Predicate,
    pub min_samples: usize,
    pub message_template: String,
    pub channels: BTreeSet<Channel>,
    pub cooldown: Duration,
    pub auto_resolve: bool,
}

impl AlertRule {
    pub fn new(
        id: impl Into<RuleId>,
        name: impl Into<String>,
        metric: MetricKind,
        window: Duration,
        predicate: Predicate,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            severity: Severity::Medium,
            metric,
            window,
            tags: TagFilter::any(),
            predicate,
            min_samples: 1,
            message_template: DEFAULT_MESSAGE_TEMPLATE.to_string(),
            channels: BTreeSet::new(),
            cooldown: Duration::from_secs(300),
            auto_resolve: false,
        }
    }

    pub fn threshold(
        id: impl Into<RuleId>,
        name: impl Into<String>,
        metric: MetricKind,
        window: Duration,
        statistic: Statistic,
        comparison: Comparison,
        threshold: f64,
    ) -> Self {
        Self::new(
            id,
            name,
            metric,
            window,
            Predicate::Threshold(ThresholdCondition {
                statistic,
                comparison,
                threshold,
            }),
        )
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channels.insert(channel);
        self
    }

    pub fn with_tags(mut self, tags: TagFilter) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_message_template(mut self, template: impl Into<String>) -> Self {
        self.message_template = template.into();
        self
    }

    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples;
        self
    }

    pub fn with_auto_resolve(mut self, auto_resolve: bool) -> Self {
        self.auto_resolve = auto_resolve;
        self
    }

    /// Whether the rule matches `snapshot`; too few samples never match.
    pub fn matches(&self, snapshot: &AggregateSnapshot) -> anyhow::Result<bool> {
        if snapshot.count < self.min_samples.max(1) {
            return Ok(false);
        }
        self.predicate.evaluate(snapshot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn is_unresolved(&self) -> bool {
        !matches!(self, AlertStatus::Resolved)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub rule_id: RuleId,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub observed_value: f64,
    pub triggered_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub status: AlertStatus,
}

impl Alert {
    pub fn new(
        rule: &AlertRule,
        message: String,
        observed_value: f64,
        triggered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            severity: rule.severity,
            title: format!("[{}] {}", rule.severity.as_str().to_uppercase(), rule.name),
            message,
            observed_value,
            triggered_at,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            status: AlertStatus::Active,
        }
    }

    /// Moves an active alert to acknowledged. Returns false when nothing changed.
    pub fn acknowledge(&mut self, actor: &str, now: DateTime<Utc>) -> bool {
        if self.status != AlertStatus::Active {
            return false;
        }
        self.status = AlertStatus::Acknowledged;
        self.acknowledged_at = Some(now);
        self.acknowledged_by = Some(actor.to_string());
        true
    }

    /// Moves an unresolved alert to resolved. Returns false when nothing changed.
    pub fn resolve(&mut self, actor: &str, now: DateTime<Utc>) -> bool {
        if self.status == AlertStatus::Resolved {
            return false;
        }
        self.status = AlertStatus::Resolved;
        self.resolved_at = Some(now);
        self.resolved_by = Some(actor.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> AlertRule {
        AlertRule::threshold(
            "slow-api",
            "Slow API",
            MetricKind::ResponseTime,
            Duration::from_secs(60),
            Statistic::Avg,
            Comparison::Gt,
            500.0,
        )
        .with_severity(Severity::High)
    }

    #[test]
    fn threshold_rule_matches_on_statistic() {
        let rule = rule();
        let hot = AggregateSnapshot::from_values(
            MetricKind::ResponseTime,
            Duration::from_secs(60),
            &[600.0, 600.0],
        );
        let cold = AggregateSnapshot::from_values(
            MetricKind::ResponseTime,
            Duration::from_secs(60),
            &[100.0],
        );
        assert!(rule.matches(&hot).unwrap());
        assert!(!rule.matches(&cold).unwrap());
    }

    #[test]
    fn empty_snapshot_never_matches() {
        let rule = AlertRule::threshold(
            "idle",
            "Idle",
            MetricKind::Throughput,
            Duration::from_secs(60),
            Statistic::Avg,
            Comparison::Lt,
            1.0,
        );
        let empty = AggregateSnapshot::empty(MetricKind::Throughput, Duration::from_secs(60));
        assert!(!rule.matches(&empty).unwrap());
    }

    #[test]
    fn custom_predicate_errors_propagate() {
        let rule = AlertRule::new(
            "broken",
            "Broken",
            MetricKind::CpuUsage,
            Duration::from_secs(60),
            Predicate::Custom(CustomPredicate::new("always fails", |_| {
                anyhow::bail!("boom")
            })),
        );
        let snapshot =
            AggregateSnapshot::from_values(MetricKind::CpuUsage, Duration::from_secs(60), &[1.0]);
        assert!(rule.matches(&snapshot).is_err());
    }

    #[test]
    fn alert_transitions_are_monotonic() {
        let now = Utc::now();
        let mut alert = Alert::new(&rule(), "msg".into(), 600.0, now);
        assert_eq!(alert.title, "[HIGH] Slow API");

        assert!(alert.acknowledge("ops", now));
        assert!(!alert.acknowledge("ops", now));
        assert!(alert.resolve("ops", now));
        assert!(!alert.resolve("ops", now));
        assert!(!alert.acknowledge("ops", now));
        assert_eq!(alert.status, AlertStatus::Resolved);
    }
}
