use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use pulsewatch_domain::{
    AggregateSnapshot, AlertError, AlertRule, AlertStatus, Channel, ChannelOutcome, Clock, Comparison,
    CustomPredicate, DispatchResult, HealthLevel, ManualClock, MetricKind, MetricsError,
    NotificationMessage, Predicate, Priority, Severity, Statistic, TagFilter,
};
use pulsewatch_ports::{AggregateSource, HealthReporter, NotificationPort};

use crate::AlertEngine;

/// Serves whatever values the test last fed for a metric.
#[derive(Default)]
struct ScriptedSource {
    values: Mutex<BTreeMap<MetricKind, Vec<f64>>>,
    failing: Mutex<bool>,
}

impl ScriptedSource {
    fn feed(&self, kind: MetricKind, values: &[f64]) {
        self.values.lock().unwrap().insert(kind, values.to_vec());
    }
}

impl AggregateSource for ScriptedSource {
    fn aggregate(
        &self,
        kind: &MetricKind,
        window: Duration,
        _filter: &TagFilter,
    ) -> Result<AggregateSnapshot, MetricsError> {
        if *self.failing.lock().unwrap() {
            return Err(MetricsError::Storage("disk I/O error".into()));
        }
        let values = self.values.lock().unwrap();
        Ok(match values.get(kind) {
            Some(values) => AggregateSnapshot::from_values(kind.clone(), window, values),
            None => AggregateSnapshot::empty(kind.clone(), window),
        })
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<NotificationMessage>>,
}

#[async_trait]
impl NotificationPort for RecordingNotifier {
    async fn send(
        &self,
        message: &NotificationMessage,
        channels: &BTreeSet<Channel>,
    ) -> DispatchResult {
        self.sent.lock().unwrap().push(message.clone());
        DispatchResult {
            message_id: message.id.clone(),
            per_channel: channels
                .iter()
                .map(|channel| (*channel, ChannelOutcome::Delivered))
                .collect(),
        }
    }
}

struct Harness {
    engine: AlertEngine,
    source: Arc<ScriptedSource>,
    notifier: Arc<RecordingNotifier>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    let source = Arc::new(ScriptedSource::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let clock = Arc::new(ManualClock::default());
    let engine = AlertEngine::new(
        source.clone(),
        notifier.clone(),
        clock.clone(),
        Duration::from_secs(7 * 24 * 3600),
    );
    Harness {
        engine,
        source,
        notifier,
        clock,
    }
}

fn slow_api_rule() -> AlertRule {
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
    .with_cooldown(Duration::from_secs(60))
    .with_channel(Channel::Email)
    .with_channel(Channel::Slack)
}

#[tokio::test]
async fn breach_fires_once_per_cooldown() {
    let h = harness();
    h.engine.configure_rule(slow_api_rule());

    h.source.feed(MetricKind::ResponseTime, &[550.0, 650.0, 600.0]);
    let report = h.engine.evaluate().await;
    assert_eq!(report.fired.len(), 1);
    let first = h.engine.alert(&report.fired[0]).unwrap();
    assert_eq!(first.title, "[HIGH] Slow API");
    assert_eq!(
        first.message,
        "Slow API: avg of response_time over 1m is 600.00 (threshold 500)"
    );
    assert_eq!(first.observed_value, 600.0);

    let sent = h.notifier.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].priority, Priority::High);
    assert_eq!(
        sent[0].channels,
        BTreeSet::from([Channel::Email, Channel::Slack])
    );

    h.clock.advance(Duration::from_secs(10));
    h.source.feed(MetricKind::ResponseTime, &[700.0, 700.0]);
    let report = h.engine.evaluate().await;
    assert!(report.fired.is_empty());
    assert_eq!(report.suppressed, 1);

    h.engine.resolve(&first.id, "ops").unwrap();
    h.clock.advance(Duration::from_secs(55));
    let report = h.engine.evaluate().await;
    assert_eq!(report.fired.len(), 1);
    assert_ne!(report.fired[0], first.id);
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn sustained_breach_rearms_without_a_second_alert() {
    let h = harness();
    h.engine.configure_rule(slow_api_rule());
    h.source.feed(MetricKind::ResponseTime, &[900.0]);

    assert_eq!(h.engine.evaluate().await.fired.len(), 1);
    for _ in 0..3 {
        h.clock.advance(Duration::from_secs(61));
        let report = h.engine.evaluate().await;
        assert!(report.fired.is_empty());
        assert_eq!(report.rearmed, 1);
    }
    assert_eq!(h.engine.active_alerts().len(), 1);
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);

    // The re-arm refreshed the cooldown, so resolving does not fire at once.
    let id = h.engine.active_alerts()[0].id.clone();
    h.engine.resolve(&id, "ops").unwrap();
    h.clock.advance(Duration::from_secs(30));
    assert_eq!(h.engine.evaluate().await.suppressed, 1);
}

#[tokio::test]
async fn acknowledge_and_resolve_are_idempotent() {
    let h = harness();
    h.engine.configure_rule(slow_api_rule());
    h.source.feed(MetricKind::ResponseTime, &[900.0]);
    let id = h.engine.evaluate().await.fired.remove(0);

    let acked = h.engine.acknowledge(&id, "alice").unwrap();
    assert_eq!(acked.status, AlertStatus::Acknowledged);
    let again = h.engine.acknowledge(&id, "bob").unwrap();
    assert_eq!(again.acknowledged_by.as_deref(), Some("alice"));

    let resolved = h.engine.resolve(&id, "alice").unwrap();
    assert_eq!(resolved.status, AlertStatus::Resolved);
    assert_eq!(h.engine.resolve(&id, "bob").unwrap(), resolved);
    assert_eq!(h.engine.acknowledge(&id, "bob").unwrap(), resolved);
    assert!(h.engine.active_alerts().is_empty());

    assert_eq!(
        h.engine.resolve("missing", "ops"),
        Err(AlertError::UnknownAlert("missing".into()))
    );
}

#[tokio::test]
async fn failing_predicate_and_storage_are_reported_not_fired() {
    let h = harness();
    h.engine.configure_rule(AlertRule::new(
        "broken",
        "Broken",
        MetricKind::CpuUsage,
        Duration::from_secs(60),
        Predicate::Custom(CustomPredicate::new("explodes", |_| anyhow::bail!("boom"))),
    ));
    h.engine.configure_rule(slow_api_rule());
    h.source.feed(MetricKind::CpuUsage, &[50.0]);
    h.source.feed(MetricKind::ResponseTime, &[900.0]);

    let report = h.engine.evaluate().await;
    assert_eq!(report.evaluated, 2);
    assert_eq!(report.fired.len(), 1);
    assert!(matches!(
        &report.errors[..],
        [AlertError::RuleEvaluation { rule_id, reason }] if rule_id == "broken" && reason.contains("boom")
    ));

    *h.source.failing.lock().unwrap() = true;
    let report = h.engine.evaluate().await;
    assert_eq!(report.errors.len(), 2);
    assert!(report.fired.is_empty());
}

#[tokio::test]
async fn auto_resolve_clears_alerts_when_condition_recovers() {
    let h = harness();
    h.engine
        .configure_rule(slow_api_rule().with_auto_resolve(true).with_severity(Severity::Critical));
    h.source.feed(MetricKind::ResponseTime, &[900.0]);
    let id = h.engine.evaluate().await.fired.remove(0);
    assert_eq!(h.engine.component_health().level, HealthLevel::Critical);

    h.clock.advance(Duration::from_secs(5));
    h.source.feed(MetricKind::ResponseTime, &[120.0]);
    let report = h.engine.evaluate().await;
    assert_eq!(report.auto_resolved, 1);

    let alert = h.engine.alert(&id).unwrap();
    assert_eq!(alert.status, AlertStatus::Resolved);
    assert_eq!(alert.resolved_by.as_deref(), Some("system"));
    assert_eq!(h.engine.component_health().level, HealthLevel::Healthy);
}

#[tokio::test]
async fn min_samples_and_rule_management() {
    let h = harness();
    h.engine.configure_rule(slow_api_rule().with_min_samples(3));
    h.source.feed(MetricKind::ResponseTime, &[900.0, 900.0]);
    assert!(h.engine.evaluate().await.fired.is_empty());

    h.source.feed(MetricKind::ResponseTime, &[900.0, 900.0, 900.0]);
    assert_eq!(h.engine.evaluate().await.fired.len(), 1);

    // Replacing the rule keeps its cooldown anchor.
    h.engine.configure_rule(slow_api_rule().with_severity(Severity::Low));
    h.engine.resolve(&h.engine.active_alerts()[0].id, "ops").unwrap();
    assert_eq!(h.engine.evaluate().await.suppressed, 1);
    assert_eq!(h.engine.rules()[0].severity, Severity::Low);

    h.engine.remove_rule("slow-api").unwrap();
    assert_eq!(
        h.engine.remove_rule("slow-api"),
        Err(AlertError::UnknownRule("slow-api".into()))
    );
    assert_eq!(h.engine.evaluate().await.evaluated, 0);
}

#[tokio::test]
async fn custom_template_and_history_cleanup() {
    let h = harness();
    h.engine.configure_rule(
        slow_api_rule()
            .with_message_template("{{severity}} {{metric}}={{value}} > {{threshold}}"),
    );
    h.source.feed(MetricKind::ResponseTime, &[750.5]);
    let id = h.engine.evaluate().await.fired.remove(0);
    assert_eq!(h.engine.alert(&id).unwrap().message, "high response_time=750.50 > 500");
    assert_eq!(h.engine.component_health().level, HealthLevel::Warning);

    h.engine.resolve(&id, "ops").unwrap();
    h.clock.advance(Duration::from_secs(6 * 24 * 3600));
    assert_eq!(h.engine.cleanup_history(h.clock.now()), 0);
    h.clock.advance(Duration::from_secs(2 * 24 * 3600));
    assert_eq!(h.engine.cleanup_history(h.clock.now()), 1);
    assert!(h.engine.history().is_empty());
}
