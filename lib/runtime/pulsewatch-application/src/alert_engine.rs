use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use handlebars::Handlebars;
use serde::Serialize;
use tracing::{debug, info, warn};

use pulsewatch_domain::clock::to_chrono;
use pulsewatch_domain::{
    AggregateSnapshot, Alert, AlertError, AlertId, AlertRule, Clock, ComponentHealth,
    NotificationMessage, Predicate, RuleId, Severity,
};
use pulsewatch_ports::{AggregateSource, HealthReporter, NotificationPort};

const SYSTEM_ACTOR: &str = "system";

/// Outcome of one pass over every configured rule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationReport {
    pub evaluated: usize,
    pub fired: Vec<AlertId>,
    /// Rules that matched while an unresolved alert already existed.
    pub rearmed: usize,
    /// Rules that matched inside their cooldown window.
    pub suppressed: usize,
    pub auto_resolved: usize,
    pub errors: Vec<AlertError>,
}

enum RuleOutcome {
    NoMatch,
    Fired(AlertId),
    Rearmed,
    Suppressed,
    AutoResolved(usize),
    Failed(AlertError),
}

/// Rule plus the cooldown anchor. The anchor outlives rule replacement and
/// its lock serializes evaluations of the same rule.
struct RuleSlot {
    rule: AlertRule,
    last_triggered: Arc<tokio::sync::Mutex<Option<DateTime<Utc>>>>,
}

#[derive(Serialize)]
struct MessageContext<'a> {
    rule: &'a str,
    metric: &'a str,
    value: String,
    threshold: String,
    statistic: &'a str,
    severity: &'static str,
    window: String,
}

pub struct AlertEngine {
    source: Arc<dyn AggregateSource>,
    notifier: Arc<dyn NotificationPort>,
    clock: Arc<dyn Clock>,
    rules: RwLock<BTreeMap<RuleId, Arc<RuleSlot>>>,
    alerts: Mutex<Vec<Alert>>,
    templates: Handlebars<'static>,
    history_retention: Duration,
}

impl AlertEngine {
    pub fn new(
        source: Arc<dyn AggregateSource>,
        notifier: Arc<dyn NotificationPort>,
        clock: Arc<dyn Clock>,
        history_retention: Duration,
    ) -> Self {
        let mut templates = Handlebars::new();
        templates.register_escape_fn(handlebars::no_escape);
        Self {
            source,
            notifier,
            clock,
            rules: RwLock::new(BTreeMap::new()),
            alerts: Mutex::new(Vec::new()),
            templates,
            history_retention,
        }
    }

    /// Adds or replaces a rule. A replaced rule keeps its cooldown anchor.
    pub fn configure_rule(&self, rule: AlertRule) {
        let mut rules = self.rules.write().expect("alert rules lock poisoned");
        let last_triggered = rules
            .get(&rule.id)
            .map(|slot| Arc::clone(&slot.last_triggered))
            .unwrap_or_default();
        info!(rule_id = %rule.id, severity = %rule.severity, "alert rule configured");
        rules.insert(
            rule.id.clone(),
            Arc::new(RuleSlot {
                rule,
                last_triggered,
            }),
        );
    }

    pub fn remove_rule(&self, rule_id: &str) -> Result<(), AlertError> {
        let removed = self
            .rules
            .write()
            .expect("alert rules lock poisoned")
            .remove(rule_id);
        match removed {
            Some(_) => {
                info!(rule_id, "alert rule removed");
                Ok(())
            }
            None => Err(AlertError::UnknownRule(rule_id.to_string())),
        }
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.rules
            .read()
            .expect("alert rules lock poisoned")
            .values()
            .map(|slot| slot.rule.clone())
            .collect()
    }

    /// Evaluates every rule once. Rules run concurrently; each rule's own
    /// evaluations never overlap.
    pub async fn evaluate(&self) -> EvaluationReport {
        let slots: Vec<Arc<RuleSlot>> = self
            .rules
            .read()
            .expect("alert rules lock poisoned")
            .values()
            .cloned()
            .collect();

        let outcomes = join_all(slots.iter().map(|slot| self.evaluate_rule(slot))).await;

        let mut report = EvaluationReport {
            evaluated: slots.len(),
            ..EvaluationReport::default()
        };
        for outcome in outcomes {
            match outcome {
                RuleOutcome::NoMatch => {}
                RuleOutcome::Fired(id) => report.fired.push(id),
                RuleOutcome::Rearmed => report.rearmed += 1,
                RuleOutcome::Suppressed => report.suppressed += 1,
                RuleOutcome::AutoResolved(count) => report.auto_resolved += count,
                RuleOutcome::Failed(err) => report.errors.push(err),
            }
        }
        debug!(
            evaluated = report.evaluated,
            fired = report.fired.len(),
            errors = report.errors.len(),
            "alert evaluation finished"
        );
        report
    }

    async fn evaluate_rule(&self, slot: &RuleSlot) -> RuleOutcome {
        let mut last_triggered = slot.last_triggered.lock().await;
        let rule = &slot.rule;
        let now = self.clock.now();

        let snapshot = match self.source.aggregate(&rule.metric, rule.window, &rule.tags) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(rule_id = %rule.id, error = %err, "aggregate unavailable; skipping rule");
                return RuleOutcome::Failed(AlertError::RuleEvaluation {
                    rule_id: rule.id.clone(),
                    reason: err.to_string(),
                });
            }
        };

        let matched = match rule.matches(&snapshot) {
            Ok(matched) => matched,
            Err(err) => {
                warn!(rule_id = %rule.id, error = %format!("{err:#}"), "rule predicate failed; treating as no match");
                return RuleOutcome::Failed(AlertError::RuleEvaluation {
                    rule_id: rule.id.clone(),
                    reason: format!("{err:#}"),
                });
            }
        };

        if !matched {
            if rule.auto_resolve {
                let resolved = self.resolve_for_rule(&rule.id, now);
                if resolved > 0 {
                    info!(rule_id = %rule.id, resolved, "alerts auto-resolved");
                    return RuleOutcome::AutoResolved(resolved);
                }
            }
            return RuleOutcome::NoMatch;
        }

        if let Some(last) = *last_triggered {
            if now < last + to_chrono(rule.cooldown) {
                debug!(rule_id = %rule.id, "rule matched inside cooldown");
                return RuleOutcome::Suppressed;
            }
        }
        *last_triggered = Some(now);

        if self.has_unresolved(&rule.id) {
            debug!(rule_id = %rule.id, "rule re-armed with an unresolved alert outstanding");
            return RuleOutcome::Rearmed;
        }

        let observed = rule.predicate.observed(&snapshot);
        let message = self.render_message(rule, &snapshot, observed);
        let alert = Alert::new(rule, message, observed, now);
        let alert_id = alert.id.clone();
        let notification = NotificationMessage::new(
            alert.title.clone(),
            alert.message.clone(),
            rule.severity.priority(),
            rule.channels.clone(),
            now,
        );
        self.alerts
            .lock()
            .expect("alerts lock poisoned")
            .push(alert);
        info!(rule_id = %rule.id, alert_id = %alert_id, severity = %rule.severity, observed, "alert fired");

        if !rule.channels.is_empty() {
            let result = self.notifier.send(&notification, &rule.channels).await;
            if !result.all_succeeded() {
                warn!(
                    alert_id = %alert_id,
                    failed = ?result.failed_channels(),
                    "alert notification partially failed"
                );
            }
        }
        RuleOutcome::Fired(alert_id)
    }

    fn render_message(&self, rule: &AlertRule, snapshot: &AggregateSnapshot, observed: f64) -> String {
        let (statistic, threshold) = match &rule.predicate {
            Predicate::Threshold(condition) => {
                (condition.statistic.as_str(), format!("{}", condition.threshold))
            }
            Predicate::Custom(custom) => (custom.label(), "n/a".to_string()),
        };
        let context = MessageContext {
            rule: &rule.name,
            metric: snapshot.kind.as_str(),
            value: format!("{observed:.2}"),
            threshold,
            statistic,
            severity: rule.severity.as_str(),
            window: humantime::format_duration(rule.window).to_string(),
        };
        match self.templates.render_template(&rule.message_template, &context) {
            Ok(message) => message,
            Err(err) => {
                warn!(rule_id = %rule.id, error = %err, "alert message template failed to render");
                format!(
                    "{}: {} {} ({})",
                    rule.name,
                    snapshot.kind,
                    context.value,
                    rule.predicate.describe()
                )
            }
        }
    }

    fn has_unresolved(&self, rule_id: &str) -> bool {
        self.alerts
            .lock()
            .expect("alerts lock poisoned")
            .iter()
            .any(|alert| alert.rule_id == rule_id && alert.status.is_unresolved())
    }

    fn resolve_for_rule(&self, rule_id: &str, now: DateTime<Utc>) -> usize {
        let mut alerts = self.alerts.lock().expect("alerts lock poisoned");
        alerts
            .iter_mut()
            .filter(|alert| alert.rule_id == rule_id)
            .map(|alert| alert.resolve(SYSTEM_ACTOR, now))
            .filter(|changed| *changed)
            .count()
    }

    fn transition(
        &self,
        alert_id: &str,
        apply: impl FnOnce(&mut Alert, DateTime<Utc>) -> bool,
    ) -> Result<(Alert, bool), AlertError> {
        let now = self.clock.now();
        let mut alerts = self.alerts.lock().expect("alerts lock poisoned");
        let alert = alerts
            .iter_mut()
            .find(|alert| alert.id == alert_id)
            .ok_or_else(|| AlertError::UnknownAlert(alert_id.to_string()))?;
        let changed = apply(alert, now);
        Ok((alert.clone(), changed))
    }

    /// Idempotent; acknowledging anything but an active alert changes nothing.
    pub fn acknowledge(&self, alert_id: &str, actor: &str) -> Result<Alert, AlertError> {
        let (alert, changed) =
            self.transition(alert_id, |alert, now| alert.acknowledge(actor, now))?;
        if changed {
            info!(alert_id, actor, "alert acknowledged");
        }
        Ok(alert)
    }

    /// Idempotent; an active alert may skip straight to resolved.
    pub fn resolve(&self, alert_id: &str, actor: &str) -> Result<Alert, AlertError> {
        let (alert, changed) = self.transition(alert_id, |alert, now| alert.resolve(actor, now))?;
        if changed {
            info!(alert_id, actor, "alert resolved");
        }
        Ok(alert)
    }

    pub fn alert(&self, alert_id: &str) -> Option<Alert> {
        self.alerts
            .lock()
            .expect("alerts lock poisoned")
            .iter()
            .find(|alert| alert.id == alert_id)
            .cloned()
    }

    /// Unresolved alerts, oldest first.
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .expect("alerts lock poisoned")
            .iter()
            .filter(|alert| alert.status.is_unresolved())
            .cloned()
            .collect()
    }

    pub fn history(&self) -> Vec<Alert> {
        self.alerts.lock().expect("alerts lock poisoned").clone()
    }

    /// Drops resolved alerts whose resolution is older than the retention.
    pub fn cleanup_history(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - to_chrono(self.history_retention);
        let mut alerts = self.alerts.lock().expect("alerts lock poisoned");
        let before = alerts.len();
        alerts.retain(|alert| alert.resolved_at.is_none_or(|resolved| resolved >= cutoff));
        let removed = before - alerts.len();
        if removed > 0 {
            info!(removed, "alert history cleaned up");
        }
        removed
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl HealthReporter for AlertEngine {
    fn component_health(&self) -> ComponentHealth {
        let active = self.active_alerts();
        let count = |severity: Severity| active.iter().filter(|a| a.severity == severity).count();
        let critical = count(Severity::Critical);
        if critical > 0 {
            return ComponentHealth::critical("alerts", format!("{critical} critical alerts active"));
        }
        let high = count(Severity::High);
        if high > 0 {
            return ComponentHealth::warning("alerts", format!("{high} high alerts active"));
        }
        ComponentHealth::healthy("alerts")
    }
}
