use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use pulsewatch_domain::{
    AggregateSnapshot, Alert, AlertError, AlertRule, ChannelConfig, Clock, HealthLevel,
    MetricKind, MetricsError, PulsewatchConfig, Sample, ScalingDecision, SystemHealthStatus,
    TagFilter,
};
use pulsewatch_ports::{
    HealthReporter, InstanceRegistry, MetricRepository, NotificationService, PoolControl,
    SampleCollector, ScalingControl,
};

use crate::alert_engine::AlertEngine;
use crate::scheduler::{LoopRegistry, LoopStats, Supervisor};

/// Every subsystem the orchestrator drives. Pool, balancer and scaler are
/// optional; their loops are only started when present.
#[derive(Clone)]
pub struct Subsystems {
    pub metrics: Arc<dyn MetricRepository>,
    pub alerts: Arc<AlertEngine>,
    pub notifications: Arc<dyn NotificationService>,
    pub collectors: Vec<Arc<dyn SampleCollector>>,
    pub pool: Option<Arc<dyn PoolControl>>,
    pub balancer: Option<Arc<dyn InstanceRegistry>>,
    pub scaler: Option<Arc<dyn ScalingControl>>,
}

/// Loop periods and lifecycle timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub collection: Duration,
    pub alert_check: Duration,
    pub health_check: Duration,
    pub pool_resize: Duration,
    pub pool_maintenance: Duration,
    pub balancer_probe: Duration,
    pub auto_scale: Duration,
    pub metric_purge: Duration,
    pub alert_cleanup: Duration,
    pub restart_delay: Duration,
    pub shutdown_grace: Duration,
}

impl Schedule {
    pub fn from_config(config: &PulsewatchConfig) -> Self {
        Self {
            collection: config.orchestrator.collection_interval,
            alert_check: config.orchestrator.alert_interval,
            health_check: config.orchestrator.health_interval,
            pool_resize: config.pool.resize_interval,
            pool_maintenance: config.pool.maintenance_interval,
            balancer_probe: config.balancer.health_check_interval,
            auto_scale: config.autoscaler.interval,
            metric_purge: config.metrics.purge_interval,
            alert_cleanup: config.alerts.cleanup_interval,
            restart_delay: config.orchestrator.restart_delay,
            shutdown_grace: config.orchestrator.shutdown_grace,
        }
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self::from_config(&PulsewatchConfig::default())
    }
}

struct Inner {
    subsystems: Subsystems,
    clock: Arc<dyn Clock>,
    loops: Arc<LoopRegistry>,
    last_health: Mutex<Option<SystemHealthStatus>>,
}

impl Inner {
    async fn collect(&self) -> Result<()> {
        let mut recorded = 0usize;
        for collector in &self.subsystems.collectors {
            match collector.collect().await {
                Ok(samples) => {
                    for sample in samples {
                        match self.subsystems.metrics.record(sample) {
                            Ok(()) => recorded += 1,
                            Err(err) => debug!(collector = collector.name(), error = %err, "collected sample dropped"),
                        }
                    }
                }
                Err(err) => {
                    warn!(collector = collector.name(), error = %format!("{err:#}"), "collector failed")
                }
            }
        }
        let flushed = self
            .subsystems
            .metrics
            .flush()
            .context("flushing collected samples")?;
        debug!(recorded, flushed, "collection cycle finished");
        Ok(())
    }

    async fn evaluate_alerts(&self) -> Result<()> {
        let report = self.subsystems.alerts.evaluate().await;
        if !report.fired.is_empty() || !report.errors.is_empty() {
            info!(
                evaluated = report.evaluated,
                fired = report.fired.len(),
                rearmed = report.rearmed,
                auto_resolved = report.auto_resolved,
                errors = report.errors.len(),
                "alert cycle finished"
            );
        }
        Ok(())
    }

    fn compute_health(&self) -> SystemHealthStatus {
        let subsystems = &self.subsystems;
        let mut components = vec![
            subsystems.metrics.component_health(),
            subsystems.alerts.component_health(),
            subsystems.notifications.component_health(),
        ];
        if let Some(pool) = &subsystems.pool {
            components.push(pool.component_health());
        }
        if let Some(balancer) = &subsystems.balancer {
            components.push(balancer.component_health());
        }
        components.push(self.loops.health());

        let status = SystemHealthStatus::from_components(
            components,
            subsystems.alerts.active_alerts().len(),
            self.clock.now(),
        );
        let previous = self
            .last_health
            .lock()
            .expect("health cache lock poisoned")
            .replace(status.clone());
        let changed = previous.is_none_or(|previous| previous.overall != status.overall);
        if changed {
            match status.overall {
                HealthLevel::Healthy => info!(overall = status.overall.as_str(), "system health changed"),
                _ => warn!(overall = status.overall.as_str(), "system health changed"),
            }
        }
        status
    }

    async fn probe_instances(&self) -> Result<()> {
        if let Some(balancer) = &self.subsystems.balancer {
            balancer.run_health_checks().await;
        }
        Ok(())
    }

    async fn auto_scale(&self) -> Result<()> {
        let Some(scaler) = &self.subsystems.scaler else {
            return Ok(());
        };
        let load = self
            .subsystems
            .balancer
            .as_ref()
            .and_then(|balancer| balancer.average_load());
        scaler.on_load(load).await
    }

    async fn resize_pool(&self) -> Result<()> {
        if let Some(pool) = &self.subsystems.pool {
            let capacity = pool.resize_tick();
            debug!(capacity, "pool resize tick");
        }
        Ok(())
    }

    async fn maintain_pool(&self) -> Result<()> {
        match &self.subsystems.pool {
            Some(pool) => pool.maintain().await,
            None => Ok(()),
        }
    }

    async fn purge_metrics(&self) -> Result<()> {
        let purged = self
            .subsystems
            .metrics
            .purge_expired()
            .context("purging expired samples")?;
        if purged > 0 {
            info!(purged, "expired samples purged");
        }
        Ok(())
    }

    async fn cleanup_alerts(&self) -> Result<()> {
        self.subsystems.alerts.cleanup_history(self.clock.now());
        Ok(())
    }
}

/// Top-level lifecycle owner of every periodic loop.
pub struct Orchestrator {
    inner: Arc<Inner>,
    schedule: Schedule,
    pub(crate) running: Mutex<Option<Supervisor>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn new(subsystems: Subsystems, schedule: Schedule, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                subsystems,
                clock,
                loops: Arc::new(LoopRegistry::default()),
                last_health: Mutex::new(None),
            }),
            schedule,
            running: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn subsystems(&self) -> &Subsystems {
        &self.inner.subsystems
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Recovers from poisoning: any value left behind is a valid state.
    fn running(&self) -> MutexGuard<'_, Option<Supervisor>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts every loop. Starting a running orchestrator is a logged no-op.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        tokio::runtime::Handle::try_current()
            .context("orchestrator must be started inside a tokio runtime")?;
        let mut running = self.running();
        if running.is_some() {
            info!("orchestrator already running");
            return Ok(());
        }
        info!("orchestrator starting");
        let supervisor = self.spawn_loops();
        info!(loops = supervisor.len(), "orchestrator started");
        *running = Some(supervisor);
        Ok(())
    }

    fn spawn_loops(&self) -> Supervisor {
        let mut supervisor = Supervisor::new(
            Arc::clone(&self.inner.loops),
            Arc::clone(&self.inner.clock),
        );
        let schedule = &self.schedule;
        let subsystems = &self.inner.subsystems;

        self.every(&mut supervisor, "collection", schedule.collection, |inner| async move {
            inner.collect().await
        });
        self.every(&mut supervisor, "alert-check", schedule.alert_check, |inner| async move {
            inner.evaluate_alerts().await
        });
        self.every(&mut supervisor, "health-check", schedule.health_check, |inner| async move {
            inner.compute_health();
            Ok(())
        });
        self.every(&mut supervisor, "metric-purge", schedule.metric_purge, |inner| async move {
            inner.purge_metrics().await
        });
        self.every(&mut supervisor, "alert-cleanup", schedule.alert_cleanup, |inner| async move {
            inner.cleanup_alerts().await
        });
        if subsystems.pool.is_some() {
            self.every(&mut supervisor, "pool-resize", schedule.pool_resize, |inner| async move {
                inner.resize_pool().await
            });
            self.every(
                &mut supervisor,
                "pool-maintenance",
                schedule.pool_maintenance,
                |inner| async move { inner.maintain_pool().await },
            );
        }
        if subsystems.balancer.is_some() {
            self.every(&mut supervisor, "balancer-probe", schedule.balancer_probe, |inner| async move {
                inner.probe_instances().await
            });
        }
        if subsystems.scaler.is_some() {
            self.every(&mut supervisor, "auto-scale", schedule.auto_scale, |inner| async move {
                inner.auto_scale().await
            });
        }
        supervisor
    }

    fn every<J, Fut>(&self, supervisor: &mut Supervisor, name: &str, period: Duration, job: J)
    where
        J: Fn(Arc<Inner>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        supervisor.spawn_periodic(name, period, move || job(Arc::clone(&inner)));
    }

    /// Cancels every loop and waits for in-flight ticks, bounded by the
    /// shutdown grace. Stopping a stopped orchestrator is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let supervisor = self.running().take();
        let Some(supervisor) = supervisor else {
            debug!("orchestrator already stopped");
            return Ok(());
        };
        info!("orchestrator stopping");
        supervisor.shutdown(self.schedule.shutdown_grace).await;
        info!("orchestrator stopped");
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        info!(delay = ?self.schedule.restart_delay, "orchestrator restarting");
        self.stop().await?;
        tokio::time::sleep(self.schedule.restart_delay).await;
        self.start().await
    }

    /// Synchronous best-effort shutdown for failure handlers. Never fails
    /// and never waits: timers are cancelled at once, while a tick already
    /// inside a send or acquire is detached and finishes on its own.
    pub fn emergency_stop(&self) {
        let supervisor = self.running().take();
        match supervisor {
            Some(supervisor) => {
                warn!(loops = supervisor.len(), "orchestrator emergency stop");
                supervisor.cancel();
            }
            None => warn!("orchestrator emergency stop requested while stopped"),
        }
    }

    /// Recomputes system health and refreshes the cached status.
    pub fn get_health(&self) -> SystemHealthStatus {
        self.inner.compute_health()
    }

    /// Status computed by the most recent health-check tick, if any.
    pub fn cached_health(&self) -> Option<SystemHealthStatus> {
        self.inner
            .last_health
            .lock()
            .expect("health cache lock poisoned")
            .clone()
    }

    pub fn loop_stats(&self) -> BTreeMap<String, LoopStats> {
        self.inner.loops.snapshot()
    }

    /// Runs one collection pass outside the schedule.
    pub async fn collect_now(&self) -> Result<()> {
        self.inner.collect().await
    }

    /// Fire-and-forget ingestion; a dropped sample is logged, never returned.
    pub fn record_sample(
        &self,
        kind: MetricKind,
        value: f64,
        unit: &str,
        tags: BTreeMap<String, String>,
    ) {
        let sample = Sample {
            kind,
            value,
            unit: unit.to_string(),
            timestamp: self.inner.clock.now(),
            tags,
        };
        if let Err(err) = self.inner.subsystems.metrics.record(sample) {
            debug!(error = %err, "sample ingestion dropped");
        }
    }

    pub fn get_aggregate(
        &self,
        kind: &MetricKind,
        window: Duration,
        tags: Option<&TagFilter>,
    ) -> Result<AggregateSnapshot, MetricsError> {
        let any = TagFilter::any();
        self.inner
            .subsystems
            .metrics
            .aggregate(kind, window, tags.unwrap_or(&any))
    }

    /// Returns false when no balancer is wired.
    pub fn register_instance(&self, id: &str, address: &str) -> bool {
        match &self.inner.subsystems.balancer {
            Some(balancer) => {
                balancer.register_instance(id, address);
                true
            }
            None => {
                error!(instance = id, "no load balancer configured; registration ignored");
                false
            }
        }
    }

    pub fn deregister_instance(&self, id: &str) -> bool {
        self.inner
            .subsystems
            .balancer
            .as_ref()
            .is_some_and(|balancer| balancer.deregister_instance(id))
    }

    pub fn configure_rule(&self, rule: AlertRule) {
        self.inner.subsystems.alerts.configure_rule(rule);
    }

    pub fn remove_rule(&self, rule_id: &str) -> Result<(), AlertError> {
        self.inner.subsystems.alerts.remove_rule(rule_id)
    }

    pub fn configure_channels(&self, configs: &[ChannelConfig]) {
        self.inner.subsystems.notifications.configure_channels(configs);
    }

    pub fn get_active_alerts(&self) -> Vec<Alert> {
        self.inner.subsystems.alerts.active_alerts()
    }

    pub fn acknowledge_alert(&self, alert_id: &str, actor: &str) -> Result<Alert, AlertError> {
        self.inner.subsystems.alerts.acknowledge(alert_id, actor)
    }

    pub fn resolve_alert(&self, alert_id: &str, actor: &str) -> Result<Alert, AlertError> {
        self.inner.subsystems.alerts.resolve(alert_id, actor)
    }

    pub fn get_scaling_history(&self) -> Vec<ScalingDecision> {
        self.inner
            .subsystems
            .scaler
            .as_ref()
            .map(|scaler| scaler.history())
            .unwrap_or_default()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        let running = match self.running.get_mut() {
            Ok(running) => running.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(supervisor) = running {
            supervisor.cancel();
        }
    }
}
