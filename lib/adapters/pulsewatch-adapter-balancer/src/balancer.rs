use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use pulsewatch_domain::{
    BalancerConfig, Clock, ComponentHealth, RoutingError, ServerInstance,
};
use pulsewatch_ports::{HealthReporter, InstanceProber, InstanceRegistry};

use crate::strategy::{self, RoutingStrategy};

/// Shared per-instance state. Health fields are written by the health-check
/// cycle only; load and connection counts by request callbacks only.
struct InstanceState {
    id: String,
    address: String,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    last_health_check: Mutex<Option<DateTime<Utc>>>,
    load: AtomicU8,
    open_connections: AtomicU32,
    response_times: Mutex<VecDeque<f64>>,
    /// Responses completed since the last drain, in milliseconds.
    uncollected: Mutex<Vec<f64>>,
}

/// Cap on responses held for the collector between two drains.
const MAX_UNCOLLECTED: usize = 10_000;

impl InstanceState {
    fn new(id: String, address: String) -> Self {
        Self {
            id,
            address,
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            last_health_check: Mutex::new(None),
            load: AtomicU8::new(0),
            open_connections: AtomicU32::new(0),
            response_times: Mutex::new(VecDeque::new()),
            uncollected: Mutex::new(Vec::new()),
        }
    }

    fn snapshot(&self) -> ServerInstance {
        let avg_response_ms = {
            let times = self
                .response_times
                .lock()
                .expect("response times lock poisoned");
            (!times.is_empty()).then(|| times.iter().sum::<f64>() / times.len() as f64)
        };
        ServerInstance {
            id: self.id.clone(),
            address: self.address.clone(),
            healthy: self.healthy.load(Ordering::Acquire),
            load: self.load.load(Ordering::Relaxed),
            open_connections: self.open_connections.load(Ordering::Relaxed),
            last_health_check: *self
                .last_health_check
                .lock()
                .expect("health check time lock poisoned"),
            avg_response_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthCheckReport {
    pub checked: usize,
    pub healthy: usize,
    pub marked_unhealthy: usize,
    pub recovered: usize,
}

enum Transition {
    Unchanged,
    MarkedUnhealthy,
    Recovered,
}

pub struct LoadBalancer {
    instances: RwLock<Vec<Arc<InstanceState>>>,
    strategy: RwLock<Arc<dyn RoutingStrategy>>,
    prober: Arc<dyn InstanceProber>,
    clock: Arc<dyn Clock>,
    probe_timeout: Duration,
    failure_threshold: u32,
    response_window: usize,
}

impl LoadBalancer {
    pub fn new(
        config: &BalancerConfig,
        prober: Arc<dyn InstanceProber>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RoutingError> {
        let strategy: Arc<dyn RoutingStrategy> = Arc::from(strategy::from_name(&config.strategy)?);
        let balancer = Self {
            instances: RwLock::new(Vec::new()),
            strategy: RwLock::new(strategy),
            prober,
            clock,
            probe_timeout: config.probe_timeout,
            failure_threshold: config.failure_threshold.max(1),
            response_window: config.response_window.max(1),
        };
        for instance in &config.instances {
            balancer.register_instance(&instance.id, &instance.address);
        }
        Ok(balancer)
    }

    /// Adds an instance, replacing any previous registration with the same id.
    pub fn register_instance(&self, id: &str, address: &str) {
        let state = Arc::new(InstanceState::new(id.to_string(), address.to_string()));
        let mut instances = self.instances.write().expect("instance registry lock poisoned");
        match instances.iter_mut().find(|existing| existing.id == id) {
            Some(existing) => *existing = state,
            None => instances.push(state),
        }
        info!(instance = id, address, "instance registered");
    }

    pub fn deregister_instance(&self, id: &str) -> bool {
        let mut instances = self.instances.write().expect("instance registry lock poisoned");
        let before = instances.len();
        instances.retain(|existing| existing.id != id);
        let removed = instances.len() != before;
        if removed {
            info!(instance = id, "instance deregistered");
        }
        removed
    }

    fn registered(&self) -> Vec<Arc<InstanceState>> {
        self.instances
            .read()
            .expect("instance registry lock poisoned")
            .clone()
    }

    fn find(&self, id: &str) -> Result<Arc<InstanceState>, RoutingError> {
        self.instances
            .read()
            .expect("instance registry lock poisoned")
            .iter()
            .find(|state| state.id == id)
            .cloned()
            .ok_or_else(|| RoutingError::UnknownInstance(id.to_string()))
    }

    pub fn instances(&self) -> Vec<ServerInstance> {
        self.registered().iter().map(|state| state.snapshot()).collect()
    }

    pub fn healthy_instances(&self) -> Vec<ServerInstance> {
        self.instances()
            .into_iter()
            .filter(|instance| instance.healthy)
            .collect()
    }

    /// Never blocks. `None` means nothing is healthy; callers should fail the
    /// request rather than retry against the balancer.
    pub fn select(&self, client_key: Option<&str>) -> Option<ServerInstance> {
        let candidates = self.healthy_instances();
        if candidates.is_empty() {
            return None;
        }
        let strategy = Arc::clone(&self.strategy.read().expect("strategy lock poisoned"));
        let index = strategy.pick(&candidates, client_key).min(candidates.len() - 1);
        candidates.into_iter().nth(index)
    }

    pub fn route(&self, client_key: Option<&str>) -> Result<ServerInstance, RoutingError> {
        self.select(client_key)
            .ok_or(RoutingError::NoHealthyInstance)
    }

    pub fn set_strategy(&self, name: &str) -> Result<(), RoutingError> {
        let strategy: Arc<dyn RoutingStrategy> = Arc::from(strategy::from_name(name)?);
        let previous = std::mem::replace(
            &mut *self.strategy.write().expect("strategy lock poisoned"),
            strategy,
        );
        info!(from = previous.name(), to = name, "routing strategy switched");
        Ok(())
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.read().expect("strategy lock poisoned").name()
    }

    pub fn begin_request(&self, id: &str) -> Result<(), RoutingError> {
        self.find(id)?
            .open_connections
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn complete_request(&self, id: &str, response_time: Duration) -> Result<(), RoutingError> {
        let state = self.find(id)?;
        let _ = state
            .open_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |open| open.checked_sub(1));
        let millis = response_time.as_secs_f64() * 1000.0;
        {
            let mut times = state
                .response_times
                .lock()
                .expect("response times lock poisoned");
            times.push_back(millis);
            while times.len() > self.response_window {
                times.pop_front();
            }
        }
        let mut uncollected = state
            .uncollected
            .lock()
            .expect("uncollected responses lock poisoned");
        if uncollected.len() < MAX_UNCOLLECTED {
            uncollected.push(millis);
        }
        Ok(())
    }

    /// Takes the response times completed since the previous call, per
    /// instance id. Instances with no new responses are left out.
    pub fn drain_completed_responses(&self) -> Vec<(String, Vec<f64>)> {
        self.registered()
            .iter()
            .filter_map(|state| {
                let drained = std::mem::take(
                    &mut *state
                        .uncollected
                        .lock()
                        .expect("uncollected responses lock poisoned"),
                );
                (!drained.is_empty()).then(|| (state.id.clone(), drained))
            })
            .collect()
    }

    /// Records the instance's self-reported load, clamped to 0..=100.
    pub fn report_load(&self, id: &str, load: f64) -> Result<(), RoutingError> {
        let clamped = if load.is_finite() {
            load.clamp(0.0, 100.0).round() as u8
        } else {
            0
        };
        self.find(id)?.load.store(clamped, Ordering::Relaxed);
        Ok(())
    }

    /// Mean load across healthy instances; `None` when nothing is healthy.
    pub fn average_load(&self) -> Option<f64> {
        let healthy = self.healthy_instances();
        if healthy.is_empty() {
            return None;
        }
        let total: f64 = healthy.iter().map(|instance| f64::from(instance.load)).sum();
        Some(total / healthy.len() as f64)
    }

    /// Probes every instance concurrently, each under the probe timeout.
    pub async fn health_check_cycle(&self) -> HealthCheckReport {
        let registered = self.registered();
        let mut probes = JoinSet::new();
        for state in registered {
            let prober = Arc::clone(&self.prober);
            let clock = Arc::clone(&self.clock);
            let timeout = self.probe_timeout;
            let threshold = self.failure_threshold;
            probes.spawn(async move {
                let snapshot = state.snapshot();
                let outcome = match tokio::time::timeout(timeout, prober.probe(&snapshot)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => Err(format!("{err:#}")),
                    Err(_) => Err(format!("probe timed out after {timeout:?}")),
                };
                *state
                    .last_health_check
                    .lock()
                    .expect("health check time lock poisoned") = Some(clock.now());
                apply_probe(&state, outcome, threshold)
            });
        }

        let mut report = HealthCheckReport::default();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((healthy, transition)) => {
                    report.checked += 1;
                    if healthy {
                        report.healthy += 1;
                    }
                    match transition {
                        Transition::MarkedUnhealthy => report.marked_unhealthy += 1,
                        Transition::Recovered => report.recovered += 1,
                        Transition::Unchanged => {}
                    }
                }
                Err(err) => error!(error = %err, "health probe task failed"),
            }
        }
        debug!(
            checked = report.checked,
            healthy = report.healthy,
            "health check cycle finished"
        );
        report
    }
}

fn apply_probe(
    state: &InstanceState,
    outcome: Result<(), String>,
    threshold: u32,
) -> (bool, Transition) {
    match outcome {
        Ok(()) => {
            state.consecutive_failures.store(0, Ordering::Relaxed);
            if !state.healthy.swap(true, Ordering::AcqRel) {
                info!(instance = %state.id, "instance recovered");
                return (true, Transition::Recovered);
            }
            (true, Transition::Unchanged)
        }
        Err(reason) => {
            let failures = state.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(instance = %state.id, failures, reason = %reason, "health probe failed");
            if failures >= threshold && state.healthy.swap(false, Ordering::AcqRel) {
                warn!(instance = %state.id, failures, reason = %reason, "instance marked unhealthy");
                return (false, Transition::MarkedUnhealthy);
            }
            (state.healthy.load(Ordering::Acquire), Transition::Unchanged)
        }
    }
}

#[async_trait]
impl InstanceRegistry for LoadBalancer {
    fn register_instance(&self, id: &str, address: &str) {
        LoadBalancer::register_instance(self, id, address);
    }

    fn deregister_instance(&self, id: &str) -> bool {
        LoadBalancer::deregister_instance(self, id)
    }

    fn average_load(&self) -> Option<f64> {
        LoadBalancer::average_load(self)
    }

    async fn run_health_checks(&self) {
        self.health_check_cycle().await;
    }
}

impl HealthReporter for LoadBalancer {
    fn component_health(&self) -> ComponentHealth {
        let instances = self.instances();
        if instances.is_empty() {
            return ComponentHealth::healthy("balancer");
        }
        let unhealthy: Vec<_> = instances
            .iter()
            .filter(|instance| !instance.healthy)
            .map(|instance| instance.id.as_str())
            .collect();
        if unhealthy.len() == instances.len() {
            return ComponentHealth::critical("balancer", "no healthy instances");
        }
        if !unhealthy.is_empty() {
            return ComponentHealth::warning(
                "balancer",
                format!("unhealthy instances: {}", unhealthy.join(", ")),
            );
        }
        ComponentHealth::healthy("balancer")
    }
}
