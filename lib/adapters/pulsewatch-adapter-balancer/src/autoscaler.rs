use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use pulsewatch_domain::clock::to_chrono;
use pulsewatch_domain::{AutoScalerConfig, Clock, ScalingDecision};
use pulsewatch_ports::{ScaleExecutor, ScalingControl};

use crate::LoadBalancer;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalingVerdict {
    ScaleUp { from: u32, to: u32 },
    ScaleDown { from: u32, to: u32 },
    CoolingDown { remaining: Duration },
    NoAction,
    NoHealthyInstances,
}

impl ScalingVerdict {
    pub fn target(&self) -> Option<(u32, u32)> {
        match *self {
            ScalingVerdict::ScaleUp { from, to } | ScalingVerdict::ScaleDown { from, to } => {
                Some((from, to))
            }
            _ => None,
        }
    }
}

/// Default executor: records the request in the log and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingScaleExecutor;

#[async_trait]
impl ScaleExecutor for LoggingScaleExecutor {
    async fn scale_to(&self, from: u32, to: u32) -> Result<()> {
        info!(from, to, "scale request issued");
        Ok(())
    }
}

struct ScalerState {
    current: u32,
    last_action: Option<DateTime<Utc>>,
    history: Vec<ScalingDecision>,
}

/// Threshold controller over the balancer's average load, damped by a
/// cooldown after every executed action.
pub struct AutoScaler {
    config: AutoScalerConfig,
    executor: Arc<dyn ScaleExecutor>,
    clock: Arc<dyn Clock>,
    state: Mutex<ScalerState>,
    tick: tokio::sync::Mutex<()>,
}

impl AutoScaler {
    pub fn new(
        config: AutoScalerConfig,
        executor: Arc<dyn ScaleExecutor>,
        clock: Arc<dyn Clock>,
        initial_instances: u32,
    ) -> Self {
        let current = initial_instances.clamp(
            config.min_instances,
            config.max_instances.max(config.min_instances),
        );
        Self {
            config,
            executor,
            clock,
            state: Mutex::new(ScalerState {
                current,
                last_action: None,
                history: Vec::new(),
            }),
            tick: tokio::sync::Mutex::new(()),
        }
    }

    pub fn current_instances(&self) -> u32 {
        self.state.lock().expect("autoscaler state lock poisoned").current
    }

    /// Pure decision for the given load at `now`; changes nothing.
    pub fn observe(&self, average_load: Option<f64>, now: DateTime<Utc>) -> ScalingVerdict {
        let state = self.state.lock().expect("autoscaler state lock poisoned");
        decide(&self.config, state.current, state.last_action, average_load, now)
    }

    /// One control-loop step against the balancer's current load.
    pub async fn tick(&self, balancer: &LoadBalancer) -> Result<ScalingVerdict> {
        self.apply(balancer.average_load()).await
    }

    /// Decides on `average_load` and executes any resulting action. Only
    /// executed actions enter the history and start the cooldown.
    pub async fn apply(&self, average_load: Option<f64>) -> Result<ScalingVerdict> {
        let _serialized = self.tick.lock().await;
        let now = self.clock.now();
        let verdict = self.observe(average_load, now);
        let Some((from, to)) = verdict.target() else {
            return Ok(verdict);
        };

        if let Err(err) = self.executor.scale_to(from, to).await {
            warn!(from, to, error = %err, "scale request failed");
            return Err(err.context(format!("scaling from {from} to {to} failed")));
        }

        let load = average_load.unwrap_or_default();
        let mut state = self.state.lock().expect("autoscaler state lock poisoned");
        state.current = to;
        state.last_action = Some(now);
        state.history.push(ScalingDecision {
            timestamp: now,
            from_instances: from,
            to_instances: to,
            trigger_load: load,
        });
        info!(from, to, load, "autoscaler resized target");
        Ok(verdict)
    }

    pub fn history(&self) -> Vec<ScalingDecision> {
        self.state
            .lock()
            .expect("autoscaler state lock poisoned")
            .history
            .clone()
    }
}

#[async_trait]
impl ScalingControl for AutoScaler {
    async fn on_load(&self, average_load: Option<f64>) -> Result<()> {
        self.apply(average_load).await.map(|_| ())
    }

    fn history(&self) -> Vec<ScalingDecision> {
        AutoScaler::history(self)
    }
}

fn decide(
    config: &AutoScalerConfig,
    current: u32,
    last_action: Option<DateTime<Utc>>,
    average_load: Option<f64>,
    now: DateTime<Utc>,
) -> ScalingVerdict {
    if let Some(last) = last_action {
        let ready_at = last + to_chrono(config.cooldown);
        if now < ready_at {
            let remaining = (ready_at - now).to_std().unwrap_or_default();
            return ScalingVerdict::CoolingDown { remaining };
        }
    }
    let Some(load) = average_load else {
        return ScalingVerdict::NoHealthyInstances;
    };

    if load > config.scale_up_threshold && current < config.max_instances {
        ScalingVerdict::ScaleUp {
            from: current,
            to: current + 1,
        }
    } else if load < config.scale_down_threshold && current > config.min_instances {
        ScalingVerdict::ScaleDown {
            from: current,
            to: current - 1,
        }
    } else {
        ScalingVerdict::NoAction
    }
}
