use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use pulsewatch_domain::{Clock, ComponentHealth};

/// Run counters of one periodic loop. Survive restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoopStats {
    pub ticks: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub last_tick_failed: bool,
    pub last_run: Option<DateTime<Utc>>,
}

/// Shared table of per-loop statistics.
#[derive(Debug, Default)]
pub struct LoopRegistry {
    loops: Mutex<BTreeMap<String, LoopStats>>,
}

impl LoopRegistry {
    fn record(&self, name: &str, at: DateTime<Utc>, failure: Option<String>) {
        let mut loops = self.loops.lock().expect("loop stats lock poisoned");
        let stats = loops.entry(name.to_string()).or_default();
        stats.ticks += 1;
        stats.last_run = Some(at);
        stats.last_tick_failed = failure.is_some();
        if let Some(reason) = failure {
            stats.failures += 1;
            stats.last_error = Some(reason);
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, LoopStats> {
        self.loops.lock().expect("loop stats lock poisoned").clone()
    }

    /// `warning` while any loop's most recent tick failed.
    pub fn health(&self) -> ComponentHealth {
        let loops = self.loops.lock().expect("loop stats lock poisoned");
        let failing: Vec<&str> = loops
            .iter()
            .filter(|(_, stats)| stats.last_tick_failed)
            .map(|(name, _)| name.as_str())
            .collect();
        if failing.is_empty() {
            ComponentHealth::healthy("scheduler")
        } else {
            ComponentHealth::warning("scheduler", format!("failing loops: {}", failing.join(", ")))
        }
    }
}

/// Owns every periodic task of one run of the orchestrator.
pub struct Supervisor {
    token: CancellationToken,
    tasks: Vec<(String, JoinHandle<()>)>,
    registry: Arc<LoopRegistry>,
    clock: Arc<dyn Clock>,
}

impl Supervisor {
    pub fn new(registry: Arc<LoopRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Vec::new(),
            registry,
            clock,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Runs `tick` every `period` until cancelled. The first tick fires
    /// immediately. A failed or panicking tick is logged and counted; the
    /// loop carries on. An in-flight tick always runs to completion.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &str, period: Duration, tick: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let token = self.token.clone();
        let registry = Arc::clone(&self.registry);
        let clock = Arc::clone(&self.clock);
        let loop_name = name.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let failure = match AssertUnwindSafe(tick()).catch_unwind().await {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => {
                        let reason = format!("{err:#}");
                        error!(task = %loop_name, error = %reason, "periodic task failed");
                        Some(reason)
                    }
                    Err(panic) => {
                        let reason = panic_message(panic.as_ref());
                        error!(task = %loop_name, panic = %reason, "periodic task panicked");
                        Some(format!("panicked: {reason}"))
                    }
                };
                registry.record(&loop_name, clock.now(), failure);
            }
            debug!(task = %loop_name, "periodic task stopped");
        });
        debug!(task = name, ?period, "periodic task started");
        self.tasks.push((name.to_string(), handle));
    }

    /// Cancels every loop and waits up to `grace` for in-flight ticks.
    /// A tick still running after the grace period is left to finish on
    /// its own; only its timer is gone.
    pub async fn shutdown(self, grace: Duration) {
        self.token.cancel();
        let deadline = tokio::time::Instant::now() + grace;
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_cancelled() => {}
                Ok(Err(err)) => error!(task = %name, error = %err, "periodic task ended abnormally"),
                Err(_) => {
                    warn!(task = %name, ?grace, "periodic task still running after shutdown grace; detaching");
                }
            }
        }
    }

    /// Cancels every loop without waiting. In-flight ticks are detached,
    /// not aborted, so a send or acquire in progress completes or times out.
    pub fn cancel(self) {
        self.token.cancel();
        for (name, handle) in self.tasks {
            if !handle.is_finished() {
                debug!(task = %name, "detaching in-flight periodic task");
            }
            drop(handle);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
