use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use pulsewatch_domain::metrics::nearest_rank;
use pulsewatch_domain::{AcquirePriority, ComponentHealth, PoolConfig, PoolError, PoolStats};
use pulsewatch_ports::{ConnectionFactory, HealthReporter, PoolControl};

struct IdleConnection<C> {
    connection: C,
    created_at: Instant,
    last_used: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    in_use: usize,
    /// Ceiling on concurrently issued handles; moved only by the resize tick.
    capacity: usize,
    peak_in_use: usize,
    created: u64,
    destroyed: u64,
    timeouts: u64,
    /// Timeout instants inside the health window, oldest first.
    recent_timeouts: VecDeque<Instant>,
    exhausted: u64,
    latencies: VecDeque<Duration>,
    closed: bool,
}

impl<C> PoolState<C> {
    fn open(&self) -> usize {
        self.in_use + self.idle.len()
    }

    fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.in_use as f64 / self.capacity as f64
    }

    fn claim_slot(&mut self) {
        self.in_use += 1;
        self.peak_in_use = self.peak_in_use.max(self.in_use);
    }

    fn free_slot(&mut self) {
        self.in_use = self.in_use.saturating_sub(1);
    }
}

struct Shared<C> {
    state: Mutex<PoolState<C>>,
    available: Notify,
}

impl<C> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().expect("pool state lock poisoned")
    }

    fn discard_slot(&self) {
        {
            let mut state = self.lock();
            state.free_slot();
            state.destroyed += 1;
        }
        self.available.notify_waiters();
    }
}

/// A borrowed connection. Hand it back with
/// [`ConnectionPoolManager::release`]; dropping it instead closes the
/// connection and frees the slot.
pub struct PooledConnection<C> {
    connection: Option<C>,
    created_at: Instant,
    shared: Arc<Shared<C>>,
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.connection
            .as_ref()
            .expect("pooled connection used after release")
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.connection
            .as_mut()
            .expect("pooled connection used after release")
    }
}

impl<C> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if self.connection.take().is_some() {
            debug!("pooled connection dropped without release; discarding");
            self.shared.discard_slot();
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub evicted: usize,
    pub opened: usize,
}

pub struct ConnectionPoolManager<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    shared: Arc<Shared<F::Connection>>,
}

impl<F: ConnectionFactory> ConnectionPoolManager<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let max = config.max_size.max(1);
        let capacity = config.initial_size.clamp(config.min_size.min(max), max);
        let state = PoolState {
            idle: VecDeque::new(),
            in_use: 0,
            capacity,
            peak_in_use: 0,
            created: 0,
            destroyed: 0,
            timeouts: 0,
            recent_timeouts: VecDeque::new(),
            exhausted: 0,
            latencies: VecDeque::with_capacity(config.latency_window),
            closed: false,
        };
        Self {
            factory,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                available: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.shared.lock().capacity
    }

    /// Acquires with the configured timeout.
    pub async fn get(
        &self,
        priority: AcquirePriority,
    ) -> Result<PooledConnection<F::Connection>, PoolError> {
        self.acquire(priority, self.config.acquire_timeout).await
    }

    pub async fn acquire(
        &self,
        priority: AcquirePriority,
        timeout: Duration,
    ) -> Result<PooledConnection<F::Connection>, PoolError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut last_error: Option<String> = None;

        loop {
            let notified = self.shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let claim = {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                let limit = if priority.may_use_reserve() {
                    state.capacity
                } else {
                    state
                        .capacity
                        .saturating_sub(self.config.reserved_for_high_priority)
                };
                if state.in_use < limit {
                    state.claim_slot();
                    Some(state.idle.pop_back())
                } else {
                    None
                }
            };

            let Some(idle) = claim else {
                if !self.config.wait_for_capacity {
                    let mut state = self.shared.lock();
                    state.exhausted += 1;
                    return Err(PoolError::Exhausted {
                        max: state.capacity,
                    });
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Err(self.timed_out(started, last_error));
                }
                continue;
            };

            if let Some(idle) = idle {
                if self.is_reusable(&idle, Instant::now()) {
                    return Ok(self.hand_out(idle.connection, idle.created_at, started));
                }
                drop(idle);
                self.shared.lock().destroyed += 1;
            }

            match self.connect_until(deadline).await {
                Ok(connection) => {
                    self.shared.lock().created += 1;
                    return Ok(self.hand_out(connection, Instant::now(), started));
                }
                Err(err) => {
                    {
                        self.shared.lock().free_slot();
                    }
                    self.shared.available.notify_waiters();

                    if Instant::now() >= deadline {
                        return Err(self.timed_out(started, Some(err)));
                    }
                    if !self.config.retry_on_failure {
                        return Err(PoolError::Connect(err));
                    }
                    let retry_at = Instant::now() + self.config.retry_interval;
                    if retry_at >= deadline {
                        return Err(self.timed_out(started, Some(err)));
                    }
                    warn!(error = %err, retry_in = ?self.config.retry_interval, "pool connect failed; retrying");
                    last_error = Some(err);
                    tokio::time::sleep_until(retry_at).await;
                }
            }
        }
    }

    async fn connect_until(&self, deadline: Instant) -> Result<F::Connection, String> {
        match tokio::time::timeout_at(deadline, self.factory.connect()).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(_) => Err("connect did not finish before the acquire deadline".to_string()),
        }
    }

    fn is_reusable(&self, idle: &IdleConnection<F::Connection>, now: Instant) -> bool {
        now.duration_since(idle.created_at) < self.config.max_lifetime
            && now.duration_since(idle.last_used) < self.config.idle_timeout
            && self.factory.is_valid(&idle.connection)
    }

    fn hand_out(
        &self,
        connection: F::Connection,
        created_at: Instant,
        started: Instant,
    ) -> PooledConnection<F::Connection> {
        {
            let mut state = self.shared.lock();
            state.latencies.push_back(started.elapsed());
            while state.latencies.len() > self.config.latency_window.max(1) {
                state.latencies.pop_front();
            }
        }
        PooledConnection {
            connection: Some(connection),
            created_at,
            shared: Arc::clone(&self.shared),
        }
    }

    fn timed_out(&self, started: Instant, last_error: Option<String>) -> PoolError {
        let mut state = self.shared.lock();
        state.timeouts += 1;
        let now = Instant::now();
        while state
            .recent_timeouts
            .front()
            .is_some_and(|at| now.duration_since(*at) > self.config.health_window)
        {
            state.recent_timeouts.pop_front();
        }
        state.recent_timeouts.push_back(now);
        PoolError::Timeout {
            waited: started.elapsed(),
            last_error,
        }
    }

    /// Resets session state and parks the connection as idle.
    pub async fn release(&self, mut handle: PooledConnection<F::Connection>) {
        let Some(mut connection) = handle.connection.take() else {
            return;
        };
        let created_at = handle.created_at;
        drop(handle);

        let reset = self.factory.reset(&mut connection).await;
        {
            let mut state = self.shared.lock();
            state.free_slot();
            match reset {
                Err(err) => {
                    state.destroyed += 1;
                    warn!(error = %err, "connection reset failed; discarding");
                }
                Ok(()) if state.closed || state.open() >= state.capacity => {
                    state.destroyed += 1;
                }
                Ok(()) => state.idle.push_back(IdleConnection {
                    connection,
                    created_at,
                    last_used: Instant::now(),
                }),
            }
        }
        self.shared.available.notify_waiters();
    }

    /// Hysteresis step: grows by `resize_step` above the high-water mark,
    /// shrinks by it below the low-water mark, clamped to `[min, max]`.
    pub fn recompute_capacity(&self) -> usize {
        let mut state = self.shared.lock();
        let utilization = state.utilization();
        let from = state.capacity;
        let max = self.config.max_size.max(1);
        let min = self.config.min_size.min(max);

        let to = if utilization > self.config.high_water {
            (from + self.config.resize_step).min(max)
        } else if utilization < self.config.low_water {
            from.saturating_sub(self.config.resize_step).max(min)
        } else {
            from
        };
        state.capacity = to;

        while state.open() > state.capacity {
            if state.idle.pop_front().is_none() {
                break;
            }
            state.destroyed += 1;
        }

        if to != from {
            info!(from, to, utilization, "pool capacity adjusted");
        }
        to
    }

    /// Opens connections until `min_size` are open.
    pub async fn warm_up(&self) -> Result<usize, PoolError> {
        let needed = {
            let state = self.shared.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            self.config.min_size.saturating_sub(state.open())
        };

        let mut opened = 0;
        for _ in 0..needed {
            let connection = self
                .factory
                .connect()
                .await
                .map_err(|err| PoolError::Connect(format!("{err:#}")))?;
            let now = Instant::now();
            let mut state = self.shared.lock();
            state.created += 1;
            state.idle.push_back(IdleConnection {
                connection,
                created_at: now,
                last_used: now,
            });
            opened += 1;
        }
        if opened > 0 {
            debug!(opened, "pool warmed up");
            self.shared.available.notify_waiters();
        }
        Ok(opened)
    }

    pub async fn maintain(&self) -> Result<MaintenanceReport, PoolError> {
        let now = Instant::now();
        let evicted = {
            let mut state = self.shared.lock();
            if state.closed {
                return Ok(MaintenanceReport::default());
            }
            let mut open = state.open();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            let mut evicted = 0;
            while let Some(idle) = state.idle.pop_front() {
                let expired = now.duration_since(idle.created_at) >= self.config.max_lifetime
                    || !self.factory.is_valid(&idle.connection);
                let stale = now.duration_since(idle.last_used) >= self.config.idle_timeout;
                if expired || (stale && open > self.config.min_size) {
                    evicted += 1;
                    open -= 1;
                } else {
                    kept.push_back(idle);
                }
            }
            state.idle = kept;
            state.destroyed += evicted as u64;
            evicted
        };

        let opened = self.warm_up().await?;
        if evicted > 0 || opened > 0 {
            debug!(evicted, opened, "pool maintenance finished");
        }
        Ok(MaintenanceReport { evicted, opened })
    }

    /// Closes idle connections and rejects all future acquisitions.
    pub fn close(&self) {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle = state.idle.len();
            state.idle.clear();
            state.destroyed += idle as u64;
        }
        self.shared.available.notify_waiters();
        info!("connection pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        let mut latencies: Vec<f64> = state.latencies.iter().map(Duration::as_secs_f64).collect();
        latencies.sort_by(f64::total_cmp);
        let mean = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        PoolStats {
            in_use: state.in_use,
            idle: state.idle.len(),
            capacity: state.capacity,
            min_size: self.config.min_size,
            max_size: self.config.max_size,
            utilization: state.utilization(),
            peak_in_use: state.peak_in_use,
            mean_acquire_latency: Duration::from_secs_f64(mean),
            p95_acquire_latency: Duration::from_secs_f64(nearest_rank(&latencies, 95.0)),
            created: state.created,
            destroyed: state.destroyed,
            timeouts: state.timeouts,
            exhausted: state.exhausted,
            closed: state.closed,
        }
    }
}

impl<F: ConnectionFactory> HealthReporter for ConnectionPoolManager<F> {
    fn component_health(&self) -> ComponentHealth {
        let state = self.shared.lock();
        if state.closed {
            return ComponentHealth::critical("pool", "pool is closed");
        }
        let now = Instant::now();
        let timeouts = state
            .recent_timeouts
            .iter()
            .filter(|at| now.duration_since(**at) <= self.config.health_window)
            .count();
        let utilization = state.utilization();
        if timeouts > 0 {
            return ComponentHealth::warning(
                "pool",
                format!(
                    "{timeouts} acquisitions timed out in the last {:?}",
                    self.config.health_window
                ),
            );
        }
        if utilization >= self.config.high_water {
            return ComponentHealth::warning(
                "pool",
                format!("utilization {:.0}% at or above high-water mark", utilization * 100.0),
            );
        }
        ComponentHealth::healthy("pool")
    }
}

#[async_trait]
impl<F: ConnectionFactory> PoolControl for ConnectionPoolManager<F> {
    fn resize_tick(&self) -> usize {
        self.recompute_capacity()
    }

    async fn maintain(&self) -> Result<()> {
        ConnectionPoolManager::maintain(self).await?;
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        ConnectionPoolManager::stats(self)
    }
}
