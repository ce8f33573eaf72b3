use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use pulsewatch_domain::{Clock, MetricKind, Sample};
use pulsewatch_ports::{ConnectionFactory, SampleCollector};

use crate::ConnectionPoolManager;

/// Feeds pool utilisation and acquisition latency into the metric store.
pub struct PoolCollector<F: ConnectionFactory> {
    pool: Arc<ConnectionPoolManager<F>>,
    clock: Arc<dyn Clock>,
}

impl<F: ConnectionFactory> PoolCollector<F> {
    pub fn new(pool: Arc<ConnectionPoolManager<F>>, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }
}

#[async_trait]
impl<F: ConnectionFactory> SampleCollector for PoolCollector<F> {
    fn name(&self) -> &str {
        "pool"
    }

    async fn collect(&self) -> Result<Vec<Sample>> {
        let stats = self.pool.stats();
        let now = self.clock.now();
        Ok(vec![
            Sample::new(
                MetricKind::PoolUtilization,
                stats.utilization * 100.0,
                "%",
                now,
            ),
            Sample::new(
                MetricKind::PoolAcquireLatency,
                stats.mean_acquire_latency.as_secs_f64() * 1000.0,
                "ms",
                now,
            ),
        ])
    }
}
