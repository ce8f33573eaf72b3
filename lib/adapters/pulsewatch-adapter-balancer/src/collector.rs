use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use pulsewatch_domain::{Clock, MetricKind, Sample};
use pulsewatch_ports::SampleCollector;

use crate::LoadBalancer;

/// Per-instance load samples plus one response-time sample per request
/// completed since the previous collection, all tagged with the instance id.
pub struct BalancerCollector {
    balancer: Arc<LoadBalancer>,
    clock: Arc<dyn Clock>,
}

impl BalancerCollector {
    pub fn new(balancer: Arc<LoadBalancer>, clock: Arc<dyn Clock>) -> Self {
        Self { balancer, clock }
    }
}

#[async_trait]
impl SampleCollector for BalancerCollector {
    fn name(&self) -> &str {
        "balancer"
    }

    async fn collect(&self) -> Result<Vec<Sample>> {
        let now = self.clock.now();
        let mut samples = Vec::new();
        for instance in self.balancer.instances() {
            samples.push(
                Sample::new(MetricKind::InstanceLoad, f64::from(instance.load), "%", now)
                    .with_tag("instance", &instance.id),
            );
        }
        for (id, millis) in self.balancer.drain_completed_responses() {
            samples.extend(millis.into_iter().map(|value| {
                Sample::new(MetricKind::ResponseTime, value, "ms", now).with_tag("instance", &id)
            }));
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pulsewatch_domain::{BalancerConfig, InstanceConfig, ManualClock, ServerInstance};
    use pulsewatch_ports::InstanceProber;

    use super::*;

    struct Up;

    #[async_trait]
    impl InstanceProber for Up {
        async fn probe(&self, _instance: &ServerInstance) -> Result<()> {
            Ok(())
        }
    }

    fn count(samples: &[Sample], kind: MetricKind) -> usize {
        samples.iter().filter(|sample| sample.kind == kind).count()
    }

    #[tokio::test]
    async fn idle_instances_emit_no_response_times() {
        let config = BalancerConfig {
            instances: ["api-1", "api-2"]
                .into_iter()
                .map(|id| InstanceConfig {
                    id: id.to_string(),
                    address: format!("http://{id}:8080"),
                })
                .collect(),
            ..BalancerConfig::default()
        };
        let clock = Arc::new(ManualClock::default());
        let balancer =
            Arc::new(LoadBalancer::new(&config, Arc::new(Up), clock.clone()).unwrap());
        let collector = BalancerCollector::new(balancer.clone(), clock);

        for millis in [900, 1100] {
            balancer.begin_request("api-1").unwrap();
            balancer
                .complete_request("api-1", Duration::from_millis(millis))
                .unwrap();
        }

        let first = collector.collect().await.unwrap();
        assert_eq!(count(&first, MetricKind::InstanceLoad), 2);
        let slow: Vec<f64> = first
            .iter()
            .filter(|sample| sample.kind == MetricKind::ResponseTime)
            .map(|sample| sample.value)
            .collect();
        assert_eq!(slow, vec![900.0, 1100.0]);
        assert!(first
            .iter()
            .filter(|sample| sample.kind == MetricKind::ResponseTime)
            .all(|sample| sample.tags.get("instance").map(String::as_str) == Some("api-1")));

        for _ in 0..3 {
            let idle = collector.collect().await.unwrap();
            assert_eq!(count(&idle, MetricKind::ResponseTime), 0);
            assert_eq!(count(&idle, MetricKind::InstanceLoad), 2);
        }
        assert_eq!(balancer.instances()[0].avg_response_ms, Some(1000.0));
    }
}
