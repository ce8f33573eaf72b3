use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use pulsewatch_domain::{
    AutoScalerConfig, BalancerConfig, HealthLevel, InstanceConfig, ManualClock, RoutingError,
    ServerInstance,
};
use pulsewatch_ports::{HealthReporter, InstanceProber};

use crate::{AutoScaler, LoadBalancer, LoggingScaleExecutor, ScalingVerdict};

/// Fails probes for the listed instance ids.
#[derive(Default)]
struct ScriptedProber {
    down: Mutex<HashSet<String>>,
}

impl ScriptedProber {
    fn set_down(&self, id: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
    }
}

#[async_trait]
impl InstanceProber for ScriptedProber {
    async fn probe(&self, instance: &ServerInstance) -> Result<()> {
        if self.down.lock().unwrap().contains(&instance.id) {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }
}

struct HangingProber;

#[async_trait]
impl InstanceProber for HangingProber {
    async fn probe(&self, _instance: &ServerInstance) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

fn balancer_with(strategy: &str, prober: Arc<dyn InstanceProber>) -> LoadBalancer {
    let config = BalancerConfig {
        strategy: strategy.to_string(),
        instances: ["a", "b", "c"]
            .into_iter()
            .map(|id| InstanceConfig {
                id: id.to_string(),
                address: format!("http://{id}.internal:8080"),
            })
            .collect(),
        ..BalancerConfig::default()
    };
    LoadBalancer::new(&config, prober, Arc::new(ManualClock::default())).unwrap()
}

#[test]
fn least_connections_picks_idle_instance() {
    let balancer = balancer_with("least_connections", Arc::new(ScriptedProber::default()));
    for _ in 0..5 {
        balancer.begin_request("a").unwrap();
        balancer.begin_request("c").unwrap();
    }

    for _ in 0..10 {
        assert_eq!(balancer.select(None).unwrap().id, "b");
    }

    balancer.begin_request("b").unwrap();
    balancer
        .complete_request("b", Duration::from_millis(40))
        .unwrap();
    let b = balancer
        .instances()
        .into_iter()
        .find(|instance| instance.id == "b")
        .unwrap();
    assert_eq!(b.open_connections, 0);
    assert_eq!(b.avg_response_ms, Some(40.0));
}

#[tokio::test]
async fn three_failures_flip_unhealthy_and_one_success_recovers() {
    let prober = Arc::new(ScriptedProber::default());
    let balancer = balancer_with("round_robin", prober.clone());
    prober.set_down("a", true);

    balancer.health_check_cycle().await;
    balancer.health_check_cycle().await;
    assert_eq!(balancer.healthy_instances().len(), 3);

    let report = balancer.health_check_cycle().await;
    assert_eq!(report.marked_unhealthy, 1);
    assert_eq!(report.healthy, 2);
    for _ in 0..6 {
        assert_ne!(balancer.select(None).unwrap().id, "a");
    }
    assert_eq!(balancer.component_health().level, HealthLevel::Warning);

    prober.set_down("a", false);
    let report = balancer.health_check_cycle().await;
    assert_eq!(report.recovered, 1);
    assert_eq!(balancer.healthy_instances().len(), 3);
    assert!(
        balancer
            .instances()
            .iter()
            .all(|instance| instance.last_health_check.is_some())
    );
}

#[tokio::test]
async fn all_unhealthy_yields_nothing_for_every_strategy() {
    let prober = Arc::new(ScriptedProber::default());
    let balancer = balancer_with("round_robin", prober.clone());
    for id in ["a", "b", "c"] {
        prober.set_down(id, true);
    }
    for _ in 0..3 {
        balancer.health_check_cycle().await;
    }

    for strategy in [
        "round_robin",
        "least_connections",
        "weighted",
        "ip_hash",
        "least_response_time",
    ] {
        balancer.set_strategy(strategy).unwrap();
        assert!(balancer.select(Some("10.1.1.1")).is_none());
        assert_eq!(
            balancer.route(None).unwrap_err(),
            RoutingError::NoHealthyInstance
        );
    }
    assert_eq!(balancer.average_load(), None);
    assert_eq!(balancer.component_health().level, HealthLevel::Critical);
}

#[tokio::test(start_paused = true)]
async fn hanging_probe_counts_as_failure() {
    let balancer = balancer_with("round_robin", Arc::new(HangingProber));
    for _ in 0..3 {
        balancer.health_check_cycle().await;
    }
    assert!(balancer.healthy_instances().is_empty());
}

#[test]
fn registry_and_strategy_management() {
    let balancer = balancer_with("round_robin", Arc::new(ScriptedProber::default()));
    assert!(balancer.deregister_instance("b"));
    assert!(!balancer.deregister_instance("b"));
    balancer.register_instance("d", "http://d.internal:8080");
    let ids: Vec<_> = balancer.instances().into_iter().map(|i| i.id).collect();
    assert_eq!(ids, vec!["a", "c", "d"]);

    assert_eq!(
        balancer.set_strategy("fastest"),
        Err(RoutingError::UnknownStrategy("fastest".into()))
    );
    assert_eq!(balancer.strategy_name(), "round_robin");
    assert_eq!(
        balancer.begin_request("zz"),
        Err(RoutingError::UnknownInstance("zz".into()))
    );

    balancer.report_load("a", 140.0).unwrap();
    balancer.report_load("c", 40.0).unwrap();
    balancer.report_load("d", -3.0).unwrap();
    assert_eq!(balancer.average_load(), Some(140.0 / 3.0));
}

#[tokio::test]
async fn sustained_overload_scales_once_then_waits_out_cooldown() {
    let clock = Arc::new(ManualClock::default());
    let scaler = AutoScaler::new(
        AutoScalerConfig {
            min_instances: 1,
            max_instances: 10,
            scale_up_threshold: 80.0,
            scale_down_threshold: 20.0,
            cooldown: Duration::from_secs(300),
            ..AutoScalerConfig::default()
        },
        Arc::new(LoggingScaleExecutor),
        clock.clone(),
        3,
    );

    let mut actions = 0;
    for load in [90.0, 92.0, 91.0] {
        if scaler.apply(Some(load)).await.unwrap().target().is_some() {
            actions += 1;
        }
        clock.advance(Duration::from_secs(30));
    }
    assert_eq!(actions, 1);
    assert_eq!(scaler.current_instances(), 4);

    for load in [10.0, 5.0] {
        let verdict = scaler.apply(Some(load)).await.unwrap();
        assert!(matches!(verdict, ScalingVerdict::CoolingDown { .. }));
        clock.advance(Duration::from_secs(30));
    }

    clock.advance(Duration::from_secs(300));
    assert_eq!(
        scaler.apply(Some(5.0)).await.unwrap(),
        ScalingVerdict::ScaleDown { from: 4, to: 3 }
    );

    let history = scaler.history();
    assert_eq!(history.len(), 2);
    assert!(history[0].is_scale_up());
    assert_eq!(history[0].trigger_load, 90.0);
    assert!(history[0].timestamp < history[1].timestamp);
}

#[tokio::test]
async fn autoscaler_reads_balancer_load() {
    let balancer = balancer_with("round_robin", Arc::new(ScriptedProber::default()));
    for id in ["a", "b", "c"] {
        balancer.report_load(id, 95.0).unwrap();
    }
    let scaler = AutoScaler::new(
        AutoScalerConfig::default(),
        Arc::new(LoggingScaleExecutor),
        Arc::new(ManualClock::default()),
        3,
    );
    assert_eq!(
        scaler.tick(&balancer).await.unwrap(),
        ScalingVerdict::ScaleUp { from: 3, to: 4 }
    );
}
