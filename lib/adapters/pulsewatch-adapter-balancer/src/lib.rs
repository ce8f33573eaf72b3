//! Instance registry, request routing, health probing and auto-scaling.

pub mod autoscaler;
pub mod balancer;
pub mod collector;
pub mod probe;
pub mod strategy;

pub use autoscaler::{AutoScaler, LoggingScaleExecutor, ScalingVerdict};
pub use balancer::{HealthCheckReport, LoadBalancer};
pub use collector::BalancerCollector;
pub use probe::{HttpProber, TcpProber, prober_for};
pub use strategy::RoutingStrategy;

#[cfg(test)]
mod balancer_test;
