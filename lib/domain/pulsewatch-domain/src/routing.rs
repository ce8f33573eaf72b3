use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time view of a backend instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInstance {
    pub id: String,
    pub address: String,
    pub healthy: bool,
    /// Percentage in `0..=100`.
    pub load: u8,
    pub open_connections: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    /// Mean of recent response times, if any were reported.
    pub avg_response_ms: Option<f64>,
}

/// Append-only record of one scaling action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub timestamp: DateTime<Utc>,
    pub from_instances: u32,
    pub to_instances: u32,
    pub trigger_load: f64,
}

impl ScalingDecision {
    pub fn is_scale_up(&self) -> bool {
        self.to_instances > self.from_instances
    }
}
