use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquirePriority {
    Low,
    Normal,
    High,
    Critical,
}

impl AcquirePriority {
    /// High and critical callers may use the reserved slots.
    pub fn may_use_reserve(&self) -> bool {
        matches!(self, AcquirePriority::High | AcquirePriority::Critical)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub in_use: usize,
    pub idle: usize,
    pub capacity: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub utilization: f64,
    pub peak_in_use: usize,
    #[serde(with = "humantime_serde")]
    pub mean_acquire_latency: Duration,
    #[serde(with = "humantime_serde")]
    pub p95_acquire_latency: Duration,
    pub created: u64,
    pub destroyed: u64,
    pub timeouts: u64,
    pub exhausted: u64,
    pub closed: bool,
}
