use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    ResponseTime,
    QueryDuration,
    CpuUsage,
    MemoryUsage,
    ErrorRate,
    Throughput,
    PoolUtilization,
    PoolAcquireLatency,
    InstanceLoad,
    Custom(String),
}

impl MetricKind {
    pub fn as_str(&self) -> &str {
        match self {
            MetricKind::ResponseTime => "response_time",
            MetricKind::QueryDuration => "query_duration",
            MetricKind::CpuUsage => "cpu_usage",
            MetricKind::MemoryUsage => "memory_usage",
            MetricKind::ErrorRate => "error_rate",
            MetricKind::Throughput => "throughput",
            MetricKind::PoolUtilization => "pool_utilization",
            MetricKind::PoolAcquireLatency => "pool_acquire_latency",
            MetricKind::InstanceLoad => "instance_load",
            MetricKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "response_time" => MetricKind::ResponseTime,
            "query_duration" => MetricKind::QueryDuration,
            "cpu_usage" => MetricKind::CpuUsage,
            "memory_usage" => MetricKind::MemoryUsage,
            "error_rate" => MetricKind::ErrorRate,
            "throughput" => MetricKind::Throughput,
            "pool_utilization" => MetricKind::PoolUtilization,
            "pool_acquire_latency" => MetricKind::PoolAcquireLatency,
            "instance_load" => MetricKind::InstanceLoad,
            other => MetricKind::Custom(other.to_string()),
        })
    }
}

/// A single recorded measurement. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub kind: MetricKind,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Sample {
    pub fn new(kind: MetricKind, value: f64, unit: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            value,
            unit: unit.into(),
            timestamp,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Subset match on sample tags. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagFilter(pub BTreeMap<String, String>);

impl TagFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(key, value)| tags.get(key).is_some_and(|found| found == value))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub kind: MetricKind,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub count: usize,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
    pub p99: f64,
}

impl AggregateSnapshot {
    pub fn empty(kind: MetricKind, window: Duration) -> Self {
        Self {
            kind,
            window,
            count: 0,
            avg: 0.0,
            min: 0.0,
            max: 0.0,
            p95: 0.0,
            p99: 0.0,
        }
    }

    /// Summarises `values`. Non-finite values are ignored.
    pub fn from_values(kind: MetricKind, window: Duration, values: &[f64]) -> Self {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return Self::empty(kind, window);
        }
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        Self {
            kind,
            window,
            count,
            avg: sum / count as f64,
            min: sorted[0],
            max: sorted[count - 1],
            p95: nearest_rank(&sorted, 95.0),
            p99: nearest_rank(&sorted, 99.0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Nearest-rank percentile over an ascending slice.
pub fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_use_nearest_rank() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        let snapshot =
            AggregateSnapshot::from_values(MetricKind::ResponseTime, Duration::from_secs(60), &values);
        assert_eq!(snapshot.count, 100);
        assert_eq!(snapshot.min, 1.0);
        assert_eq!(snapshot.max, 100.0);
        assert_eq!(snapshot.avg, 50.5);
        assert_eq!(snapshot.p95, 95.0);
        assert_eq!(snapshot.p99, 99.0);
    }

    #[test]
    fn single_value_fills_every_statistic() {
        let snapshot =
            AggregateSnapshot::from_values(MetricKind::CpuUsage, Duration::from_secs(60), &[42.0]);
        assert_eq!(snapshot.p95, 42.0);
        assert_eq!(snapshot.p99, 42.0);
        assert_eq!(snapshot.min, snapshot.max);
    }

    #[test]
    fn empty_and_non_finite_values_produce_empty_snapshot() {
        let snapshot = AggregateSnapshot::from_values(
            MetricKind::CpuUsage,
            Duration::from_secs(60),
            &[f64::NAN, f64::INFINITY],
        );
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.avg, 0.0);
    }

    #[test]
    fn tag_filter_is_subset_match() {
        let sample = Sample::new(MetricKind::ResponseTime, 1.0, "ms", Utc::now())
            .with_tag("endpoint", "/orders")
            .with_tag("method", "GET");
        assert!(TagFilter::any().matches(&sample.tags));
        assert!(TagFilter::any().with("endpoint", "/orders").matches(&sample.tags));
        assert!(!TagFilter::any().with("endpoint", "/users").matches(&sample.tags));
        assert!(!TagFilter::any().with("table", "orders").matches(&sample.tags));
    }

    #[test]
    fn metric_kind_parses_custom_names() {
        assert_eq!("cpu_usage".parse::<MetricKind>().unwrap(), MetricKind::CpuUsage);
        assert_eq!(
            "queue_depth".parse::<MetricKind>().unwrap(),
            MetricKind::Custom("queue_depth".into())
        );
    }
}
