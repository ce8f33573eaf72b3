use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use anyhow::Result;
use chrono::{DateTime, Utc};

use pulsewatch_domain::{MetricKind, Sample, TagFilter};
use pulsewatch_ports::SampleBackend;

/// Per-kind deques kept in timestamp order.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    series: RwLock<HashMap<MetricKind, VecDeque<Sample>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.series
            .read()
            .expect("sample series lock poisoned")
            .values()
            .map(VecDeque::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SampleBackend for InMemoryStorage {
    fn append(&self, samples: &[Sample]) -> Result<()> {
        let mut series = self.series.write().expect("sample series lock poisoned");
        for sample in samples {
            let deque = series.entry(sample.kind.clone()).or_default();
            let at = deque.partition_point(|existing| existing.timestamp <= sample.timestamp);
            deque.insert(at, sample.clone());
        }
        Ok(())
    }

    fn query(
        &self,
        kind: &MetricKind,
        since: DateTime<Utc>,
        filter: &TagFilter,
    ) -> Result<Vec<Sample>> {
        let series = self.series.read().expect("sample series lock poisoned");
        let Some(deque) = series.get(kind) else {
            return Ok(Vec::new());
        };
        let start = deque.partition_point(|sample| sample.timestamp < since);
        Ok(deque
            .range(start..)
            .filter(|sample| filter.matches(&sample.tags))
            .cloned()
            .collect())
    }

    fn purge(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut series = self.series.write().expect("sample series lock poisoned");
        let mut removed = 0;
        for deque in series.values_mut() {
            let cut = deque.partition_point(|sample| sample.timestamp < older_than);
            deque.drain(..cut);
            removed += cut;
        }
        series.retain(|_, deque| !deque.is_empty());
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn keeps_series_ordered_and_purges_prefix() {
        let storage = InMemoryStorage::new();
        let now = Utc::now();
        storage
            .append(&[
                Sample::new(MetricKind::CpuUsage, 3.0, "%", now),
                Sample::new(MetricKind::CpuUsage, 1.0, "%", now - Duration::minutes(10)),
                Sample::new(MetricKind::CpuUsage, 2.0, "%", now - Duration::minutes(5)),
            ])
            .unwrap();

        let all = storage
            .query(&MetricKind::CpuUsage, now - Duration::hours(1), &TagFilter::any())
            .unwrap();
        let values: Vec<f64> = all.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);

        let removed = storage.purge(now - Duration::minutes(6)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn unknown_kind_is_empty_not_error() {
        let storage = InMemoryStorage::new();
        let found = storage
            .query(&MetricKind::ErrorRate, Utc::now(), &TagFilter::any())
            .unwrap();
        assert!(found.is_empty());
    }
}
