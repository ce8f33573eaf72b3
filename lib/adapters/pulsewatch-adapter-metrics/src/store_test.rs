use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use pulsewatch_domain::{Clock, HealthLevel, ManualClock, MetricKind, MetricsError, Sample, TagFilter};
use pulsewatch_ports::{HealthReporter, SampleBackend};

use crate::{InMemoryStorage, MetricStore};

#[derive(Default)]
struct FlakyStorage {
    inner: InMemoryStorage,
    fail_appends: AtomicBool,
    fail_queries: AtomicBool,
}

impl SampleBackend for FlakyStorage {
    fn append(&self, samples: &[Sample]) -> anyhow::Result<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.inner.append(samples)
    }

    fn query(
        &self,
        kind: &MetricKind,
        since: DateTime<Utc>,
        filter: &TagFilter,
    ) -> anyhow::Result<Vec<Sample>> {
        if self.fail_queries.load(Ordering::SeqCst) {
            anyhow::bail!("database locked");
        }
        self.inner.query(kind, since, filter)
    }

    fn purge(&self, older_than: DateTime<Utc>) -> anyhow::Result<usize> {
        self.inner.purge(older_than)
    }
}

fn store_with(backend: Arc<FlakyStorage>, clock: Arc<ManualClock>, capacity: usize) -> MetricStore {
    MetricStore::new(backend, clock, capacity, Duration::from_secs(30 * 24 * 3600))
}

#[test]
fn aggregate_covers_only_the_window() {
    let clock = Arc::new(ManualClock::default());
    let store = store_with(Arc::new(FlakyStorage::default()), clock.clone(), 16);

    store
        .record(Sample::new(MetricKind::ResponseTime, 10_000.0, "ms", clock.now()))
        .unwrap();
    clock.advance(Duration::from_secs(120));
    for value in [500.0, 600.0, 700.0] {
        store
            .record(Sample::new(MetricKind::ResponseTime, value, "ms", clock.now()))
            .unwrap();
    }

    let snapshot = store
        .aggregate(&MetricKind::ResponseTime, Duration::from_secs(60), &TagFilter::any())
        .unwrap();
    assert_eq!(snapshot.count, 3);
    assert_eq!(snapshot.avg, 600.0);
    assert_eq!(snapshot.max, 700.0);
}

#[test]
fn aggregate_applies_tag_filter() {
    let clock = Arc::new(ManualClock::default());
    let store = store_with(Arc::new(FlakyStorage::default()), clock.clone(), 16);
    let now = clock.now();

    store
        .record(Sample::new(MetricKind::ResponseTime, 100.0, "ms", now).with_tag("endpoint", "/a"))
        .unwrap();
    store
        .record(Sample::new(MetricKind::ResponseTime, 900.0, "ms", now).with_tag("endpoint", "/b"))
        .unwrap();

    let only_b = store
        .aggregate(
            &MetricKind::ResponseTime,
            Duration::from_secs(60),
            &TagFilter::any().with("endpoint", "/b"),
        )
        .unwrap();
    assert_eq!(only_b.count, 1);
    assert_eq!(only_b.avg, 900.0);
}

#[test]
fn failed_flush_drops_batch_and_reports_warning() {
    let clock = Arc::new(ManualClock::default());
    let backend = Arc::new(FlakyStorage::default());
    backend.fail_appends.store(true, Ordering::SeqCst);
    let store = store_with(backend.clone(), clock.clone(), 2);

    store
        .record(Sample::new(MetricKind::CpuUsage, 1.0, "%", clock.now()))
        .unwrap();
    let err = store
        .record(Sample::new(MetricKind::CpuUsage, 2.0, "%", clock.now()))
        .unwrap_err();
    assert!(matches!(err, MetricsError::IngestionDropped { .. }));
    assert_eq!(store.stats().dropped, 2);
    assert_eq!(store.stats().buffered, 0);

    assert_eq!(store.component_health().level, HealthLevel::Warning);

    backend.fail_appends.store(false, Ordering::SeqCst);
    let snapshot = store
        .aggregate(&MetricKind::CpuUsage, Duration::from_secs(60), &TagFilter::any())
        .unwrap();
    assert!(snapshot.is_empty());
}

#[test]
fn reading_health_does_not_clear_recent_drops() {
    let clock = Arc::new(ManualClock::default());
    let backend = Arc::new(FlakyStorage::default());
    backend.fail_appends.store(true, Ordering::SeqCst);
    let store = store_with(backend.clone(), clock.clone(), 1)
        .with_health_window(Duration::from_secs(60));

    assert!(store
        .record(Sample::new(MetricKind::CpuUsage, 1.0, "%", clock.now()))
        .is_err());
    backend.fail_appends.store(false, Ordering::SeqCst);

    let first = store.component_health();
    let second = store.component_health();
    assert_eq!(first.level, HealthLevel::Warning);
    assert_eq!(second, first);
    assert_eq!(store.recently_dropped(), 1);

    clock.advance(Duration::from_secs(61));
    assert_eq!(store.recently_dropped(), 0);
    assert_eq!(store.component_health().level, HealthLevel::Healthy);
    assert_eq!(store.stats().dropped, 1);
}

#[test]
fn query_failure_is_distinguishable_from_empty() {
    let clock = Arc::new(ManualClock::default());
    let backend = Arc::new(FlakyStorage::default());
    let store = store_with(backend.clone(), clock, 16);

    let empty = store
        .aggregate(&MetricKind::ErrorRate, Duration::from_secs(60), &TagFilter::any())
        .unwrap();
    assert_eq!(empty.count, 0);

    backend.fail_queries.store(true, Ordering::SeqCst);
    let err = store
        .aggregate(&MetricKind::ErrorRate, Duration::from_secs(60), &TagFilter::any())
        .unwrap_err();
    assert!(matches!(err, MetricsError::Storage(_)));
    assert_eq!(store.component_health().level, HealthLevel::Critical);
}

#[test]
fn purge_expired_respects_retention() {
    let clock = Arc::new(ManualClock::default());
    let store = store_with(Arc::new(FlakyStorage::default()), clock.clone(), 1);

    store
        .record(Sample::new(MetricKind::Throughput, 5.0, "rps", clock.now()))
        .unwrap();
    clock.advance(Duration::from_secs(31 * 24 * 3600));
    store
        .record(Sample::new(MetricKind::Throughput, 6.0, "rps", clock.now()))
        .unwrap();

    assert_eq!(store.purge_expired().unwrap(), 1);
}
