use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use pulsewatch_domain::clock::to_chrono;
use pulsewatch_domain::{
    AggregateSnapshot, Clock, ComponentHealth, MetricKind, MetricsError, Sample, TagFilter,
};
use pulsewatch_ports::{AggregateSource, HealthReporter, MetricRepository, SampleBackend};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricStoreStats {
    pub recorded: u64,
    pub dropped: u64,
    pub buffered: usize,
}

/// Buffered front of a [`SampleBackend`].
///
/// `record` only ever touches the in-memory buffer, plus one inline flush
/// when the buffer fills. A failed flush drops the batch instead of pushing
/// back on the caller.
pub struct MetricStore {
    backend: Arc<dyn SampleBackend>,
    clock: Arc<dyn Clock>,
    buffer: Mutex<Vec<Sample>>,
    buffer_capacity: usize,
    retention: Duration,
    recorded: AtomicU64,
    dropped: AtomicU64,
    /// Drop events inside `health_window`, oldest first.
    recent_drops: Mutex<VecDeque<(DateTime<Utc>, u64)>>,
    health_window: Duration,
    last_query_error: Mutex<Option<String>>,
}

/// How long a dropped batch keeps the store in `warning`.
pub const DEFAULT_HEALTH_WINDOW: Duration = Duration::from_secs(300);

impl MetricStore {
    pub fn new(
        backend: Arc<dyn SampleBackend>,
        clock: Arc<dyn Clock>,
        buffer_capacity: usize,
        retention: Duration,
    ) -> Self {
        Self {
            backend,
            clock,
            buffer: Mutex::new(Vec::with_capacity(buffer_capacity.max(1))),
            buffer_capacity: buffer_capacity.max(1),
            retention,
            recorded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            recent_drops: Mutex::new(VecDeque::new()),
            health_window: DEFAULT_HEALTH_WINDOW,
            last_query_error: Mutex::new(None),
        }
    }

    pub fn with_health_window(mut self, window: Duration) -> Self {
        self.health_window = window;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn record(&self, sample: Sample) -> Result<(), MetricsError> {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        let full = {
            let mut buffer = self.buffer.lock().expect("metric buffer lock poisoned");
            buffer.push(sample);
            if buffer.len() >= self.buffer_capacity {
                Some(std::mem::take(&mut *buffer))
            } else {
                None
            }
        };
        match full {
            Some(batch) => self.write_batch(batch).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Fire-and-forget ingestion for collaborators; drops are logged only.
    pub fn record_sample(
        &self,
        kind: MetricKind,
        value: f64,
        unit: &str,
        tags: BTreeMap<String, String>,
    ) {
        let sample = Sample {
            kind,
            value,
            unit: unit.to_string(),
            timestamp: self.clock.now(),
            tags,
        };
        if let Err(err) = self.record(sample) {
            debug!(error = %err, "sample ingestion dropped");
        }
    }

    /// Moves buffered samples into the backend.
    pub fn flush(&self) -> Result<usize, MetricsError> {
        let batch = {
            let mut buffer = self.buffer.lock().expect("metric buffer lock poisoned");
            std::mem::take(&mut *buffer)
        };
        if batch.is_empty() {
            return Ok(0);
        }
        self.write_batch(batch)
    }

    fn write_batch(&self, batch: Vec<Sample>) -> Result<usize, MetricsError> {
        let size = batch.len();
        match self.backend.append(&batch) {
            Ok(()) => Ok(size),
            Err(err) => {
                self.dropped.fetch_add(size as u64, Ordering::Relaxed);
                self.note_drop(size as u64);
                warn!(dropped = size, error = %err, "metric storage append failed; dropping batch");
                Err(MetricsError::IngestionDropped {
                    reason: err.to_string(),
                })
            }
        }
    }

    fn note_drop(&self, count: u64) {
        let now = self.clock.now();
        let cutoff = now - to_chrono(self.health_window);
        let mut drops = self.recent_drops.lock().expect("metric drops lock poisoned");
        while drops.front().is_some_and(|(at, _)| *at < cutoff) {
            drops.pop_front();
        }
        drops.push_back((now, count));
    }

    /// Samples dropped within the health window ending now.
    pub fn recently_dropped(&self) -> u64 {
        let cutoff = self.clock.now() - to_chrono(self.health_window);
        self.recent_drops
            .lock()
            .expect("metric drops lock poisoned")
            .iter()
            .filter(|(at, _)| *at >= cutoff)
            .map(|(_, count)| count)
            .sum()
    }

    pub fn aggregate(
        &self,
        kind: &MetricKind,
        window: Duration,
        filter: &TagFilter,
    ) -> Result<AggregateSnapshot, MetricsError> {
        if let Err(err) = self.flush() {
            debug!(error = %err, "flush before aggregate dropped samples");
        }
        let now = self.clock.now();
        let since = now - to_chrono(window);
        let samples = match self.backend.query(kind, since, filter) {
            Ok(samples) => {
                *self.last_query_error.lock().expect("metric error lock poisoned") = None;
                samples
            }
            Err(err) => {
                let reason = err.to_string();
                *self.last_query_error.lock().expect("metric error lock poisoned") =
                    Some(reason.clone());
                return Err(MetricsError::Storage(reason));
            }
        };
        let values: Vec<f64> = samples
            .iter()
            .filter(|sample| sample.timestamp <= now)
            .map(|sample| sample.value)
            .collect();
        Ok(AggregateSnapshot::from_values(kind.clone(), window, &values))
    }

    /// Raw samples in the window, for collaborators that need more than a summary.
    pub fn samples(
        &self,
        kind: &MetricKind,
        window: Duration,
        filter: &TagFilter,
    ) -> Result<Vec<Sample>, MetricsError> {
        if let Err(err) = self.flush() {
            debug!(error = %err, "flush before lookup dropped samples");
        }
        let since = self.clock.now() - to_chrono(window);
        self.backend
            .query(kind, since, filter)
            .map_err(|err| MetricsError::Storage(err.to_string()))
    }

    pub fn purge(&self, older_than: DateTime<Utc>) -> Result<usize, MetricsError> {
        self.backend
            .purge(older_than)
            .map_err(|err| MetricsError::Storage(err.to_string()))
    }

    /// Purges everything beyond the configured retention window.
    pub fn purge_expired(&self) -> Result<usize, MetricsError> {
        let cutoff = self.clock.now() - to_chrono(self.retention);
        self.purge(cutoff)
    }

    pub fn stats(&self) -> MetricStoreStats {
        MetricStoreStats {
            recorded: self.recorded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            buffered: self.buffer.lock().expect("metric buffer lock poisoned").len(),
        }
    }
}

impl AggregateSource for MetricStore {
    fn aggregate(
        &self,
        kind: &MetricKind,
        window: Duration,
        filter: &TagFilter,
    ) -> Result<AggregateSnapshot, MetricsError> {
        MetricStore::aggregate(self, kind, window, filter)
    }
}

impl MetricRepository for MetricStore {
    fn record(&self, sample: Sample) -> Result<(), MetricsError> {
        MetricStore::record(self, sample)
    }

    fn flush(&self) -> Result<usize, MetricsError> {
        MetricStore::flush(self)
    }

    fn purge_expired(&self) -> Result<usize, MetricsError> {
        MetricStore::purge_expired(self)
    }
}

impl HealthReporter for MetricStore {
    fn component_health(&self) -> ComponentHealth {
        if let Some(err) = self
            .last_query_error
            .lock()
            .expect("metric error lock poisoned")
            .clone()
        {
            return ComponentHealth::critical("metrics", format!("storage query failing: {err}"));
        }
        let dropped = self.recently_dropped();
        if dropped > 0 {
            return ComponentHealth::warning(
                "metrics",
                format!(
                    "{dropped} samples dropped in the last {}",
                    humantime::format_duration(self.health_window)
                ),
            );
        }
        ComponentHealth::healthy("metrics")
    }
}
