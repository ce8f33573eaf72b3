//! Metric ingestion, storage and windowed aggregation.

pub mod collector;
pub mod storage;
pub mod store;

pub use collector::SystemCollector;
pub use storage::memory::InMemoryStorage;
pub use storage::sqlite::SqliteStorage;
pub use store::{MetricStore, MetricStoreStats};

#[cfg(test)]
mod store_test;
