pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use anyhow::Result;

use pulsewatch_domain::MetricsBackend;
use pulsewatch_ports::SampleBackend;

pub fn from_config(backend: &MetricsBackend) -> Result<Arc<dyn SampleBackend>> {
    let backend: Arc<dyn SampleBackend> = match backend {
        MetricsBackend::Memory => Arc::new(memory::InMemoryStorage::new()),
        MetricsBackend::Sqlite { path } => Arc::new(sqlite::SqliteStorage::open(path)?),
    };
    Ok(backend)
}
