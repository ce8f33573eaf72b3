pub mod memory;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use pulsewatch_ports::DispatchAudit;

pub use memory::InMemoryAuditLog;
pub use sqlite::SqliteAuditLog;

pub fn from_path(path: Option<&Path>) -> Result<Arc<dyn DispatchAudit>> {
    let audit: Arc<dyn DispatchAudit> = match path {
        Some(path) => Arc::new(SqliteAuditLog::open(path)?),
        None => Arc::new(InMemoryAuditLog::default()),
    };
    Ok(audit)
}
