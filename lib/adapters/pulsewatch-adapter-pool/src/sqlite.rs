use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::Connection;

use pulsewatch_ports::ConnectionFactory;

/// Opens SQLite connections for the pool. Without a path every connection
/// gets its own private in-memory database.
#[derive(Debug, Clone, Default)]
pub struct SqliteConnectionFactory {
    path: Option<PathBuf>,
}

impl SqliteConnectionFactory {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ConnectionFactory for SqliteConnectionFactory {
    type Connection = Connection;

    async fn connect(&self) -> Result<Connection> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || match path {
            Some(path) => Connection::open(&path)
                .with_context(|| format!("failed to open {}", path.display())),
            None => Connection::open_in_memory().context("failed to open in-memory database"),
        })
        .await
        .context("sqlite connect task failed")?
    }

    async fn reset(&self, connection: &mut Connection) -> Result<()> {
        if !connection.is_autocommit() {
            connection
                .execute_batch("ROLLBACK")
                .context("failed to roll back abandoned transaction")?;
        }
        Ok(())
    }

    fn is_valid(&self, connection: &Connection) -> bool {
        connection.execute_batch("SELECT 1").is_ok()
    }
}
