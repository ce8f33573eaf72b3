//! Utilisation-driven connection pooling.

pub mod collector;
pub mod manager;
pub mod sqlite;

pub use collector::PoolCollector;
pub use manager::{ConnectionPoolManager, MaintenanceReport, PooledConnection};
pub use sqlite::SqliteConnectionFactory;

#[cfg(test)]
mod manager_test;
