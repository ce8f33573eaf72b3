use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use pulsewatch_domain::{MetricKind, Sample, TagFilter};
use pulsewatch_ports::SampleBackend;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    value REAL NOT NULL,
    unit TEXT NOT NULL,
    ts INTEGER NOT NULL,
    tags TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS samples_kind_ts ON samples (kind, ts);
";

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sample database at {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to create samples schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl SampleBackend for SqliteStorage {
    fn append(&self, samples: &[Sample]) -> Result<()> {
        let mut conn = self.conn.lock().expect("sample database lock poisoned");
        let tx = conn.transaction()?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO samples (kind, value, unit, ts, tags) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for sample in samples {
                let tags = serde_json::to_string(&sample.tags)?;
                insert.execute(params![
                    sample.kind.as_str(),
                    sample.value,
                    sample.unit,
                    sample.timestamp.timestamp_millis(),
                    tags
                ])?;
            }
        }
        tx.commit().context("failed to commit samples")?;
        Ok(())
    }

    fn query(
        &self,
        kind: &MetricKind,
        since: DateTime<Utc>,
        filter: &TagFilter,
    ) -> Result<Vec<Sample>> {
        let conn = self.conn.lock().expect("sample database lock poisoned");
        let mut select = conn.prepare_cached(
            "SELECT value, unit, ts, tags FROM samples WHERE kind = ?1 AND ts >= ?2 ORDER BY ts",
        )?;
        let rows = select.query_map(params![kind.as_str(), since.timestamp_millis()], |row| {
            Ok((
                row.get::<_, f64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut samples = Vec::new();
        for row in rows {
            let (value, unit, ts, tags) = row?;
            let tags: BTreeMap<String, String> =
                serde_json::from_str(&tags).context("corrupt sample tags")?;
            if !filter.matches(&tags) {
                continue;
            }
            let timestamp = DateTime::from_timestamp_millis(ts)
                .with_context(|| format!("sample timestamp out of range: {ts}"))?;
            samples.push(Sample {
                kind: kind.clone(),
                value,
                unit,
                timestamp,
                tags,
            });
        }
        Ok(samples)
    }

    fn purge(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().expect("sample database lock poisoned");
        let removed = conn.execute(
            "DELETE FROM samples WHERE ts < ?1",
            params![older_than.timestamp_millis()],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn persists_samples_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.db");
        let now = Utc::now();

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage
                .append(&[
                    Sample::new(MetricKind::QueryDuration, 12.5, "ms", now)
                        .with_tag("table", "orders"),
                    Sample::new(MetricKind::QueryDuration, 40.0, "ms", now)
                        .with_tag("table", "users"),
                ])
                .unwrap();
        }

        let storage = SqliteStorage::open(&path).unwrap();
        let orders = storage
            .query(
                &MetricKind::QueryDuration,
                now - Duration::minutes(1),
                &TagFilter::any().with("table", "orders"),
            )
            .unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].value, 12.5);
        assert_eq!(orders[0].tags.get("table").map(String::as_str), Some("orders"));
    }

    #[test]
    fn purge_removes_only_expired_rows() {
        let storage = SqliteStorage::in_memory().unwrap();
        let now = Utc::now();
        storage
            .append(&[
                Sample::new(MetricKind::CpuUsage, 1.0, "%", now - Duration::days(31)),
                Sample::new(MetricKind::CpuUsage, 2.0, "%", now),
            ])
            .unwrap();

        assert_eq!(storage.purge(now - Duration::days(30)).unwrap(), 1);
        let left = storage
            .query(&MetricKind::CpuUsage, now - Duration::days(60), &TagFilter::any())
            .unwrap();
        assert_eq!(left.len(), 1);
    }
}
