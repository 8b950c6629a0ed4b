//! Per-operation latency and outcome log in SQLite.

use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS operation_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    operation TEXT NOT NULL,
    latency_ms INTEGER NOT NULL,
    success INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_operation_log_timestamp ON operation_log(timestamp);
CREATE INDEX IF NOT EXISTS idx_operation_log_operation ON operation_log(operation);
"#;

/// Knowledge-base operations worth timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Ingest,
    Search,
    Delete,
    Clear,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Ingest => "ingest",
            Operation::Search => "search",
            Operation::Delete => "delete",
            Operation::Clear => "clear",
        }
    }

    pub const ALL: [Operation; 4] = [
        Operation::Ingest,
        Operation::Search,
        Operation::Delete,
        Operation::Clear,
    ];
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct MetricsStore {
    conn: Mutex<Connection>,
}

impl MetricsStore {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "auto_vacuum", "INCREMENTAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Best effort; metrics never fail the operation being measured.
    pub fn record(&self, operation: Operation, latency_ms: u64, success: bool) {
        let Ok(conn) = self.conn.lock() else {
            return;
        };
        if let Err(e) = conn.execute(
            "INSERT INTO operation_log (timestamp, operation, latency_ms, success)
             VALUES (datetime('now'), ?1, ?2, ?3)",
            params![operation.as_str(), latency_ms as i64, success as i32],
        ) {
            tracing::debug!(error = %e, "failed to record metric");
        }
    }

    /// Summary over the last `retention_days`, optionally for one operation.
    pub fn get_summary(&self, operation: Option<Operation>, retention_days: u32) -> MetricsSummary {
        let Ok(conn) = self.conn.lock() else {
            return MetricsSummary::default();
        };
        let query = format!(
            r#"
            SELECT
                COUNT(*) as total_requests,
                COALESCE(AVG(latency_ms), 0) as avg_latency_ms,
                COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END) * 100.0 / NULLIF(COUNT(*), 0), 0) as error_rate
            FROM operation_log
            WHERE timestamp >= datetime('now', '-{} days')
              AND (?1 IS NULL OR operation = ?1)
            "#,
            retention_days
        );

        conn.query_row(&query, params![operation.map(|o| o.as_str())], |row| {
            Ok(MetricsSummary {
                total_requests: row.get::<_, i64>(0)? as u64,
                avg_latency_ms: row.get::<_, f64>(1)? as u64,
                error_rate: row.get::<_, f64>(2)? as f32,
            })
        })
        .unwrap_or_default()
    }

    pub fn cleanup(&self, retention_days: u32) {
        let Ok(conn) = self.conn.lock() else {
            return;
        };
        let query = format!(
            "DELETE FROM operation_log WHERE timestamp < datetime('now', '-{} days')",
            retention_days
        );
        if let Err(e) = conn.execute(&query, []) {
            tracing::debug!(error = %e, "failed to prune metrics");
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_requests: u64,
    pub avg_latency_ms: u64,
    /// Percentage of failed operations
    pub error_rate: f32,
}
