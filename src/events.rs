//! Durable anomaly-event store.
//!
//! Append-only records keyed by detector name/version, host uuid and the
//! event's time range, with a JSON payload ranking the dimensions that
//! drove the event. Backed by sqlite: single-record inserts are atomic
//! and range queries are served from an index on
//! `(name, version, host, after_ts)`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::{MlError, Result};

/// One ranked dimension inside an event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionRate {
    pub dimension: String,
    pub anomaly_rate: f64,
    /// Bit window snapshot at event close, oldest first.
    pub anomaly_status: Vec<u8>,
}

/// A persisted anomaly event.
#[derive(Debug, Clone)]
pub struct AnomalyEvent {
    pub name: String,
    pub version: i64,
    pub host: Uuid,
    pub after: i64,
    pub before: i64,
    pub dimensions: Vec<DimensionRate>,
}

/// Thread-safe handle to the event database.
#[derive(Clone)]
pub struct AnomalyStore {
    conn: Arc<Mutex<Connection>>,
}

impl AnomalyStore {
    /// Open or create the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MlError::Storage(format!("create {}: {e}", parent.display())))?;
            }
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS anom_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                host BLOB NOT NULL,
                after_ts INTEGER NOT NULL,
                before_ts INTEGER NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_anom_events_range
                ON anom_events(name, version, host, after_ts);
            "#,
        )?;
        Ok(())
    }

    /// Durably append one event.
    pub fn insert_event(&self, event: &AnomalyEvent) -> Result<()> {
        let payload = serde_json::to_string(&event.dimensions)
            .map_err(|e| MlError::Storage(format!("encode payload: {e}")))?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO anom_events (name, version, host, after_ts, before_ts, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.name,
                event.version,
                event.host.as_bytes().as_slice(),
                event.after,
                event.before,
                payload,
            ],
        )?;
        Ok(())
    }

    /// Event intervals fully contained in `[after, before]`, newest first.
    pub fn anomalies_in_range(
        &self,
        name: &str,
        version: i64,
        host: &Uuid,
        after: i64,
        before: i64,
    ) -> Result<Vec<(i64, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT after_ts, before_ts FROM anom_events
             WHERE name = ?1 AND version = ?2 AND host = ?3
               AND after_ts >= ?4 AND before_ts <= ?5
             ORDER BY before_ts DESC",
        )?;

        let rows = stmt.query_map(
            params![name, version, host.as_bytes().as_slice(), after, before],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut intervals = Vec::new();
        for row in rows {
            intervals.push(row?);
        }
        Ok(intervals)
    }

    /// Aggregate the payloads of all events contained in `[after, before]`
    /// into one per-dimension summary: maximum rate across events, bit
    /// snapshot from the newest, sorted by descending rate.
    pub fn anomaly_info(
        &self,
        name: &str,
        version: i64,
        host: &Uuid,
        after: i64,
        before: i64,
    ) -> Result<serde_json::Value> {
        let payloads: Vec<String> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT payload FROM anom_events
                 WHERE name = ?1 AND version = ?2 AND host = ?3
                   AND after_ts >= ?4 AND before_ts <= ?5
                 ORDER BY before_ts DESC",
            )?;

            let rows = stmt.query_map(
                params![name, version, host.as_bytes().as_slice(), after, before],
                |row| row.get(0),
            )?;

            let mut payloads = Vec::new();
            for row in rows {
                payloads.push(row?);
            }
            payloads
        };

        let mut merged: Vec<DimensionRate> = Vec::new();
        for payload in payloads {
            let entries: Vec<DimensionRate> = serde_json::from_str(&payload)
                .map_err(|e| MlError::Storage(format!("decode payload: {e}")))?;

            for entry in entries {
                match merged.iter_mut().find(|m| m.dimension == entry.dimension) {
                    // Newest event seen first: keep its bit snapshot,
                    // track the maximum rate across events.
                    Some(existing) => {
                        existing.anomaly_rate = existing.anomaly_rate.max(entry.anomaly_rate)
                    }
                    None => merged.push(entry),
                }
            }
        }

        merged.sort_by(|a, b| {
            b.anomaly_rate
                .partial_cmp(&a.anomaly_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let dimensions: Vec<serde_json::Value> = merged
            .into_iter()
            .map(|m| {
                json!({
                    m.dimension: {
                        "anomaly_rate": m.anomaly_rate,
                        "anomaly_status": m.anomaly_status,
                    }
                })
            })
            .collect();

        Ok(json!({ "dimensions": dimensions }))
    }
}
