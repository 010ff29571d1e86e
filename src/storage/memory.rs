//! In-memory sample store.
//!
//! Backs the test suite and the synthetic demo runner. Each series is a
//! fixed-cadence vector of packed values; queries snapshot the requested
//! range so cursors stay valid while writers append.

use std::collections::HashMap;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::MlError;

use super::{DimensionKey, MetricSink, SampleIter, SampleStore, StorageNumber};

struct Series {
    start: i64,
    every: u32,
    values: Vec<StorageNumber>,
}

impl Series {
    fn latest(&self) -> Option<i64> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.start + (self.values.len() as i64 - 1) * self.every as i64)
        }
    }
}

/// One published host-status tick, kept for inspection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostStatus {
    pub total: u64,
    pub anomalous: u64,
    pub rate_pct: f64,
}

#[derive(Default)]
pub struct MemoryStore {
    series: RwLock<HashMap<(Uuid, DimensionKey), Series>>,
    status: RwLock<HashMap<Uuid, Vec<HostStatus>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a series with its first-sample time and cadence.
    pub fn add_series(&self, host: Uuid, key: DimensionKey, start: i64, every: u32) {
        self.series.write().insert(
            (host, key),
            Series {
                start,
                every,
                values: Vec::new(),
            },
        );
    }

    /// Append the next tick's packed value. Unknown series are ignored.
    pub fn push(&self, host: &Uuid, key: &DimensionKey, sn: StorageNumber) {
        if let Some(series) = self.series.write().get_mut(&(*host, key.clone())) {
            series.values.push(sn);
        }
    }

    /// Append the next tick's real value as a plain existing sample.
    pub fn push_value(&self, host: &Uuid, key: &DimensionKey, value: f64) {
        self.push(host, key, StorageNumber::encode(value, false, false));
    }

    /// Host-status points recorded through the sink side.
    pub fn host_status_points(&self, host: &Uuid) -> Vec<HostStatus> {
        self.status.read().get(host).cloned().unwrap_or_default()
    }
}

struct MemoryIter {
    samples: Vec<(i64, StorageNumber)>,
    pos: usize,
}

impl SampleIter for MemoryIter {
    fn next_sample(&mut self) -> Result<Option<(i64, StorageNumber)>, MlError> {
        let out = self.samples.get(self.pos).copied();
        self.pos += 1;
        Ok(out)
    }

    fn finalize(&mut self) {
        self.pos = self.samples.len();
    }
}

impl SampleStore for MemoryStore {
    fn oldest_time(&self, host: &Uuid, key: &DimensionKey) -> Option<i64> {
        let series = self.series.read();
        let s = series.get(&(*host, key.clone()))?;
        if s.values.is_empty() {
            None
        } else {
            Some(s.start)
        }
    }

    fn latest_time(&self, host: &Uuid, key: &DimensionKey) -> Option<i64> {
        self.series.read().get(&(*host, key.clone()))?.latest()
    }

    fn query(
        &self,
        host: &Uuid,
        key: &DimensionKey,
        after: i64,
        before: i64,
    ) -> Box<dyn SampleIter> {
        let series = self.series.read();
        let samples = match series.get(&(*host, key.clone())) {
            Some(s) => s
                .values
                .iter()
                .enumerate()
                .map(|(i, sn)| (s.start + i as i64 * s.every as i64, *sn))
                .filter(|(ts, _)| *ts >= after && *ts <= before)
                .collect(),
            None => Vec::new(),
        };

        Box::new(MemoryIter { samples, pos: 0 })
    }
}

impl MetricSink for MemoryStore {
    fn host_status(&self, host: &Uuid, total: u64, anomalous: u64, rate_pct: f64) {
        self.status.write().entry(*host).or_default().push(HostStatus {
            total,
            anomalous,
            rate_pct,
        });
    }

    fn dimension_score(&self, _host: &Uuid, _key: &DimensionKey, _score_pct: f64, _bit: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CursorStep, QueryCursor};

    #[test]
    fn series_times_and_query() {
        let store = MemoryStore::new();
        let host = Uuid::new_v4();
        let key = DimensionKey::new("system.cpu", "user");

        store.add_series(host, key.clone(), 100, 2);
        assert_eq!(store.oldest_time(&host, &key), None);

        for v in 0..5 {
            store.push_value(&host, &key, v as f64);
        }

        assert_eq!(store.oldest_time(&host, &key), Some(100));
        assert_eq!(store.latest_time(&host, &key), Some(108));

        let mut cursor = QueryCursor::new(&store, &host, &key, 102, 106);
        let mut got = Vec::new();
        while let CursorStep::Sample(ts, sn) = cursor.step() {
            got.push((ts, sn.value()));
        }
        assert_eq!(got, vec![(102, 1.0), (104, 2.0), (106, 3.0)]);
    }

    #[test]
    fn unknown_series_is_empty() {
        let store = MemoryStore::new();
        let host = Uuid::new_v4();
        let key = DimensionKey::new("c", "d");

        assert_eq!(store.latest_time(&host, &key), None);
        let mut iter = store.query(&host, &key, 0, 100);
        assert!(matches!(iter.next_sample(), Ok(None)));
    }
}
