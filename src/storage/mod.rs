//! Storage layer boundary.
//!
//! The engine consumes collected samples through the [`SampleStore`] trait
//! and publishes derived metrics back through [`MetricSink`]. Both are
//! implemented by the embedding agent; [`memory::MemoryStore`] provides an
//! in-process implementation for tests and the demo runner.

pub mod memory;
pub mod number;
pub mod query;

use uuid::Uuid;

pub use memory::MemoryStore;
pub use number::StorageNumber;
pub use query::{CursorStep, QueryCursor};

use crate::error::MlError;

/// Identity of one collected series within a host: the chart it belongs
/// to and its dimension id. Charts are a grouping label, not a lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DimensionKey {
    pub chart: String,
    pub dim: String,
}

impl DimensionKey {
    pub fn new(chart: impl Into<String>, dim: impl Into<String>) -> Self {
        Self {
            chart: chart.into(),
            dim: dim.into(),
        }
    }
}

impl std::fmt::Display for DimensionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.chart, self.dim)
    }
}

/// A decoded sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Collection time, unix seconds.
    pub timestamp: i64,
    pub value: f64,
    pub exists: bool,
    pub reset: bool,
    pub anomalous: bool,
}

impl Sample {
    pub fn decode(timestamp: i64, sn: StorageNumber) -> Self {
        Self {
            timestamp,
            value: sn.value(),
            exists: sn.exists(),
            reset: sn.is_reset(),
            anomalous: sn.is_anomalous(),
        }
    }
}

/// Forward iterator over encoded samples, as exposed by the storage
/// layer's query protocol. `next_sample` returns `Ok(None)` when the
/// range is exhausted; `finalize` releases the underlying handle and is
/// idempotent from the cursor's point of view (it is called exactly once).
pub trait SampleIter: Send {
    fn next_sample(&mut self) -> Result<Option<(i64, StorageNumber)>, MlError>;
    fn finalize(&mut self);
}

/// Read side of the storage layer, per dimension.
pub trait SampleStore: Send + Sync + 'static {
    /// Oldest available sample time for the dimension, unix seconds.
    fn oldest_time(&self, host: &Uuid, key: &DimensionKey) -> Option<i64>;

    /// Newest available sample time for the dimension, unix seconds.
    fn latest_time(&self, host: &Uuid, key: &DimensionKey) -> Option<i64>;

    /// Open a forward iterator over `[after, before]`, second precision.
    fn query(
        &self,
        host: &Uuid,
        key: &DimensionKey,
        after: i64,
        before: i64,
    ) -> Box<dyn SampleIter>;
}

/// Write side: derived ML metrics published back to the storage layer.
pub trait MetricSink: Send + Sync + 'static {
    /// Host status chart: total dimensions, anomalous dimensions, rate
    /// as a percentage.
    fn host_status(&self, host: &Uuid, total: u64, anomalous: u64, rate_pct: f64);

    /// Per-dimension anomaly score chart: `<dim>-as` (score x 100) and
    /// `<dim>-ab` (bit x 100).
    fn dimension_score(&self, host: &Uuid, key: &DimensionKey, score_pct: f64, bit: bool);
}

/// Sink that just traces what would be published. Used when the embedding
/// agent does not wire a real chart backend.
#[derive(Debug, Default)]
pub struct LogSink;

impl MetricSink for LogSink {
    fn host_status(&self, host: &Uuid, total: u64, anomalous: u64, rate_pct: f64) {
        tracing::debug!(%host, total, anomalous, rate_pct, "host anomaly status");
    }

    fn dimension_score(&self, host: &Uuid, key: &DimensionKey, score_pct: f64, bit: bool) {
        tracing::trace!(%host, %key, score_pct, bit, "dimension anomaly score");
    }
}
