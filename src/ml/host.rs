//! One monitored host: its dimensions, rate window and task pair.
//!
//! Two long-running tasks per host. The training task walks the
//! dimension set in stable order, trains at most one dimension per pass
//! and paces itself so every dimension is reached within roughly
//! `train_every_secs` regardless of host size. The detection task runs
//! once a second: it folds the previous tick's host rate into the rolling
//! window, sweeps every dimension for a fresh anomaly bit, recomputes the
//! rate, and persists an event when an above-threshold run closes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::events::{AnomalyEvent, AnomalyStore, DimensionRate};
use crate::storage::{DimensionKey, MetricSink, SampleStore};

use super::dimension::{Dimension, TrainOutcome};
use super::window::{RollingBitWindow, WindowState};
use super::{DETECTOR_NAME, DETECTOR_VERSION};

/// Delay before the task pair starts working, giving the storage layer
/// time to accumulate first samples.
const STARTUP_DELAY: Duration = Duration::from_secs(10);

/// Detection cadence.
const DETECT_EVERY: Duration = Duration::from_secs(1);

pub struct Host {
    id: Uuid,
    hostname: String,
    cfg: Arc<Config>,
    samples: Arc<dyn SampleStore>,
    sink: Arc<dyn MetricSink>,
    events: AnomalyStore,
    dimensions: RwLock<BTreeMap<DimensionKey, Arc<Dimension>>>,
    window: Mutex<RollingBitWindow>,
    host_rate_bits: AtomicU64,
}

impl Host {
    pub fn new(
        id: Uuid,
        hostname: impl Into<String>,
        cfg: Arc<Config>,
        samples: Arc<dyn SampleStore>,
        sink: Arc<dyn MetricSink>,
        events: AnomalyStore,
    ) -> Self {
        let window = RollingBitWindow::new(cfg.ad_window_size, cfg.window_threshold());
        Self {
            id,
            hostname: hostname.into(),
            cfg,
            samples,
            sink,
            events,
            dimensions: RwLock::new(BTreeMap::new()),
            window: Mutex::new(window),
            host_rate_bits: AtomicU64::new(0.0f64.to_bits()),
        }
    }

    pub fn id(&self) -> &Uuid {
        &self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Anomalous-dimension fraction computed by the last detection tick.
    pub fn host_rate(&self) -> f64 {
        f64::from_bits(self.host_rate_bits.load(Ordering::Relaxed))
    }

    pub fn dimension_count(&self) -> usize {
        self.dimensions.read().len()
    }

    pub fn dimension(&self, key: &DimensionKey) -> Option<Arc<Dimension>> {
        self.dimensions.read().get(key).cloned()
    }

    /// Register a dimension. Lazily created on first announcement from
    /// the storage layer; re-announcements are ignored.
    pub fn add_dimension(&self, key: DimensionKey, update_every: u32) {
        let mut dims = self.dimensions.write();
        if !dims.contains_key(&key) {
            debug!(host = %self.hostname, dimension = %key, "dimension registered");
            dims.insert(
                key.clone(),
                Arc::new(Dimension::new(key, update_every, self.cfg.ad_window_size)),
            );
        }
    }

    pub fn remove_dimension(&self, key: &DimensionKey) {
        if self.dimensions.write().remove(key).is_some() {
            debug!(host = %self.hostname, dimension = %key, "dimension removed");
        }
    }

    /// One pass of the training walk at `now` (unix seconds). At most one
    /// dimension trains per pass; the walk order is stable, so dimensions
    /// whose interval elapsed are reached round-robin across passes.
    /// Returns how long the caller should sleep to fill the pass's
    /// `train_every / (N + 1)` slice.
    pub fn train_tick(&self, now: i64) -> Duration {
        let started = Instant::now();

        let dims = self.dimensions.read();
        let allotted =
            Duration::from_secs(self.cfg.train_every_secs) / (dims.len() as u32 + 1);

        for dim in dims.values() {
            if dim.train(now, &self.id, self.samples.as_ref(), &self.cfg)
                == TrainOutcome::Trained
            {
                break;
            }
        }
        drop(dims);

        allotted.saturating_sub(started.elapsed())
    }

    /// One detection tick at `now` (unix seconds).
    pub fn detect_tick(&self, now: i64) {
        use WindowState::*;

        // The window sees the rate computed by the previous tick's sweep.
        let rate_bit = self.host_rate() >= self.cfg.anomaly_rate_threshold;
        let (edge, prev_length) = self.window.lock().insert(rate_bit);

        let dims = self.dimensions.read();

        // A confirmed-quiet tick starts a fresh per-dimension context, so
        // the next potential event is measured on its own window.
        if matches!(
            edge,
            (BelowThreshold, BelowThreshold) | (NotFilled, BelowThreshold)
        ) {
            for dim in dims.values() {
                dim.reset();
            }
        }

        let total = dims.len() as u64;
        let mut anomalous = 0u64;
        for dim in dims.values() {
            if dim.detect(now, &self.id, self.samples.as_ref(), &self.cfg) {
                anomalous += 1;
            }
            self.sink
                .dimension_score(&self.id, dim.key(), dim.score() * 100.0, dim.is_anomalous());
        }

        let rate = if total == 0 {
            0.0
        } else {
            anomalous as f64 / total as f64
        };
        self.host_rate_bits.store(rate.to_bits(), Ordering::Relaxed);
        self.sink.host_status(&self.id, total, anomalous, rate * 100.0);

        // A run of anomalous host ticks just ended: persist it.
        if edge == (AboveThreshold, BelowThreshold) {
            self.emit_event(now, prev_length, &dims);
        }
    }

    fn emit_event(
        &self,
        now: i64,
        run_length: usize,
        dims: &BTreeMap<DimensionKey, Arc<Dimension>>,
    ) {
        let mut ranked: Vec<DimensionRate> = dims
            .values()
            .filter_map(|dim| {
                let rate = dim.anomaly_rate(run_length);
                (rate >= self.cfg.ad_unit_rate_threshold).then(|| DimensionRate {
                    dimension: dim.key().to_string(),
                    anomaly_rate: rate,
                    anomaly_status: dim.recent_bits().iter().map(|b| *b as u8).collect(),
                })
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.anomaly_rate
                .partial_cmp(&a.anomaly_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let event = AnomalyEvent {
            name: DETECTOR_NAME.to_string(),
            version: DETECTOR_VERSION,
            host: self.id,
            after: now - run_length as i64,
            before: now,
            dimensions: ranked,
        };

        // Persistence is best effort: a failed insert loses one event,
        // never the detection pipeline.
        match self.events.insert_event(&event) {
            Ok(()) => info!(
                host = %self.hostname,
                after = event.after,
                before = event.before,
                dimensions = event.dimensions.len(),
                "anomaly event persisted"
            ),
            Err(e) => warn!(host = %self.hostname, error = %e, "anomaly event dropped"),
        }
    }

    /// Training loop: one `train_tick` per pass, sleeping out the
    /// remainder of each pass's slice. Terminates when `shutdown` flips.
    pub async fn run_training(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(STARTUP_DELAY) => {}
        }

        info!(host = %self.hostname, "training task started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let sleep_for = self.train_tick(now_unix());
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        info!(host = %self.hostname, "training task stopped");
    }

    /// Detection loop at 1 s cadence. Terminates when `shutdown` flips.
    pub async fn run_detection(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(STARTUP_DELAY) => {}
        }

        info!(host = %self.hostname, "detection task started");
        let mut ticker = tokio::time::interval(DETECT_EVERY);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            self.detect_tick(now_unix());
            debug!(
                host = %self.hostname,
                dimensions = self.dimension_count(),
                rate = self.host_rate(),
                elapsed_us = started.elapsed().as_micros() as u64,
                "detection tick"
            );
        }
        info!(host = %self.hostname, "detection task stopped");
    }
}

pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
