//! One monitored series and its model lifecycle.
//!
//! A dimension owns an optional k-means model guarded by a mutex that is
//! only ever `try_lock`ed: contention between the training and detection
//! tasks is a normal outcome, not an error, and keeps detection latency
//! bounded. The lock covers only the in-memory state (the due-date gate,
//! the model install, the model snapshot); storage queries, preprocessing
//! and the fit itself all run with the lock released. The cached anomaly
//! bit and score are atomics so `is_anomalous` never computes anything.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::storage::{CursorStep, DimensionKey, QueryCursor, Sample, SampleStore};

use super::bits::RollingBitCounter;
use super::buffer::SamplesBuffer;
use super::kmeans::KMeans;

/// Result of one training attempt. Everything but `Trained` is benign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainOutcome {
    Trained,
    /// Another operation holds the dimension lock.
    Busy,
    /// Retrained less than `train_every_secs` ago.
    NotDue,
    /// Not enough valid samples in the training window.
    InsufficientData,
}

/// Result of one prediction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictOutcome {
    Scored,
    /// Another operation holds the dimension lock; bit unchanged.
    Busy,
    /// No successful training yet; bit is 0.
    NoModel,
    /// Fewer recent samples than the feature window needs; bit unchanged.
    InsufficientData,
}

struct ModelState {
    model: Option<KMeans>,
    /// Unix seconds of the last successful training.
    last_trained_at: Option<i64>,
}

struct DetectorState {
    counter: RollingBitCounter,
    /// Set bits seen since the last reset.
    tally: usize,
}

pub struct Dimension {
    key: DimensionKey,
    /// Collection cadence, seconds.
    update_every: u32,
    model: Mutex<ModelState>,
    score_bits: AtomicU64,
    anomaly_bit: AtomicBool,
    detector: Mutex<DetectorState>,
}

impl Dimension {
    pub fn new(key: DimensionKey, update_every: u32, detector_window: usize) -> Self {
        Self {
            key,
            update_every: update_every.max(1),
            model: Mutex::new(ModelState {
                model: None,
                last_trained_at: None,
            }),
            score_bits: AtomicU64::new(0.0f64.to_bits()),
            anomaly_bit: AtomicBool::new(false),
            detector: Mutex::new(DetectorState {
                counter: RollingBitCounter::new(detector_window),
                tally: 0,
            }),
        }
    }

    pub fn key(&self) -> &DimensionKey {
        &self.key
    }

    /// Current cached anomaly bit. No computation.
    pub fn is_anomalous(&self) -> bool {
        self.anomaly_bit.load(Ordering::Relaxed)
    }

    /// Latest normalised anomaly score.
    pub fn score(&self) -> f64 {
        f64::from_bits(self.score_bits.load(Ordering::Relaxed))
    }

    /// Attempt one training pass at `now` (unix seconds). Non-blocking;
    /// the sample pull and the fit run without the dimension lock, and a
    /// fresh model is installed atomically only after a successful fit.
    pub fn train(
        &self,
        now: i64,
        host: &Uuid,
        store: &dyn SampleStore,
        cfg: &Config,
    ) -> TrainOutcome {
        // Gate under the lock, then release it before touching storage.
        {
            let Some(state) = self.model.try_lock() else {
                return TrainOutcome::Busy;
            };

            if let Some(last) = state.last_trained_at {
                if now < last + cfg.train_every_secs as i64 {
                    return TrainOutcome::NotDue;
                }
            }
        }

        let max_rows = (cfg.train_secs / self.update_every as u64).max(1) as usize;
        let min_rows = (cfg.min_train_secs / self.update_every as u64).max(1) as usize;

        let Some(values) = self.pull_values(now, host, store, max_rows) else {
            return TrainOutcome::InsufficientData;
        };
        if values.len() < min_rows {
            debug!(
                dimension = %self.key,
                collected = values.len(),
                required = min_rows,
                "not enough samples to train"
            );
            return TrainOutcome::InsufficientData;
        }

        let n = values.len();
        let rows = SamplesBuffer::new(values, n, 1, cfg.preprocess()).preprocess();

        match KMeans::train(&rows) {
            Some(model) => {
                // Every critical section on this mutex is memory-only;
                // the install can take the lock outright.
                let mut state = self.model.lock();
                state.model = Some(model);
                state.last_trained_at = Some(now);
                trace!(dimension = %self.key, rows = rows.len(), "model trained");
                TrainOutcome::Trained
            }
            None => {
                debug!(dimension = %self.key, "training window too short after preprocessing");
                TrainOutcome::InsufficientData
            }
        }
    }

    /// Attempt one prediction at `now`. Returns the (possibly unchanged)
    /// anomaly bit and how it was obtained.
    pub fn predict(
        &self,
        now: i64,
        host: &Uuid,
        store: &dyn SampleStore,
        cfg: &Config,
    ) -> (bool, PredictOutcome) {
        // Snapshot the model under the lock; the storage query and the
        // scoring run without it.
        let model = {
            let Some(state) = self.model.try_lock() else {
                return (self.is_anomalous(), PredictOutcome::Busy);
            };

            match state.model.clone() {
                Some(model) => model,
                None => {
                    self.anomaly_bit.store(false, Ordering::Relaxed);
                    return (false, PredictOutcome::NoModel);
                }
            }
        };

        let needed = cfg.preprocess().rows_for_one() + 1;
        let values = match self.pull_values(now, host, store, needed) {
            Some(v) if v.len() == needed => v,
            _ => return (self.is_anomalous(), PredictOutcome::InsufficientData),
        };

        let rows = SamplesBuffer::new(values, needed, 1, cfg.preprocess()).preprocess();
        let Some(latest) = rows.last() else {
            return (self.is_anomalous(), PredictOutcome::InsufficientData);
        };

        let score = model.score(latest);
        let bit = score >= cfg.anomaly_score_threshold;

        self.score_bits.store(score.to_bits(), Ordering::Relaxed);
        self.anomaly_bit.store(bit, Ordering::Relaxed);

        (bit, PredictOutcome::Scored)
    }

    /// Predict and fold the resulting bit into the per-dimension rolling
    /// counter. Returns whether the bit was set.
    pub fn detect(&self, now: i64, host: &Uuid, store: &dyn SampleStore, cfg: &Config) -> bool {
        let (bit, _) = self.predict(now, host, store, cfg);

        let mut det = self.detector.lock();
        det.counter.insert(bit);
        det.tally += bit as usize;
        bit
    }

    /// Start a fresh rolling context: the tally restarts from whatever is
    /// currently inside the counter window.
    pub fn reset(&self) {
        let mut det = self.detector.lock();
        det.tally = det.counter.set_bits();
    }

    /// Anomaly-bit fraction over a closing window of `window_length`
    /// ticks, clamped to `[0, 1]`. Re-snapshots the tally afterwards.
    pub fn anomaly_rate(&self, window_length: usize) -> f64 {
        let mut det = self.detector.lock();
        let rate = if window_length == 0 {
            0.0
        } else {
            (det.tally as f64 / window_length as f64).clamp(0.0, 1.0)
        };
        det.tally = det.counter.set_bits();
        rate
    }

    /// Copy of the per-dimension bit window, oldest first.
    pub fn recent_bits(&self) -> Vec<bool> {
        self.detector.lock().counter.as_bits()
    }

    /// Pull up to `rows` decoded samples ending at `now`, carrying the
    /// last real value forward across empty slots and trimming any
    /// leading empty run. `None` only on storage failure.
    fn pull_values(
        &self,
        now: i64,
        host: &Uuid,
        store: &dyn SampleStore,
        rows: usize,
    ) -> Option<Vec<f64>> {
        let every = self.update_every as i64;

        let mut before = now - 1;
        before -= before % every;
        let mut after = before - (rows as i64 - 1) * every;
        after -= after % every;

        if let Some(latest) = store.latest_time(host, &self.key) {
            before = before.min(latest);
        }
        if let Some(oldest) = store.oldest_time(host, &self.key) {
            after = after.max(oldest);
        }
        if after > before {
            return Some(Vec::new());
        }

        let mut values: Vec<f64> = Vec::with_capacity(rows);
        let mut last = f64::NAN;
        let mut resets = 0u32;

        let mut cursor = QueryCursor::new(store, host, &self.key, after, before);
        loop {
            if values.len() == rows {
                break;
            }
            match cursor.step() {
                CursorStep::Sample(ts, sn) => {
                    let sample = Sample::decode(ts, sn);
                    if sample.exists {
                        last = sample.value;
                        if sample.reset {
                            resets += 1;
                        }
                    }
                    values.push(last);
                }
                CursorStep::Done => break,
                CursorStep::Failed(e) => {
                    warn!(dimension = %self.key, error = %e, "storage query failed");
                    return None;
                }
            }
        }

        if resets > 0 {
            debug!(dimension = %self.key, resets, "overflown samples in query window");
        }

        // Drop the leading run of slots that preceded the first real value.
        let first_real = values.iter().position(|v| !v.is_nan()).unwrap_or(values.len());
        values.drain(..first_real);

        Some(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StorageNumber};

    fn test_config() -> Config {
        Config {
            train_secs: 60,
            min_train_secs: 20,
            train_every_secs: 30,
            diff_n: 0,
            smooth_n: 1,
            lag_n: 2,
            anomaly_score_threshold: 0.99,
            ..Config::default()
        }
    }

    fn fixture(values: &[f64]) -> (MemoryStore, Uuid, DimensionKey) {
        let store = MemoryStore::new();
        let host = Uuid::new_v4();
        let key = DimensionKey::new("system.cpu", "user");
        store.add_series(host, key.clone(), 0, 1);
        for v in values {
            store.push_value(&host, &key, *v);
        }
        (store, host, key)
    }

    #[test]
    fn predict_without_model_is_no_model() {
        let (store, host, key) = fixture(&[1.0; 100]);
        let dim = Dimension::new(key, 1, 8);

        let (bit, outcome) = dim.predict(100, &host, &store, &test_config());
        assert!(!bit);
        assert_eq!(outcome, PredictOutcome::NoModel);
        assert!(!dim.is_anomalous());
    }

    #[test]
    fn train_then_predict_sets_bit_from_score() {
        let cfg = test_config();
        // Alternating series; the model learns both phases.
        let values: Vec<f64> = (0..100).map(|i| (i % 2) as f64).collect();
        let (store, host, key) = fixture(&values);
        let dim = Dimension::new(key.clone(), 1, 8);

        assert_eq!(dim.train(100, &host, &store, &cfg), TrainOutcome::Trained);

        let (bit, outcome) = dim.predict(100, &host, &store, &cfg);
        assert_eq!(outcome, PredictOutcome::Scored);
        assert_eq!(bit, dim.score() >= cfg.anomaly_score_threshold);
        assert_eq!(bit, dim.is_anomalous());
        assert!(!bit, "in-distribution sample must not be anomalous");

        // Push an out-of-distribution spike and predict again.
        for _ in 0..8 {
            store.push_value(&host, &key, 1e5);
        }
        let (bit, outcome) = dim.predict(108, &host, &store, &cfg);
        assert_eq!(outcome, PredictOutcome::Scored);
        assert!(bit);
        assert!(dim.score() >= cfg.anomaly_score_threshold);
    }

    #[test]
    fn retrain_before_interval_is_not_due() {
        let cfg = test_config();
        let values: Vec<f64> = (0..100).map(|i| (i % 5) as f64).collect();
        let (store, host, key) = fixture(&values);
        let dim = Dimension::new(key, 1, 8);

        assert_eq!(dim.train(100, &host, &store, &cfg), TrainOutcome::Trained);
        assert_eq!(dim.train(110, &host, &store, &cfg), TrainOutcome::NotDue);
        assert_eq!(dim.train(130, &host, &store, &cfg), TrainOutcome::Trained);
    }

    #[test]
    fn short_series_is_insufficient() {
        let cfg = test_config();
        let (store, host, key) = fixture(&[1.0, 2.0, 3.0]);
        let dim = Dimension::new(key, 1, 8);

        assert_eq!(
            dim.train(100, &host, &store, &cfg),
            TrainOutcome::InsufficientData
        );

        // The failed attempt must not mark the dimension as trained.
        let (_, outcome) = dim.predict(100, &host, &store, &cfg);
        assert_eq!(outcome, PredictOutcome::NoModel);
    }

    #[test]
    fn missing_samples_carry_last_value_forward() {
        let store = MemoryStore::new();
        let host = Uuid::new_v4();
        let key = DimensionKey::new("disk.io", "reads");
        store.add_series(host, key.clone(), 0, 1);

        // Leading empty slots, then data with gaps.
        for _ in 0..3 {
            store.push(&host, &key, StorageNumber::EMPTY);
        }
        store.push_value(&host, &key, 5.0);
        store.push(&host, &key, StorageNumber::EMPTY);
        store.push(&host, &key, StorageNumber::EMPTY);
        store.push_value(&host, &key, 7.0);

        let dim = Dimension::new(key, 1, 8);
        let values = dim.pull_values(8, &host, &store, 10).unwrap();

        // Leading run trimmed, gaps filled with the previous real value.
        assert_eq!(values, vec![5.0, 5.0, 5.0, 7.0]);
    }

    #[test]
    fn busy_lock_yields_busy() {
        let (store, host, key) = fixture(&[1.0; 50]);
        let dim = Dimension::new(key, 1, 8);

        let _held = dim.model.lock();
        assert_eq!(
            dim.train(100, &host, &store, &test_config()),
            TrainOutcome::Busy
        );
        let (_, outcome) = dim.predict(100, &host, &store, &test_config());
        assert_eq!(outcome, PredictOutcome::Busy);
    }

    #[test]
    fn detect_feeds_counter_and_rates() {
        let (store, host, key) = fixture(&[]);
        let dim = Dimension::new(key, 1, 4);
        let cfg = test_config();

        // No model: every detect records a zero bit.
        for _ in 0..4 {
            assert!(!dim.detect(10, &host, &store, &cfg));
        }
        assert_eq!(dim.anomaly_rate(4), 0.0);

        // Force bits directly through the counter path.
        {
            let mut det = dim.detector.lock();
            for _ in 0..3 {
                det.counter.insert(true);
                det.tally += 1;
            }
        }
        assert_eq!(dim.anomaly_rate(4), 0.75);

        // Rate re-snapshots to the live window popcount.
        assert_eq!(dim.anomaly_rate(4), 0.75);

        dim.reset();
        // After reset the tally equals the current popcount (3 of 4).
        assert_eq!(dim.anomaly_rate(4), 0.75);
    }

    #[test]
    fn rate_clamps_to_one() {
        let (_, _, key) = fixture(&[]);
        let dim = Dimension::new(key, 1, 4);

        let mut det = dim.detector.lock();
        for _ in 0..6 {
            det.counter.insert(true);
            det.tally += 1;
        }
        drop(det);

        assert_eq!(dim.anomaly_rate(4), 1.0);
    }
}
