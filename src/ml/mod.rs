//! Anomaly detection engine.
//!
//! Per-dimension k-means models over preprocessed sample windows produce
//! per-tick anomaly bits; each host aggregates its dimensions' bits into
//! a rate, classifies the rate stream through a rolling-bit window, and
//! persists an event whenever an above-threshold run closes.

pub mod bits;
pub mod buffer;
pub mod dimension;
pub mod host;
pub mod kmeans;
pub mod window;

pub use bits::RollingBitCounter;
pub use buffer::{Preprocess, SamplesBuffer};
pub use dimension::{Dimension, PredictOutcome, TrainOutcome};
pub use host::Host;
pub use kmeans::KMeans;
pub use window::{RollingBitWindow, WindowState};

/// Detector identity for persisted events.
pub const DETECTOR_NAME: &str = "kmeans";
pub const DETECTOR_VERSION: i64 = 1;
