//! Per-host unsupervised anomaly detection for collected metrics.
//!
//! For every monitored host the engine trains a lightweight k-means model
//! per metric dimension, derives a per-tick anomaly bit from each model's
//! normalised score, aggregates the bits into a host anomaly rate, and
//! threshold-crosses a rolling window of that rate to detect contiguous
//! anomaly events. Event summaries (time range, top anomalous dimensions)
//! are persisted to sqlite for later querying by time range.
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use anomon::config::Config;
//! use anomon::events::AnomalyStore;
//! use anomon::service::Detector;
//! use anomon::storage::{DimensionKey, MemoryStore};
//!
//! let store = Arc::new(MemoryStore::new());
//! let events = AnomalyStore::open("ml.db")?;
//! let detector = Detector::new(Config::default(), store.clone(), store.clone(), events)?;
//!
//! let host = uuid::Uuid::new_v4();
//! detector.on_new_host(host, "web1");
//! detector.on_new_dimension(&host, DimensionKey::new("system.cpu", "user"), 1);
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod ml;
pub mod service;
pub mod storage;

pub use config::Config;
pub use error::MlError;
pub use events::AnomalyStore;
pub use service::Detector;
