//! Service boundary of the detection engine.
//!
//! The storage layer drives the engine through lifecycle hooks as hosts
//! and dimensions come and go; queries read the cached anomaly state and
//! the persisted event store. Each registered host owns a training and a
//! detection task, both terminated cooperatively on host deletion.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, SkipPattern};
use crate::error::{MlError, Result};
use crate::events::AnomalyStore;
use crate::ml::{Host, DETECTOR_NAME, DETECTOR_VERSION};
use crate::storage::{DimensionKey, MetricSink, SampleStore};

struct HostEntry {
    host: Arc<Host>,
    shutdown: watch::Sender<bool>,
    training: JoinHandle<()>,
    detection: JoinHandle<()>,
}

/// The per-process detector: owns every monitored host and the shared
/// event store handle.
pub struct Detector {
    cfg: Arc<Config>,
    samples: Arc<dyn SampleStore>,
    sink: Arc<dyn MetricSink>,
    events: AnomalyStore,
    hosts_to_skip: SkipPattern,
    charts_to_skip: SkipPattern,
    hosts: RwLock<HashMap<Uuid, HostEntry>>,
}

impl Detector {
    /// Construct from validated configuration and the storage handles.
    pub fn new(
        cfg: Config,
        samples: Arc<dyn SampleStore>,
        sink: Arc<dyn MetricSink>,
        events: AnomalyStore,
    ) -> Result<Self> {
        cfg.validate()?;

        let hosts_to_skip = SkipPattern::compile(&cfg.hosts_to_skip)
            .map_err(|e| MlError::Config(e.to_string()))?;
        let charts_to_skip = SkipPattern::compile(&cfg.charts_to_skip)
            .map_err(|e| MlError::Config(e.to_string()))?;

        Ok(Self {
            cfg: Arc::new(cfg),
            samples,
            sink,
            events,
            hosts_to_skip,
            charts_to_skip,
            hosts: RwLock::new(HashMap::new()),
        })
    }

    /// A host appeared in the storage layer: register it and start its
    /// task pair, unless the skip pattern excludes it.
    pub fn on_new_host(&self, id: Uuid, hostname: &str) {
        if self.hosts_to_skip.matches(hostname) {
            debug!(%hostname, "host excluded from training");
            return;
        }

        let mut hosts = self.hosts.write();
        if hosts.contains_key(&id) {
            return;
        }

        let host = Arc::new(Host::new(
            id,
            hostname,
            self.cfg.clone(),
            self.samples.clone(),
            self.sink.clone(),
            self.events.clone(),
        ));

        let (shutdown, rx) = watch::channel(false);
        let training = tokio::spawn(host.clone().run_training(rx.clone()));
        let detection = tokio::spawn(host.clone().run_detection(rx));

        info!(%hostname, host = %id, "host registered");
        hosts.insert(
            id,
            HostEntry {
                host,
                shutdown,
                training,
                detection,
            },
        );
    }

    /// A host disappeared: signal its tasks, wait for them, drop it.
    pub async fn on_delete_host(&self, id: &Uuid) {
        let entry = self.hosts.write().remove(id);
        let Some(entry) = entry else { return };

        let _ = entry.shutdown.send(true);
        if let Err(e) = entry.training.await {
            warn!(host = %id, error = %e, "training task join failed");
        }
        if let Err(e) = entry.detection.await {
            warn!(host = %id, error = %e, "detection task join failed");
        }
        info!(host = %id, hostname = entry.host.hostname(), "host dropped");
    }

    /// A dimension appeared under a registered host.
    pub fn on_new_dimension(&self, host: &Uuid, key: DimensionKey, update_every: u32) {
        if self.charts_to_skip.matches(&key.chart) {
            debug!(chart = %key.chart, "chart excluded from training");
            return;
        }

        if let Some(entry) = self.hosts.read().get(host) {
            entry.host.add_dimension(key, update_every);
        }
    }

    /// A dimension disappeared.
    pub fn on_delete_dimension(&self, host: &Uuid, key: &DimensionKey) {
        if let Some(entry) = self.hosts.read().get(host) {
            entry.host.remove_dimension(key);
        }
    }

    /// Current cached anomaly bit of one dimension. No computation.
    pub fn is_anomalous(&self, host: &Uuid, key: &DimensionKey) -> bool {
        self.hosts
            .read()
            .get(host)
            .and_then(|entry| entry.host.dimension(key))
            .map(|dim| dim.is_anomalous())
            .unwrap_or(false)
    }

    pub fn host(&self, id: &Uuid) -> Option<Arc<Host>> {
        self.hosts.read().get(id).map(|entry| entry.host.clone())
    }

    /// Event intervals for a host in `[after, before]`, newest first, as
    /// `[[after, before], ...]`.
    pub fn anomaly_events_json(
        &self,
        host: &Uuid,
        after: i64,
        before: i64,
    ) -> Result<serde_json::Value> {
        let intervals =
            self.events
                .anomalies_in_range(DETECTOR_NAME, DETECTOR_VERSION, host, after, before)?;
        Ok(serde_json::json!({ "anomaly_events": intervals }))
    }

    /// Aggregated per-dimension payload for events in `[after, before]`.
    pub fn anomaly_event_info_json(
        &self,
        host: &Uuid,
        after: i64,
        before: i64,
    ) -> Result<serde_json::Value> {
        self.events
            .anomaly_info(DETECTOR_NAME, DETECTOR_VERSION, host, after, before)
    }

    /// Stop every host's task pair. Used at process shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<Uuid> = self.hosts.read().keys().copied().collect();
        for id in ids {
            self.on_delete_host(&id).await;
        }
    }
}
