//! End-to-end pipeline: train a dimension on a periodic signal, inject a
//! DC offset, and verify that exactly one anomaly event is persisted with
//! the expected time range.

use std::sync::Arc;

use uuid::Uuid;

use anomon::config::Config;
use anomon::events::AnomalyStore;
use anomon::ml::{Host, DETECTOR_NAME, DETECTOR_VERSION};
use anomon::storage::{DimensionKey, MemoryStore};

const WINDOW: usize = 10;

fn pipeline_config() -> Config {
    Config {
        train_secs: 120,
        min_train_secs: 60,
        train_every_secs: 60,
        diff_n: 0,
        smooth_n: 1,
        lag_n: 0,
        anomaly_score_threshold: 0.99,
        anomaly_rate_threshold: 0.5,
        ad_window_size: WINDOW,
        // The whole window must be anomalous to open an event, so the
        // closed run length equals the offset run length exactly.
        ad_window_rate_threshold: 1.0,
        ad_unit_rate_threshold: 0.05,
        ..Config::default()
    }
}

/// Sine at the Nyquist rate: alternating +0.5 / -0.5, with a DC offset
/// over `[offset_from, offset_until)`.
fn wave(t: i64, offset_from: i64, offset_until: i64) -> f64 {
    let mut value = 0.5 * (std::f64::consts::PI * (t as f64 + 0.5)).sin();
    if (offset_from..offset_until).contains(&t) {
        value += 0.01;
    }
    value
}

struct Pipeline {
    host: Host,
    events: AnomalyStore,
    id: Uuid,
}

fn pipeline(offset_ticks: i64) -> Pipeline {
    let store = Arc::new(MemoryStore::new());
    let events = AnomalyStore::open_memory().unwrap();
    let id = Uuid::new_v4();

    let key = DimensionKey::new("system.load", "load1");
    store.add_series(id, key.clone(), 0, 1);
    for t in 0..380 {
        store.push_value(&id, &key, wave(t, 300, 300 + offset_ticks));
    }

    let host = Host::new(
        id,
        "e2e",
        Arc::new(pipeline_config()),
        store.clone(),
        store,
        events.clone(),
    );
    host.add_dimension(key, 1);

    Pipeline { host, events, id }
}

#[test]
fn offset_run_persists_exactly_one_event() {
    let p = pipeline(WINDOW as i64);

    // Train on the clean signal, then detect across the offset window.
    p.host.train_tick(300);
    for now in 301..=340 {
        p.host.detect_tick(now);
    }

    let intervals = p
        .events
        .anomalies_in_range(DETECTOR_NAME, DETECTOR_VERSION, &p.id, 0, 1000)
        .unwrap();
    assert_eq!(intervals.len(), 1, "one offset run, one event");

    let (after, before) = intervals[0];
    assert_eq!(
        before - after,
        WINDOW as i64,
        "closed run length equals the offset run length"
    );

    // The dimension was anomalous for the whole closed run.
    let info = p
        .events
        .anomaly_info(DETECTOR_NAME, DETECTOR_VERSION, &p.id, 0, 1000)
        .unwrap();
    let dims = info["dimensions"].as_array().unwrap();
    assert_eq!(dims.len(), 1);

    let entry = &dims[0]["system.load.load1"];
    assert_eq!(entry["anomaly_rate"].as_f64().unwrap(), 1.0);
    assert_eq!(entry["anomaly_status"].as_array().unwrap().len(), WINDOW);
}

#[test]
fn short_offset_does_not_open_an_event() {
    // Offset shorter than the window: the popcount never reaches the
    // all-set threshold, so no run opens and nothing is persisted.
    let p = pipeline(WINDOW as i64 / 2);

    p.host.train_tick(300);
    for now in 301..=340 {
        p.host.detect_tick(now);
    }

    assert!(p
        .events
        .anomalies_in_range(DETECTOR_NAME, DETECTOR_VERSION, &p.id, 0, 1000)
        .unwrap()
        .is_empty());
}

#[test]
fn clean_signal_stays_quiet() {
    let p = pipeline(0);

    p.host.train_tick(300);
    for now in 301..=340 {
        p.host.detect_tick(now);
    }

    assert_eq!(p.host.host_rate(), 0.0);
    assert!(p
        .events
        .anomalies_in_range(DETECTOR_NAME, DETECTOR_VERSION, &p.id, 0, 1000)
        .unwrap()
        .is_empty());
}
