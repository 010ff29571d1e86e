use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use anomon::config::Config;
use anomon::events::AnomalyStore;
use anomon::ml::{DETECTOR_NAME, DETECTOR_VERSION};
use anomon::service::Detector;
use anomon::storage::{DimensionKey, MemoryStore};

#[derive(Parser)]
#[command(name = "anomon", version, about = "Per-host metric anomaly detection")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Configuration file (toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Drive a synthetic host through the full train/detect/persist
    /// pipeline and report the events it produced
    Run {
        /// How long to run, seconds
        #[arg(long, default_value_t = 240)]
        secs: u64,
    },

    /// List anomaly event intervals for a host
    Events {
        host: Uuid,
        #[arg(long, default_value_t = 0)]
        after: i64,
        #[arg(long, default_value_t = i64::MAX)]
        before: i64,
    },

    /// Aggregated per-dimension info for events in a range
    Info {
        host: Uuid,
        #[arg(long, default_value_t = 0)]
        after: i64,
        #[arg(long, default_value_t = i64::MAX)]
        before: i64,
    },
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let config = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Command::Run { secs } => run_demo(config, secs).await,
        Command::Events {
            host,
            after,
            before,
        } => {
            let store = AnomalyStore::open(&config.db_path)
                .with_context(|| format!("open {}", config.db_path.display()))?;
            let intervals = store.anomalies_in_range(DETECTOR_NAME, DETECTOR_VERSION, &host, after, before)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "anomaly_events": intervals }))?
            );
            Ok(())
        }
        Command::Info {
            host,
            after,
            before,
        } => {
            let store = AnomalyStore::open(&config.db_path)
                .with_context(|| format!("open {}", config.db_path.display()))?;
            let info = store.anomaly_info(DETECTOR_NAME, DETECTOR_VERSION, &host, after, before)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
    }
}

/// Synthetic end-to-end run: one host with two sine-wave dimensions,
/// an injected offset midway through, timings scaled down so the whole
/// pipeline (train, detect, event close, persist) fits in a few minutes.
async fn run_demo(mut config: Config, secs: u64) -> Result<()> {
    config.train_secs = 120;
    config.min_train_secs = 30;
    config.train_every_secs = 60;
    config.ad_window_size = 20;
    config.anomaly_rate_threshold = 0.5;
    config.validate()?;

    let store = Arc::new(MemoryStore::new());
    let events = AnomalyStore::open(&config.db_path)
        .with_context(|| format!("open {}", config.db_path.display()))?;
    let detector = Detector::new(config, store.clone(), store.clone(), events)?;

    let host = Uuid::new_v4();
    let dims = [
        DimensionKey::new("system.cpu", "user"),
        DimensionKey::new("system.net", "in"),
    ];

    let start = chrono::Utc::now().timestamp();
    for key in &dims {
        store.add_series(host, key.clone(), start, 1);
    }

    detector.on_new_host(host, "demo");
    for key in &dims {
        detector.on_new_dimension(&host, key.clone(), 1);
    }

    info!(%host, secs, "demo host running; offset injected for the middle third");

    let offset_from = secs / 3;
    let offset_until = offset_from + 2 * secs.div_ceil(6);

    for tick in 0..secs {
        for (i, key) in dims.iter().enumerate() {
            let phase = (tick as f64 + i as f64) * std::f64::consts::PI / 15.0;
            let mut value = phase.sin() * 100.0;
            if (offset_from..offset_until).contains(&tick) {
                value += 500.0;
            }
            store.push_value(&host, key, value);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let report = detector.anomaly_events_json(&host, 0, i64::MAX)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    detector.shutdown().await;
    Ok(())
}
