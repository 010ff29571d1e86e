//! Engine configuration.
//!
//! One immutable tuning block, read once at startup from a toml file and
//! passed by handle into every host. Pattern options use the collector's
//! glob syntax: space-separated tokens, `*`/`?` wildcards, a `!` prefix
//! negates, first matching token wins.

use std::path::{Path, PathBuf};

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::MlError;
use crate::ml::buffer::Preprocess;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound of the training window, seconds.
    pub train_secs: u64,
    /// Lower bound of the training window; training fails below this
    /// coverage.
    pub min_train_secs: u64,
    /// Minimum interval between retrainings of one dimension, seconds.
    pub train_every_secs: u64,

    /// First-difference lag, >= 0.
    pub diff_n: usize,
    /// Moving-average window, >= 1.
    pub smooth_n: usize,
    /// Embedding dimension minus one, >= 0.
    pub lag_n: usize,

    /// Hosts excluded from training/detection.
    pub hosts_to_skip: String,
    /// Charts excluded from training/detection.
    pub charts_to_skip: String,

    /// Dimension score at or above this sets the anomaly bit.
    pub anomaly_score_threshold: f64,
    /// Host rate at or above this feeds a set bit into the host window.
    pub anomaly_rate_threshold: f64,

    /// Host rolling-bit window capacity, ticks.
    pub ad_window_size: usize,
    /// Fraction of the window that must be set for AboveThreshold.
    pub ad_window_rate_threshold: f64,
    /// Minimum per-dimension rate to appear in an event's top list.
    pub ad_unit_rate_threshold: f64,

    /// Anomaly event database location.
    pub db_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            train_secs: 3600,
            min_train_secs: 900,
            train_every_secs: 1800,
            diff_n: 1,
            smooth_n: 3,
            lag_n: 5,
            hosts_to_skip: "!*".to_string(),
            charts_to_skip: "!*".to_string(),
            anomaly_score_threshold: 0.99,
            anomaly_rate_threshold: 0.02,
            ad_window_size: 120,
            ad_window_rate_threshold: 0.75,
            ad_unit_rate_threshold: 0.05,
            db_path: PathBuf::from("anomon.db"),
        }
    }
}

impl Config {
    /// Load configuration from a toml file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.as_ref().display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path or fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Startup validation; violations are fatal.
    pub fn validate(&self) -> Result<(), MlError> {
        if self.smooth_n == 0 {
            return Err(MlError::Config("smooth_n must be >= 1".into()));
        }
        if self.min_train_secs > self.train_secs {
            return Err(MlError::Config(
                "min_train_secs must not exceed train_secs".into(),
            ));
        }
        if self.train_every_secs == 0 {
            return Err(MlError::Config("train_every_secs must be >= 1".into()));
        }
        if self.ad_window_size == 0 {
            return Err(MlError::Config("ad_window_size must be >= 1".into()));
        }
        for (name, v) in [
            ("anomaly_score_threshold", self.anomaly_score_threshold),
            ("anomaly_rate_threshold", self.anomaly_rate_threshold),
            ("ad_window_rate_threshold", self.ad_window_rate_threshold),
            ("ad_unit_rate_threshold", self.ad_unit_rate_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(MlError::Config(format!("{name} must be in [0, 1]")));
            }
        }

        SkipPattern::compile(&self.hosts_to_skip)
            .map_err(|e| MlError::Config(format!("hosts_to_skip: {e}")))?;
        SkipPattern::compile(&self.charts_to_skip)
            .map_err(|e| MlError::Config(format!("charts_to_skip: {e}")))?;

        Ok(())
    }

    pub fn preprocess(&self) -> Preprocess {
        Preprocess {
            diff_n: self.diff_n,
            smooth_n: self.smooth_n,
            lag_n: self.lag_n,
        }
    }

    /// Set-bit threshold for the host window:
    /// `ceil(ad_window_size * ad_window_rate_threshold)`.
    pub fn window_threshold(&self) -> usize {
        (self.ad_window_size as f64 * self.ad_window_rate_threshold).ceil() as usize
    }
}

/// Compiled skip pattern.
#[derive(Debug, Clone)]
pub struct SkipPattern {
    tokens: Vec<(bool, Regex)>,
}

impl SkipPattern {
    /// Compile a space-separated token list. Each token may be prefixed
    /// with `!` for negation; `*` and `?` glob inside tokens.
    pub fn compile(pattern: &str) -> anyhow::Result<Self> {
        let mut tokens = Vec::new();

        for raw in pattern.split_whitespace() {
            let (negated, glob) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, raw),
            };

            let mut re = String::from("^");
            for c in glob.chars() {
                match c {
                    '*' => re.push_str(".*"),
                    '?' => re.push('.'),
                    c => re.push_str(&regex::escape(&c.to_string())),
                }
            }
            re.push('$');

            tokens.push((
                negated,
                Regex::new(&re).with_context(|| format!("bad pattern token {raw:?}"))?,
            ));
        }

        Ok(Self { tokens })
    }

    /// First matching token wins; a negated match means "not skipped".
    pub fn matches(&self, name: &str) -> bool {
        for (negated, re) in &self.tokens {
            if re.is_match(name) {
                return !negated;
            }
        }
        false
    }
}
