//! Configuration module for rainwatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;

/// Thresholds consumed by the anomaly classifier.
///
/// Built once at startup and passed by reference into every classification.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierConfig {
    /// Readings above this many millimeters are physically implausible.
    pub max_rainfall_mm: f64,
    /// A reading is a spike when it exceeds the window mean by this many standard deviations.
    pub spike_multiplier: f64,
    /// Spike detection needs at least this many prior readings.
    pub spike_min_window: usize,
    /// Lower bound on the excess over the mean that counts as a spike.
    pub spike_min_delta_mm: f64,
    /// A run of identical values longer than this is a stuck sensor.
    pub stale_repeat_run: usize,
    /// Skip the stale check for runs of zero rainfall (dry weather).
    pub stale_ignore_zero: bool,
    /// Expected spacing between readings.
    pub sampling_interval_secs: i64,
    /// Slack allowed on top of the sampling interval before a gap is flagged.
    pub gap_tolerance_secs: i64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            max_rainfall_mm: 300.0,
            spike_multiplier: 3.0,
            spike_min_window: 4,
            spike_min_delta_mm: 0.0,
            stale_repeat_run: 5,
            stale_ignore_zero: false,
            sampling_interval_secs: 3600,
            gap_tolerance_secs: 1800,
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "rainwatch.db")
    pub db_path: String,
    /// Number of prior readings handed to the classifier (default: 24)
    pub history_window: usize,
    pub classifier: ClassifierConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "rainwatch.db".to_string(),
            history_window: 24,
            classifier: ClassifierConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `RAINWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `RAINWATCH_DB_PATH`: Database file path (default: "rainwatch.db")
    /// - `RAINWATCH_HISTORY_WINDOW`: prior readings per classification (default: 24)
    /// - `RAINWATCH_MAX_RAINFALL_MM`, `RAINWATCH_SPIKE_MULTIPLIER`,
    ///   `RAINWATCH_SPIKE_MIN_WINDOW`, `RAINWATCH_SPIKE_MIN_DELTA_MM`,
    ///   `RAINWATCH_STALE_REPEAT_RUN`, `RAINWATCH_STALE_IGNORE_ZERO`,
    ///   `RAINWATCH_SAMPLING_INTERVAL_SECS`, `RAINWATCH_GAP_TOLERANCE_SECS`:
    ///   classifier thresholds
    ///
    /// Values that fail to parse are ignored and the default is kept.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let c = &mut cfg.classifier;

        override_from(&lookup, "RAINWATCH_MAX_RAINFALL_MM", &mut c.max_rainfall_mm);
        override_from(&lookup, "RAINWATCH_SPIKE_MULTIPLIER", &mut c.spike_multiplier);
        override_from(&lookup, "RAINWATCH_SPIKE_MIN_WINDOW", &mut c.spike_min_window);
        override_from(&lookup, "RAINWATCH_SPIKE_MIN_DELTA_MM", &mut c.spike_min_delta_mm);
        override_from(&lookup, "RAINWATCH_STALE_REPEAT_RUN", &mut c.stale_repeat_run);
        override_from(&lookup, "RAINWATCH_STALE_IGNORE_ZERO", &mut c.stale_ignore_zero);
        override_from(&lookup, "RAINWATCH_SAMPLING_INTERVAL_SECS", &mut c.sampling_interval_secs);
        override_from(&lookup, "RAINWATCH_GAP_TOLERANCE_SECS", &mut c.gap_tolerance_secs);

        override_from(&lookup, "RAINWATCH_HTTP_PORT", &mut cfg.http_port);
        override_from(&lookup, "RAINWATCH_HISTORY_WINDOW", &mut cfg.history_window);
        if let Some(db_path) = lookup("RAINWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }

        cfg
    }
}

fn override_from<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!("Ignoring unparsable {}={:?}", key, raw),
        }
    }
}
