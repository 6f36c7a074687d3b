//! Rule-based anomaly classification for a single reading.
//!
//! Classification is a pure function of the reading, the station's prior
//! readings and the thresholds. Short or empty history is normal input: the
//! checks that need it are skipped, never failed.

use crate::config::ClassifierConfig;
use crate::db::{AnomalyType, Reading};

use serde::Serialize;

/// One reason a reading looks wrong.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub anomaly_type: AnomalyType,
    pub detail: String,
}

impl Detection {
    fn new(anomaly_type: AnomalyType, detail: String) -> Self {
        Self { anomaly_type, detail }
    }
}

/// Classify `reading` against `history`.
///
/// `history` holds prior readings of the same station, oldest first. Results
/// come back in a fixed order: out_of_range, spike, stale_repeat, missing_gap.
pub fn classify(reading: &Reading, history: &[Reading], cfg: &ClassifierConfig) -> Vec<Detection> {
    let mut found = Vec::new();

    if let Some(d) = check_out_of_range(reading, cfg) {
        found.push(d);
    }

    if history.is_empty() {
        return found;
    }

    found.extend(check_spike(reading, history, cfg));
    found.extend(check_stale_repeat(reading, history, cfg));
    found.extend(check_missing_gap(reading, history, cfg));

    found
}

fn check_out_of_range(reading: &Reading, cfg: &ClassifierConfig) -> Option<Detection> {
    let v = reading.value;
    if v < 0.0 {
        return Some(Detection::new(
            AnomalyType::OutOfRange,
            format!("value {} mm is negative", v),
        ));
    }
    if v > cfg.max_rainfall_mm {
        return Some(Detection::new(
            AnomalyType::OutOfRange,
            format!("value {} mm exceeds ceiling {} mm", v, cfg.max_rainfall_mm),
        ));
    }
    None
}

fn check_spike(reading: &Reading, history: &[Reading], cfg: &ClassifierConfig) -> Option<Detection> {
    if history.len() < cfg.spike_min_window.max(1) {
        return None;
    }

    let (mean, std) = mean_std(history.iter().map(|r| r.value));
    let threshold = (cfg.spike_multiplier * std).max(cfg.spike_min_delta_mm);
    let excess = reading.value - mean;

    if excess > threshold {
        Some(Detection::new(
            AnomalyType::Spike,
            format!(
                "value {} mm is {:.2} mm above window mean {:.2} (std {:.2}, n={})",
                reading.value,
                excess,
                mean,
                std,
                history.len()
            ),
        ))
    } else {
        None
    }
}

fn check_stale_repeat(reading: &Reading, history: &[Reading], cfg: &ClassifierConfig) -> Option<Detection> {
    if cfg.stale_ignore_zero && reading.value == 0.0 {
        return None;
    }

    // Length of the identical run ending at this reading, the reading included.
    let run = 1 + history
        .iter()
        .rev()
        .take_while(|r| r.value == reading.value)
        .count();

    if run > cfg.stale_repeat_run {
        Some(Detection::new(
            AnomalyType::StaleRepeat,
            format!("value {} mm repeated {} times in a row", reading.value, run),
        ))
    } else {
        None
    }
}

fn check_missing_gap(reading: &Reading, history: &[Reading], cfg: &ClassifierConfig) -> Option<Detection> {
    let previous = history.last()?;
    let gap = (reading.timestamp - previous.timestamp).num_seconds();
    let allowed = cfg.sampling_interval_secs + cfg.gap_tolerance_secs;

    if gap > allowed {
        Some(Detection::new(
            AnomalyType::MissingGap,
            format!(
                "{}s since previous reading at {} (expected at most {}s)",
                gap,
                previous.timestamp.format("%Y-%m-%d %H:%M:%S"),
                allowed
            ),
        ))
    } else {
        None
    }
}

/// Population mean and standard deviation.
fn mean_std(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let n = values.clone().count() as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let mean = values.clone().sum::<f64>() / n;
    let var = values.map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}
