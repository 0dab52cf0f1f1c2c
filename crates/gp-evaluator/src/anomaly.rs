//! Anomaly scoring against a rolling baseline.
//!
//! Baseline method: mean and standard deviation of all readings in the
//! window except the latest, which is the value under test. The latest
//! reading is anomalous when its absolute deviation exceeds
//! `(3.5 − 3·sensitivity) · σ`. The multiplier is strictly decreasing in
//! sensitivity, so a higher sensitivity never fires on fewer inputs.

use gp_store::telemetry::Reading;

/// Baselines need at least this many historical readings.
const MIN_BASELINE: usize = 8;

/// σ floor so a flat baseline still admits a threshold.
const SIGMA_FLOOR: f64 = 1e-9;

fn deviation_multiplier(sensitivity: f64) -> f64 {
    3.5 - 3.0 * sensitivity.clamp(0.0, 1.0)
}

/// Is the latest reading anomalous against the rest of the window?
pub fn fires(readings: &[Reading], sensitivity: f64) -> bool {
    if readings.len() < MIN_BASELINE + 1 {
        return false;
    }
    let mut sorted: Vec<&Reading> = readings.iter().collect();
    sorted.sort_by_key(|r| r.time);
    let (latest, baseline) = sorted.split_last().expect("len checked");

    let Some(x) = latest.value.as_f64() else {
        return false;
    };
    let values: Vec<f64> = baseline.iter().filter_map(|r| r.value.as_f64()).collect();
    if values.len() < MIN_BASELINE {
        return false;
    }

    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    let sigma = variance.sqrt().max(SIGMA_FLOOR);

    (x - mean).abs() > deviation_multiplier(sensitivity) * sigma
}
