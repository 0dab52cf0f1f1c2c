//! Pure rule-condition evaluation over recent readings.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use gp_protocol::{CmpOp, MatchKind, RuleMode};
use gp_store::telemetry::Reading;

use crate::anomaly;

/// Does a threshold condition hold for a device right now?
///
/// With `duration_seconds = 0` only the latest reading matters. With a
/// window, the condition must have held continuously: at least one
/// reading in the window, zero failing readings, and the earliest
/// in-window reading at least `duration_seconds` old (so a condition
/// that only just started passing cannot fire early).
pub fn threshold_holds(
    op: CmpOp,
    threshold: f64,
    readings: &[Reading],
    duration_seconds: u32,
    now: DateTime<Utc>,
) -> bool {
    let passes = |r: &Reading| match r.value.as_f64() {
        Some(v) => op.compare(v, threshold),
        None => false,
    };

    if duration_seconds == 0 {
        return readings
            .iter()
            .max_by_key(|r| r.time)
            .is_some_and(passes);
    }

    let window_start = now - ChronoDuration::seconds(i64::from(duration_seconds));
    let in_window: Vec<&Reading> = readings.iter().filter(|r| r.time >= window_start).collect();
    if in_window.is_empty() {
        return false;
    }
    if !in_window.iter().all(|r| passes(r)) {
        return false;
    }
    let earliest = in_window.iter().map(|r| r.time).min().expect("non-empty");
    (now - earliest).num_seconds() >= i64::from(duration_seconds)
}

/// Evaluate a rule mode against the readings fetched per metric.
///
/// `rule_duration` applies to the threshold mode; multi-condition rules
/// carry a window per sub-condition.
pub fn rule_fires(
    mode: &RuleMode,
    rule_duration: u32,
    readings_by_metric: &HashMap<String, Vec<Reading>>,
    sensitivity_window: &[Reading],
    now: DateTime<Utc>,
) -> bool {
    match mode {
        RuleMode::Threshold {
            metric,
            op,
            threshold,
        } => {
            let readings = readings_by_metric
                .get(metric)
                .map(Vec::as_slice)
                .unwrap_or_default();
            threshold_holds(*op, *threshold, readings, rule_duration, now)
        }
        RuleMode::Multi {
            conditions,
            match_kind,
        } => {
            let check = |c: &gp_protocol::Condition| {
                let readings = readings_by_metric
                    .get(&c.metric)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                threshold_holds(c.op, c.threshold, readings, c.duration_seconds, now)
            };
            match match_kind {
                MatchKind::All => !conditions.is_empty() && conditions.iter().all(check),
                MatchKind::Any => conditions.iter().any(check),
            }
        }
        RuleMode::Anomaly { sensitivity, .. } => {
            anomaly::fires(sensitivity_window, *sensitivity)
        }
    }
}

/// Human summary for an alert row.
pub fn rule_summary(mode: &RuleMode, device_id: &str) -> String {
    match mode {
        RuleMode::Threshold {
            metric,
            op,
            threshold,
        } => format!("{device_id}: {metric} {op:?} {threshold} breached"),
        RuleMode::Multi { conditions, .. } => format!(
            "{device_id}: {} conditions breached",
            conditions.len()
        ),
        RuleMode::Anomaly { metric, .. } => {
            format!("{device_id}: anomalous {metric} readings")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gp_protocol::{Condition, MetricValue};

    fn reading(age_secs: i64, value: f64, now: DateTime<Utc>) -> Reading {
        Reading {
            time: now - ChronoDuration::seconds(age_secs),
            value: MetricValue::Number(value),
        }
    }

    #[test]
    fn instant_rule_uses_latest_reading() {
        let now = Utc::now();
        let readings = vec![reading(30, 45.0, now), reading(10, 30.0, now)];
        assert!(!threshold_holds(CmpOp::Gt, 40.0, &readings, 0, now));

        let readings = vec![reading(30, 30.0, now), reading(10, 45.0, now)];
        assert!(threshold_holds(CmpOp::Gt, 40.0, &readings, 0, now));
    }

    #[test]
    fn empty_readings_never_fire() {
        let now = Utc::now();
        assert!(!threshold_holds(CmpOp::Gt, 40.0, &[], 0, now));
        assert!(!threshold_holds(CmpOp::Gt, 40.0, &[], 60, now));
    }

    #[test]
    fn duration_window_needs_full_coverage() {
        let now = Utc::now();
        // humidity < 20 for 60s, readings every 5s.
        let op = CmpOp::Lt;

        // 55 seconds of passing readings: earliest is only 55s old.
        let readings: Vec<Reading> = (0..=11).map(|i| reading(55 - i * 5, 18.0, now)).collect();
        assert!(!threshold_holds(op, 20.0, &readings, 60, now));

        // 65 seconds of passing readings: earliest in-window is 60s old.
        let readings: Vec<Reading> = (0..=13).map(|i| reading(65 - i * 5, 18.0, now)).collect();
        assert!(threshold_holds(op, 20.0, &readings, 60, now));
    }

    #[test]
    fn one_failing_reading_breaks_the_window() {
        let now = Utc::now();
        let mut readings: Vec<Reading> = (0..=13).map(|i| reading(65 - i * 5, 18.0, now)).collect();
        assert!(threshold_holds(CmpOp::Lt, 20.0, &readings, 60, now));

        readings.push(reading(2, 25.0, now));
        assert!(!threshold_holds(CmpOp::Lt, 20.0, &readings, 60, now));
    }

    #[test]
    fn out_of_window_failures_are_ignored() {
        let now = Utc::now();
        let mut readings: Vec<Reading> = (0..=13).map(|i| reading(65 - i * 5, 18.0, now)).collect();
        // A failing reading 10 minutes ago is outside the 60s window.
        readings.push(reading(600, 99.0, now));
        assert!(threshold_holds(CmpOp::Lt, 20.0, &readings, 60, now));
    }

    #[test]
    fn non_numeric_readings_fail_comparison() {
        let now = Utc::now();
        let readings = vec![Reading {
            time: now,
            value: MetricValue::Text("n/a".into()),
        }];
        assert!(!threshold_holds(CmpOp::Gt, 0.0, &readings, 0, now));
    }

    #[test]
    fn multi_all_and_any_combinators() {
        let now = Utc::now();
        let mut by_metric = HashMap::new();
        by_metric.insert("temperature".to_string(), vec![reading(5, 45.0, now)]);
        by_metric.insert("humidity".to_string(), vec![reading(5, 30.0, now)]);

        let hot = Condition {
            metric: "temperature".into(),
            op: CmpOp::Gt,
            threshold: 40.0,
            duration_seconds: 0,
        };
        let dry = Condition {
            metric: "humidity".into(),
            op: CmpOp::Lt,
            threshold: 20.0,
            duration_seconds: 0,
        };

        let all = RuleMode::Multi {
            conditions: vec![hot.clone(), dry.clone()],
            match_kind: MatchKind::All,
        };
        let any = RuleMode::Multi {
            conditions: vec![hot, dry],
            match_kind: MatchKind::Any,
        };

        // temperature passes, humidity does not.
        assert!(!rule_fires(&all, 0, &by_metric, &[], now));
        assert!(rule_fires(&any, 0, &by_metric, &[], now));
    }

    #[test]
    fn missing_metric_counts_as_not_firing() {
        let now = Utc::now();
        let mode = RuleMode::Threshold {
            metric: "absent".into(),
            op: CmpOp::Gt,
            threshold: 0.0,
        };
        assert!(!rule_fires(&mode, 0, &HashMap::new(), &[], now));
    }
}
