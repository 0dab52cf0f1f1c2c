//! Payload validation: shape, site, timestamp window, size, and metric
//! value constraints. Pure functions; every rejection carries a precise
//! quarantine reason.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

use gp_protocol::{Envelope, PayloadBody, QuarantineReason, TelemetryPayload};

/// Admission limits for one telemetry payload.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_payload_bytes: usize,
    pub max_metrics: usize,
    pub max_text_chars: usize,
    /// Readings may be at most this far in the past.
    pub max_past: ChronoDuration,
    /// Device clocks may run at most this far ahead.
    pub max_future: ChronoDuration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_payload_bytes: 256 * 1024,
            max_metrics: 256,
            max_text_chars: 256,
            max_past: ChronoDuration::hours(24),
            max_future: ChronoDuration::minutes(5),
        }
    }
}

impl Limits {
    pub fn with_max_payload(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }
}

/// Validate an envelope's telemetry payload against the device's
/// registered site. Returns the parsed payload and its reading time.
pub fn validate_payload(
    envelope: &Envelope,
    expected_site: &str,
    limits: &Limits,
    now: DateTime<Utc>,
) -> Result<(TelemetryPayload, DateTime<Utc>), QuarantineReason> {
    if envelope.payload.approx_len() > limits.max_payload_bytes {
        return Err(QuarantineReason::PayloadTooLarge);
    }

    let PayloadBody::Object(map) = &envelope.payload else {
        return Err(QuarantineReason::EnvelopeMalformed);
    };
    let payload: TelemetryPayload =
        serde_json::from_value(serde_json::Value::Object(map.clone()))
            .map_err(|_| QuarantineReason::EnvelopeMalformed)?;

    if payload.site_id != expected_site {
        return Err(QuarantineReason::SiteMismatch);
    }

    let Some(time) = Utc.timestamp_opt(payload.ts, 0).single() else {
        return Err(QuarantineReason::TimestampOutOfRange);
    };
    if time < now - limits.max_past || time > now + limits.max_future {
        return Err(QuarantineReason::TimestampOutOfRange);
    }

    if payload.metrics.len() > limits.max_metrics {
        return Err(QuarantineReason::TooManyMetrics);
    }
    if !payload
        .metrics
        .values()
        .all(|v| v.is_admissible(limits.max_text_chars))
    {
        return Err(QuarantineReason::MetricValueInvalid);
    }

    Ok((payload, time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gp_protocol::{MsgType, topics};

    fn envelope_with(payload: serde_json::Value) -> Envelope {
        Envelope {
            tenant: "acme".into(),
            device: "d1".into(),
            msg_type: MsgType::Telemetry,
            topic: topics::telemetry("acme", "d1"),
            received_at: Utc::now(),
            payload: PayloadBody::Object(payload.as_object().unwrap().clone()),
            seq: None,
        }
    }

    fn good_payload(now: DateTime<Utc>) -> serde_json::Value {
        serde_json::json!({
            "ts": now.timestamp(),
            "site_id": "plant-a",
            "metrics": {"temperature": 21.5}
        })
    }

    #[test]
    fn accepts_valid_payload() {
        let now = Utc::now();
        let env = envelope_with(good_payload(now));
        let (payload, time) = validate_payload(&env, "plant-a", &Limits::default(), now).unwrap();
        assert_eq!(payload.site_id, "plant-a");
        assert_eq!(time.timestamp(), now.timestamp());
    }

    #[test]
    fn rejects_site_mismatch() {
        let now = Utc::now();
        let env = envelope_with(good_payload(now));
        assert_eq!(
            validate_payload(&env, "plant-b", &Limits::default(), now).unwrap_err(),
            QuarantineReason::SiteMismatch
        );
    }

    #[test]
    fn rejects_stale_and_future_timestamps() {
        let now = Utc::now();
        let limits = Limits::default();

        let mut old = good_payload(now);
        old["ts"] = serde_json::json!((now - ChronoDuration::hours(25)).timestamp());
        assert_eq!(
            validate_payload(&envelope_with(old), "plant-a", &limits, now).unwrap_err(),
            QuarantineReason::TimestampOutOfRange
        );

        let mut future = good_payload(now);
        future["ts"] = serde_json::json!((now + ChronoDuration::minutes(6)).timestamp());
        assert_eq!(
            validate_payload(&envelope_with(future), "plant-a", &limits, now).unwrap_err(),
            QuarantineReason::TimestampOutOfRange
        );

        // Just inside both edges.
        let mut edge = good_payload(now);
        edge["ts"] = serde_json::json!((now - ChronoDuration::hours(23)).timestamp());
        assert!(validate_payload(&envelope_with(edge), "plant-a", &limits, now).is_ok());
    }

    #[test]
    fn rejects_oversized_payload() {
        let now = Utc::now();
        let big = "x".repeat(1024);
        let env = envelope_with(serde_json::json!({
            "ts": now.timestamp(), "site_id": "plant-a", "metrics": {"blob": big}
        }));
        let limits = Limits::default().with_max_payload(256);
        assert_eq!(
            validate_payload(&env, "plant-a", &limits, now).unwrap_err(),
            QuarantineReason::PayloadTooLarge
        );
    }

    #[test]
    fn rejects_too_many_metrics() {
        let now = Utc::now();
        let mut metrics = serde_json::Map::new();
        for i in 0..257 {
            metrics.insert(format!("m{i}"), serde_json::json!(1.0));
        }
        let env = envelope_with(serde_json::json!({
            "ts": now.timestamp(), "site_id": "plant-a", "metrics": metrics
        }));
        assert_eq!(
            validate_payload(&env, "plant-a", &Limits::default(), now).unwrap_err(),
            QuarantineReason::TooManyMetrics
        );
    }

    #[test]
    fn rejects_invalid_metric_values() {
        let now = Utc::now();
        let long_text = "y".repeat(300);
        let env = envelope_with(serde_json::json!({
            "ts": now.timestamp(), "site_id": "plant-a", "metrics": {"note": long_text}
        }));
        assert_eq!(
            validate_payload(&env, "plant-a", &Limits::default(), now).unwrap_err(),
            QuarantineReason::MetricValueInvalid
        );
    }

    #[test]
    fn rejects_missing_required_fields() {
        let now = Utc::now();
        let env = envelope_with(serde_json::json!({"metrics": {}}));
        assert_eq!(
            validate_payload(&env, "plant-a", &Limits::default(), now).unwrap_err(),
            QuarantineReason::EnvelopeMalformed
        );
    }

    #[test]
    fn rejects_binary_payload_for_telemetry() {
        let now = Utc::now();
        let mut env = envelope_with(good_payload(now));
        env.payload = PayloadBody::Binary("AAAA".into());
        assert_eq!(
            validate_payload(&env, "plant-a", &Limits::default(), now).unwrap_err(),
            QuarantineReason::EnvelopeMalformed
        );
    }
}
