//! Telemetry payload schema published by devices.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single metric value: numeric, boolean, or short text.
///
/// Untagged so device firmware can publish plain JSON scalars. Variant
/// order matters: booleans must be tried before numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(n) => Some(*n),
            MetricValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            MetricValue::Text(_) => None,
        }
    }

    /// True when the value fits the ingest constraints (finite numbers,
    /// text at most `max_text` characters).
    pub fn is_admissible(&self, max_text: usize) -> bool {
        match self {
            MetricValue::Bool(_) => true,
            MetricValue::Number(n) => n.is_finite(),
            MetricValue::Text(s) => s.chars().count() <= max_text,
        }
    }
}

fn default_version() -> String {
    "1".to_string()
}

/// Device telemetry publish body.
///
/// `ts` is epoch seconds from the device clock; the `time` alias is kept
/// for older firmware revisions. The metric map uses a `BTreeMap` so
/// serialization is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPayload {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(alias = "time")]
    pub ts: i64,
    pub site_id: String,
    #[serde(default)]
    pub seq: Option<i64>,
    pub metrics: BTreeMap<String, MetricValue>,
    /// Only honoured on first contact, before the device is registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provision_token: Option<String>,
}

/// One validated, normalized reading ready for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub tenant: String,
    pub device_id: String,
    pub site_id: String,
    pub time: chrono::DateTime<chrono::Utc>,
    pub seq: Option<i64>,
    pub metrics: BTreeMap<String, MetricValue>,
}
