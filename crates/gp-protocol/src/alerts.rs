//! Alert rules, alerts, and fingerprints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Alert severity, ordered so escalation can only raise it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Open,
    Ack,
    Closed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "OPEN",
            AlertStatus::Ack => "ACK",
            AlertStatus::Closed => "CLOSED",
        }
    }
}

/// Comparison operator for threshold conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CmpOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Neq,
}

impl CmpOp {
    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            CmpOp::Gt => value > threshold,
            CmpOp::Gte => value >= threshold,
            CmpOp::Lt => value < threshold,
            CmpOp::Lte => value <= threshold,
            CmpOp::Eq => value == threshold,
            CmpOp::Neq => value != threshold,
        }
    }
}

/// One threshold triple inside a multi-condition rule. Each condition
/// carries its own hold window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub metric: String,
    pub op: CmpOp,
    pub threshold: f64,
    #[serde(default)]
    pub duration_seconds: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchKind {
    All,
    Any,
}

/// Rule evaluation mode with its mode-specific configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RuleMode {
    Threshold {
        metric: String,
        op: CmpOp,
        threshold: f64,
    },
    Multi {
        conditions: Vec<Condition>,
        #[serde(rename = "match")]
        match_kind: MatchKind,
    },
    Anomaly {
        metric: String,
        /// In `[0, 1]`; higher means more alerts for the same input.
        sensitivity: f64,
    },
}

/// Which devices a rule applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum DeviceScope {
    All,
    Devices { ids: Vec<String> },
    Site { site_id: String },
}

impl DeviceScope {
    pub fn includes(&self, device_id: &str, site_id: &str) -> bool {
        match self {
            DeviceScope::All => true,
            DeviceScope::Devices { ids } => ids.iter().any(|d| d == device_id),
            DeviceScope::Site { site_id: s } => s == site_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub rule_id: Uuid,
    pub tenant: String,
    pub severity: Severity,
    pub enabled: bool,
    pub device_scope: DeviceScope,
    /// Condition must hold continuously this long before firing; 0 means
    /// evaluate the latest value only.
    pub duration_seconds: u32,
    #[serde(flatten)]
    pub mode: RuleMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_policy_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Rule,
    NoHeartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: Uuid,
    pub tenant: String,
    pub device_id: String,
    pub rule_id: Option<Uuid>,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub status: AlertStatus,
    pub fingerprint: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub escalation_level: i32,
    pub next_escalation_at: Option<DateTime<Utc>>,
}

// ─── Fingerprints ───
//
// A fingerprint identifies "the same logical alert"; the string used to
// close an alert must equal the one used to open it, byte for byte.

pub fn rule_fingerprint(rule_id: Uuid, device_id: &str) -> String {
    format!("RULE:{rule_id}:{device_id}")
}

pub fn heartbeat_fingerprint(device_id: &str) -> String {
    format!("NO_HEARTBEAT:{device_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operators() {
        assert!(CmpOp::Gt.compare(41.0, 40.0));
        assert!(!CmpOp::Gt.compare(40.0, 40.0));
        assert!(CmpOp::Gte.compare(40.0, 40.0));
        assert!(CmpOp::Lt.compare(19.0, 20.0));
        assert!(CmpOp::Lte.compare(20.0, 20.0));
        assert!(CmpOp::Eq.compare(1.0, 1.0));
        assert!(CmpOp::Neq.compare(1.0, 2.0));
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn fingerprints_are_stable() {
        let rule = Uuid::nil();
        assert_eq!(
            rule_fingerprint(rule, "sensor-17"),
            format!("RULE:{rule}:sensor-17")
        );
        assert_eq!(heartbeat_fingerprint("sensor-17"), "NO_HEARTBEAT:sensor-17");
        // Bitwise equality between open and close paths.
        assert_eq!(
            rule_fingerprint(rule, "sensor-17"),
            rule_fingerprint(rule, "sensor-17")
        );
    }

    #[test]
    fn rule_mode_tagged_json() {
        let rule = AlertRule {
            rule_id: Uuid::nil(),
            tenant: "acme".into(),
            severity: Severity::Warning,
            enabled: true,
            device_scope: DeviceScope::All,
            duration_seconds: 60,
            mode: RuleMode::Threshold {
                metric: "temperature".into(),
                op: CmpOp::Gt,
                threshold: 40.0,
            },
            escalation_policy_id: None,
        };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["mode"], "threshold");
        assert_eq!(json["metric"], "temperature");
        assert_eq!(json["op"], "GT");

        let back: AlertRule = serde_json::from_value(json).unwrap();
        assert_eq!(back.mode, rule.mode);
    }

    #[test]
    fn multi_mode_roundtrip() {
        let mode = RuleMode::Multi {
            conditions: vec![
                Condition {
                    metric: "humidity".into(),
                    op: CmpOp::Lt,
                    threshold: 20.0,
                    duration_seconds: 60,
                },
                Condition {
                    metric: "temperature".into(),
                    op: CmpOp::Gt,
                    threshold: 30.0,
                    duration_seconds: 0,
                },
            ],
            match_kind: MatchKind::All,
        };
        let json = serde_json::to_string(&mode).unwrap();
        let back: RuleMode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mode);
    }

    #[test]
    fn scope_matching() {
        assert!(DeviceScope::All.includes("d1", "s1"));
        assert!(DeviceScope::Devices { ids: vec!["d1".into()] }.includes("d1", "s1"));
        assert!(!DeviceScope::Devices { ids: vec!["d2".into()] }.includes("d1", "s1"));
        assert!(DeviceScope::Site { site_id: "s1".into() }.includes("d1", "s1"));
    }
}
