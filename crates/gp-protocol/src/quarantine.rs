//! Quarantine reason codes for rejected ingest records.

use serde::{Deserialize, Serialize};

/// Why a record was quarantined instead of persisted.
///
/// The snake_case code is stored verbatim in the quarantine table and
/// surfaced in counters, so variants are append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    EnvelopeMalformed,
    DeviceUnknown,
    AuthFailed,
    SubscriptionInactive,
    SiteMismatch,
    TimestampOutOfRange,
    PayloadTooLarge,
    TooManyMetrics,
    MetricValueInvalid,
    WriteFailed,
}

impl QuarantineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineReason::EnvelopeMalformed => "envelope_malformed",
            QuarantineReason::DeviceUnknown => "device_unknown",
            QuarantineReason::AuthFailed => "auth_failed",
            QuarantineReason::SubscriptionInactive => "subscription_inactive",
            QuarantineReason::SiteMismatch => "site_mismatch",
            QuarantineReason::TimestampOutOfRange => "timestamp_out_of_range",
            QuarantineReason::PayloadTooLarge => "payload_too_large",
            QuarantineReason::TooManyMetrics => "too_many_metrics",
            QuarantineReason::MetricValueInvalid => "metric_value_invalid",
            QuarantineReason::WriteFailed => "write_failed",
        }
    }
}

impl std::fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
