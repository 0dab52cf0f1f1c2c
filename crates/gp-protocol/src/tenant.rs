//! Tenant, device, and subscription-tier types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Billing/activation state of a tenant. Everything is scoped by tenant;
/// a non-ACTIVE tenant has its telemetry rejected at ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TenantStatus {
    Active,
    Suspended,
    Expired,
}

/// Connectivity state derived from heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Online,
    Stale,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "ONLINE",
            DeviceStatus::Stale => "STALE",
            DeviceStatus::Offline => "OFFLINE",
        }
    }
}

/// Per-tenant ingest admission rate, taken from the subscription tier.
///
/// `refill_per_sec` and `burst` drive the per-device token bucket; the
/// tenant-aggregate bucket uses both multiplied by
/// [`RateTier::TENANT_FACTOR`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateTier {
    pub refill_per_sec: f64,
    pub burst: f64,
}

impl RateTier {
    /// Aggregate-bucket multiplier: one tenant gets at most this many
    /// devices' worth of sustained throughput before admission pushes back.
    pub const TENANT_FACTOR: f64 = 10.0;

    pub fn aggregate(&self) -> RateTier {
        RateTier {
            refill_per_sec: self.refill_per_sec * Self::TENANT_FACTOR,
            burst: self.burst * Self::TENANT_FACTOR,
        }
    }
}

impl Default for RateTier {
    fn default() -> Self {
        RateTier {
            refill_per_sec: 10.0,
            burst: 20.0,
        }
    }
}

/// Registry entry for a device (provisioning data, not live state).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub tenant: String,
    pub device_id: String,
    pub site_id: String,
    pub template_id: Option<String>,
    pub tags: Vec<String>,
    pub location: Option<Location>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Live connectivity state for a device, maintained by the evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    pub tenant: String,
    pub device_id: String,
    pub status: DeviceStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serialization() {
        assert_eq!(
            serde_json::to_string(&TenantStatus::Active).unwrap(),
            r#""ACTIVE""#
        );
        assert_eq!(
            serde_json::to_string(&DeviceStatus::Offline).unwrap(),
            r#""OFFLINE""#
        );
        let s: DeviceStatus = serde_json::from_str(r#""STALE""#).unwrap();
        assert_eq!(s, DeviceStatus::Stale);
    }

    #[test]
    fn aggregate_tier_scales() {
        let tier = RateTier {
            refill_per_sec: 10.0,
            burst: 20.0,
        };
        let agg = tier.aggregate();
        assert_eq!(agg.refill_per_sec, 100.0);
        assert_eq!(agg.burst, 200.0);
    }
}
