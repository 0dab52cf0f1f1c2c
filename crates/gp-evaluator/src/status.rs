//! Device status from heartbeat age.

use chrono::{DateTime, Utc};

use gp_protocol::DeviceStatus;

/// Classify a device by the age of its last telemetry.
///
/// Never-seen devices are OFFLINE. Thresholds come from tenant settings.
pub fn device_status(
    last_seen: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    stale_seconds: i64,
    offline_seconds: i64,
) -> DeviceStatus {
    let Some(last_seen) = last_seen else {
        return DeviceStatus::Offline;
    };
    let age = (now - last_seen).num_seconds();
    if age > offline_seconds {
        DeviceStatus::Offline
    } else if age > stale_seconds {
        DeviceStatus::Stale
    } else {
        DeviceStatus::Online
    }
}
