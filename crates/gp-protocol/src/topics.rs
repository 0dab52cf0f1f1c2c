//! MQTT topic builders and parsers for the device-facing topic hierarchy.
//!
//! Topic structure:
//! ```text
//! tenant/{tenant}/device/{device}/telemetry
//! tenant/{tenant}/device/{device}/shadow
//! tenant/{tenant}/device/{device}/command
//! ```

use crate::envelope::MsgType;

const PREFIX: &str = "tenant";

pub fn device_topic(tenant: &str, device: &str, msg_type: MsgType) -> String {
    format!("{PREFIX}/{tenant}/device/{device}/{}", msg_type.as_str())
}

pub fn telemetry(tenant: &str, device: &str) -> String {
    device_topic(tenant, device, MsgType::Telemetry)
}

pub fn shadow(tenant: &str, device: &str) -> String {
    device_topic(tenant, device, MsgType::Shadow)
}

pub fn command(tenant: &str, device: &str) -> String {
    device_topic(tenant, device, MsgType::Command)
}

// ─── Subscription patterns (with MQTT wildcards) ───

/// Subscribe to every device message across all tenants (bridge-side).
pub fn all_devices() -> String {
    format!("{PREFIX}/+/device/+/+")
}

/// Subscribe to all messages for one tenant's devices.
pub fn tenant_devices(tenant: &str) -> String {
    format!("{PREFIX}/{tenant}/device/+/+")
}

// ─── Topic parsing ───

/// Parsed MQTT topic components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub tenant: String,
    pub device: String,
    pub msg_type: MsgType,
}

/// Parse a device topic into its components.
/// Returns `None` if the topic doesn't match the expected format.
pub fn parse_topic(topic: &str) -> Option<ParsedTopic> {
    let parts: Vec<&str> = topic.split('/').collect();

    if parts.len() != 5 || parts[0] != PREFIX || parts[2] != "device" {
        return None;
    }
    if parts[1].is_empty() || parts[3].is_empty() {
        return None;
    }

    Some(ParsedTopic {
        tenant: parts[1].to_string(),
        device: parts[3].to_string(),
        msg_type: MsgType::parse(parts[4])?,
    })
}
