//! Bus configuration.

/// Connection and stream settings for the JetStream bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// NATS server URL (NATS_URL, default "nats://localhost:4222").
    pub url: String,
    /// Operation deadline applied to publish and fetch (BUS_OP_TIMEOUT_SECONDS).
    pub op_timeout_secs: u64,
    /// Telemetry/shadow/commands retention in hours (BUS_RETENTION_HOURS).
    pub retention_hours: u64,
    /// Routes stream retention in hours (BUS_ROUTES_RETENTION_HOURS).
    pub routes_retention_hours: u64,
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl BusConfig {
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            op_timeout_secs: env_u64("BUS_OP_TIMEOUT_SECONDS", 5),
            retention_hours: env_u64("BUS_RETENTION_HOURS", 24),
            routes_retention_hours: env_u64("BUS_ROUTES_RETENTION_HOURS", 6),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            op_timeout_secs: 5,
            retention_hours: 24,
            routes_retention_hours: 6,
        }
    }
}
