//! Bridge configuration.

/// Bridge process settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Health/metrics listen address (HTTP_LISTEN_ADDR, default ":8081").
    pub http_listen_addr: String,
    /// Cap on concurrent bus publishes (BRIDGE_MAX_IN_FLIGHT, default 256).
    pub max_in_flight: usize,
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self {
            http_listen_addr: std::env::var("HTTP_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8081".to_string()),
            max_in_flight: std::env::var("BRIDGE_MAX_IN_FLIGHT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(256),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            http_listen_addr: "0.0.0.0:8081".to_string(),
            max_in_flight: 256,
        }
    }
}
