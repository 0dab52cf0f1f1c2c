//! Orchestrator configuration.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Escalation tick period (ESCALATION_TICK_SECONDS, default 30).
    pub tick_interval: Duration,
    /// Due alerts claimed per tick.
    pub batch_limit: i64,
    /// Health/metrics listener (HTTP_LISTEN_ADDR, default ":8083").
    pub http_listen_addr: String,
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let tick_secs = std::env::var("ESCALATION_TICK_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        Self {
            tick_interval: Duration::from_secs(tick_secs),
            batch_limit: 100,
            http_listen_addr: std::env::var("HTTP_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8083".to_string()),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            batch_limit: 100,
            http_listen_addr: "0.0.0.0:8083".to_string(),
        }
    }
}
