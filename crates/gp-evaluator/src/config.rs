//! Evaluator configuration.

use std::time::Duration;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Safety-net evaluation interval (FALLBACK_POLL_SECONDS, default 30).
    pub fallback_poll: Duration,
    /// Burst-collapsing delay after a change notification.
    pub debounce: Duration,
    /// Rolling window for anomaly baselines (ANOMALY_WINDOW_SECONDS, default 3600).
    pub anomaly_window: Duration,
    /// Health/metrics listener (HTTP_LISTEN_ADDR, default ":8082").
    pub http_listen_addr: String,
}

impl EvaluatorConfig {
    pub fn from_env() -> Self {
        Self {
            fallback_poll: Duration::from_secs(env_u64("FALLBACK_POLL_SECONDS", 30)),
            debounce: Duration::from_millis(500),
            anomaly_window: Duration::from_secs(env_u64("ANOMALY_WINDOW_SECONDS", 3600)),
            http_listen_addr: std::env::var("HTTP_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8082".to_string()),
        }
    }
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            fallback_poll: Duration::from_secs(30),
            debounce: Duration::from_millis(500),
            anomaly_window: Duration::from_secs(3600),
            http_listen_addr: "0.0.0.0:8082".to_string(),
        }
    }
}
