//! Delivery worker configuration.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Concurrent delivery processors (DELIVERY_WORKER_COUNT, default 2).
    pub worker_count: usize,
    /// Internal job queue capacity.
    pub queue_capacity: usize,
    /// Pause applied per poll when the queue fill-ratio exceeds 0.8.
    pub backpressure_pause: Duration,
    /// Total-time deadline for outbound HTTP.
    pub http_timeout: Duration,
    /// Retry-After values are honoured up to this cap.
    pub retry_after_cap: Duration,
    /// Health/metrics listener (HTTP_LISTEN_ADDR, default ":8084").
    pub http_listen_addr: String,
}

impl DeliveryConfig {
    pub fn from_env() -> Self {
        let worker_count = std::env::var("DELIVERY_WORKER_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2);
        Self {
            worker_count,
            queue_capacity: 256,
            backpressure_pause: Duration::from_millis(50),
            http_timeout: Duration::from_secs(10),
            retry_after_cap: Duration::from_secs(60),
            http_listen_addr: std::env::var("HTTP_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8084".to_string()),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            queue_capacity: 256,
            backpressure_pause: Duration::from_millis(50),
            http_timeout: Duration::from_secs(10),
            retry_after_cap: Duration::from_secs(60),
            http_listen_addr: "0.0.0.0:8084".to_string(),
        }
    }
}
