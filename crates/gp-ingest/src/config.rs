//! Ingestor configuration.

use std::time::Duration;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// All ingestor knobs, loaded from the environment at boot.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Records per flush (BATCH_SIZE, default 500).
    pub batch_size: usize,
    /// Max age of a buffered record before flush (FLUSH_INTERVAL_MS, default 1000).
    pub flush_interval: Duration,
    /// Concurrent bus consumers (INGEST_WORKER_COUNT, default 4).
    pub ingest_worker_count: usize,
    /// Route fan-out publisher tasks (DELIVERY_WORKER_COUNT, default 2).
    pub delivery_worker_count: usize,
    /// Auth cache TTL (AUTH_CACHE_TTL_SECONDS, default 60).
    pub auth_cache_ttl: Duration,
    /// Auth cache capacity (AUTH_CACHE_MAX_SIZE, default 10000).
    pub auth_cache_max_size: u64,
    /// Metric key-map cache TTL (METRIC_MAP_CACHE_TTL, default 300).
    pub metric_map_cache_ttl: Duration,
    /// Metric key-map cache capacity (METRIC_MAP_CACHE_SIZE, default 5000).
    pub metric_map_cache_size: u64,
    /// Idle token buckets are evicted past this age (BUCKET_TTL_SECONDS, default 3600).
    pub bucket_ttl: Duration,
    /// Bucket sweeper period (BUCKET_CLEANUP_INTERVAL, default 300).
    pub bucket_cleanup_interval: Duration,
    /// Route table refresh period (SETTINGS_POLL_SECONDS, default 60).
    pub settings_poll: Duration,
    /// Max raw payload size in bytes (MAX_PAYLOAD_BYTES, default 256 KiB).
    pub max_payload_bytes: usize,
    /// Health/metrics/ingest HTTP listener (HTTP_LISTEN_ADDR, default ":8080").
    pub http_listen_addr: String,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self {
            batch_size: env_usize("BATCH_SIZE", 500),
            flush_interval: Duration::from_millis(env_u64("FLUSH_INTERVAL_MS", 1000)),
            ingest_worker_count: env_usize("INGEST_WORKER_COUNT", 4),
            delivery_worker_count: env_usize("DELIVERY_WORKER_COUNT", 2),
            auth_cache_ttl: Duration::from_secs(env_u64("AUTH_CACHE_TTL_SECONDS", 60)),
            auth_cache_max_size: env_u64("AUTH_CACHE_MAX_SIZE", 10_000),
            metric_map_cache_ttl: Duration::from_secs(env_u64("METRIC_MAP_CACHE_TTL", 300)),
            metric_map_cache_size: env_u64("METRIC_MAP_CACHE_SIZE", 5_000),
            bucket_ttl: Duration::from_secs(env_u64("BUCKET_TTL_SECONDS", 3600)),
            bucket_cleanup_interval: Duration::from_secs(env_u64("BUCKET_CLEANUP_INTERVAL", 300)),
            settings_poll: Duration::from_secs(env_u64("SETTINGS_POLL_SECONDS", 60)),
            max_payload_bytes: env_usize("MAX_PAYLOAD_BYTES", 256 * 1024),
            http_listen_addr: std::env::var("HTTP_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_millis(1000),
            ingest_worker_count: 4,
            delivery_worker_count: 2,
            auth_cache_ttl: Duration::from_secs(60),
            auth_cache_max_size: 10_000,
            metric_map_cache_ttl: Duration::from_secs(300),
            metric_map_cache_size: 5_000,
            bucket_ttl: Duration::from_secs(3600),
            bucket_cleanup_interval: Duration::from_secs(300),
            settings_poll: Duration::from_secs(60),
            max_payload_bytes: 256 * 1024,
            http_listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = IngestConfig::default();
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.flush_interval, Duration::from_millis(1000));
        assert_eq!(config.ingest_worker_count, 4);
        assert_eq!(config.delivery_worker_count, 2);
        assert_eq!(config.auth_cache_max_size, 10_000);
        assert_eq!(config.bucket_ttl, Duration::from_secs(3600));
    }
}
