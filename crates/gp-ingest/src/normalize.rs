//! Metric-key normalization against the device's merged key map.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use gp_protocol::MetricValue;

use crate::metrics::IngestMetrics;
use crate::sinks::{DeviceDirectory, DirectoryError};

/// Rewrite raw firmware keys to canonical ones.
///
/// Keys without a mapping pass through unchanged. Keys that are already
/// canonical (appear as a mapping target) are never rewritten again, so
/// normalization is idempotent.
pub fn apply_key_map(
    key_map: &HashMap<String, String>,
    metrics: BTreeMap<String, MetricValue>,
) -> (BTreeMap<String, MetricValue>, u64) {
    if key_map.is_empty() {
        return (metrics, 0);
    }

    let canonical: std::collections::HashSet<&str> =
        key_map.values().map(String::as_str).collect();

    let mut out = BTreeMap::new();
    let mut remapped = 0;
    for (key, value) in metrics {
        let target = if canonical.contains(key.as_str()) {
            key
        } else {
            match key_map.get(&key) {
                Some(canonical_key) if *canonical_key != key => {
                    remapped += 1;
                    canonical_key.clone()
                }
                _ => key,
            }
        };
        out.insert(target, value);
    }
    (out, remapped)
}

/// TTL cache of per-device key maps over the directory.
pub struct KeyMapCache {
    cache: Cache<(String, String), Arc<HashMap<String, String>>>,
    directory: Arc<dyn DeviceDirectory>,
    metrics: IngestMetrics,
}

impl KeyMapCache {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        max_capacity: u64,
        ttl: Duration,
        metrics: IngestMetrics,
    ) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
            directory,
            metrics,
        }
    }

    pub async fn normalize(
        &self,
        tenant: &str,
        device_id: &str,
        metrics: BTreeMap<String, MetricValue>,
    ) -> Result<BTreeMap<String, MetricValue>, DirectoryError> {
        let key = (tenant.to_string(), device_id.to_string());
        let directory = Arc::clone(&self.directory);
        let (t, d) = key.clone();
        let map = self
            .cache
            .try_get_with(key, async move {
                directory.key_map(&t, &d).await.map(Arc::new)
            })
            .await
            .map_err(|e| DirectoryError(e.to_string()))?;

        let (normalized, remapped) = apply_key_map(&map, metrics);
        self.metrics.metric_keys_remapped_total.add(remapped);
        Ok(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics_of(pairs: &[(&str, f64)]) -> BTreeMap<String, MetricValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), MetricValue::Number(*v)))
            .collect()
    }

    #[test]
    fn maps_raw_keys_and_passes_unknown_through() {
        let mut key_map = HashMap::new();
        key_map.insert("tmp".to_string(), "temperature".to_string());

        let (out, remapped) = apply_key_map(&key_map, metrics_of(&[("tmp", 21.0), ("hum", 40.0)]));
        assert_eq!(remapped, 1);
        assert!(out.contains_key("temperature"));
        assert!(out.contains_key("hum"));
        assert!(!out.contains_key("tmp"));
    }

    #[test]
    fn normalization_is_idempotent() {
        let mut key_map = HashMap::new();
        key_map.insert("tmp".to_string(), "temperature".to_string());
        // A pathological map that would re-route the canonical key.
        key_map.insert("temperature".to_string(), "temp_c".to_string());

        let (once, _) = apply_key_map(&key_map, metrics_of(&[("tmp", 21.0)]));
        let (twice, remapped) = apply_key_map(&key_map, once.clone());
        assert_eq!(once, twice, "normalize(normalize(m)) must equal normalize(m)");
        assert_eq!(remapped, 0);
    }

    #[test]
    fn empty_map_is_a_noop() {
        let input = metrics_of(&[("a", 1.0)]);
        let (out, remapped) = apply_key_map(&HashMap::new(), input.clone());
        assert_eq!(out, input);
        assert_eq!(remapped, 0);
    }

    #[tokio::test]
    async fn cache_serves_key_map() {
        use crate::sinks::{MemoryDevice, MemoryDirectory, hash_token};
        use gp_protocol::{DeviceStatus, RateTier, TenantStatus};
        use gp_store::devices::AuthRecord;

        let dir = Arc::new(MemoryDirectory::new());
        let mut key_map = HashMap::new();
        key_map.insert("tmp".to_string(), "temperature".to_string());
        dir.insert(
            "acme",
            "d1",
            MemoryDevice {
                auth: AuthRecord {
                    token_hash: hash_token("s"),
                    token_active: true,
                    site_id: "plant-a".into(),
                    device_status: DeviceStatus::Online,
                    tenant_status: TenantStatus::Active,
                    tier: RateTier::default(),
                },
                key_map,
            },
        );

        let cache = KeyMapCache::new(dir, 100, Duration::from_secs(60), IngestMetrics::new());
        let out = cache
            .normalize("acme", "d1", metrics_of(&[("tmp", 21.0)]))
            .await
            .unwrap();
        assert!(out.contains_key("temperature"));
    }
}
