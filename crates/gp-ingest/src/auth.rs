//! Device auth cache with single-flight database lookups.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use gp_protocol::{QuarantineReason, RateTier, TenantStatus};
use gp_store::devices::AuthRecord;

use crate::metrics::IngestMetrics;
use crate::sinks::{DeviceDirectory, DirectoryError, hash_token};

/// Outcome of the authorization stage.
#[derive(Debug, Clone)]
pub enum AuthDecision {
    Ok(AuthOk),
    Reject(QuarantineReason),
}

/// Data the rest of the pipeline needs after a successful auth.
#[derive(Debug, Clone)]
pub struct AuthOk {
    pub site_id: String,
    pub tier: RateTier,
}

/// Bounded, TTL-based cache over the device directory.
///
/// `try_get_with` coalesces concurrent lookups for the same key into one
/// in-flight DB query. Negative lookups (unknown devices) are cached too,
/// so a misbehaving device cannot hammer the directory.
pub struct AuthCache {
    cache: Cache<(String, String), Option<Arc<AuthRecord>>>,
    directory: Arc<dyn DeviceDirectory>,
    metrics: IngestMetrics,
}

impl AuthCache {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        max_capacity: u64,
        ttl: Duration,
        metrics: IngestMetrics,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self {
            cache,
            directory,
            metrics,
        }
    }

    /// Cached auth record for a device; `None` means unregistered.
    pub async fn lookup(
        &self,
        tenant: &str,
        device_id: &str,
    ) -> Result<Option<Arc<AuthRecord>>, DirectoryError> {
        let key = (tenant.to_string(), device_id.to_string());

        // Racy pre-check for hit/miss accounting only; try_get_with still
        // guarantees a single loader per key.
        if let Some(entry) = self.cache.get(&key).await {
            self.metrics.cache_hits_total.inc();
            return Ok(entry);
        }
        self.metrics.cache_misses_total.inc();

        let directory = Arc::clone(&self.directory);
        let (tenant, device_id) = key.clone();
        self.cache
            .try_get_with(key, async move {
                directory
                    .fetch_auth(&tenant, &device_id)
                    .await
                    .map(|opt| opt.map(Arc::new))
            })
            .await
            .map_err(|e| DirectoryError(e.to_string()))
    }

    pub async fn invalidate(&self, tenant: &str, device_id: &str) {
        self.cache
            .invalidate(&(tenant.to_string(), device_id.to_string()))
            .await;
    }

    /// Full authorization stage: resolve the device (provisioning it on
    /// first contact when a provision token is supplied), verify any
    /// presented secret, and check tenant standing.
    pub async fn authorize(
        &self,
        tenant: &str,
        device_id: &str,
        site_id: &str,
        provision_token: Option<&str>,
        presented_secret: Option<&str>,
    ) -> Result<AuthDecision, DirectoryError> {
        let mut record = self.lookup(tenant, device_id).await?;

        if record.is_none() {
            let Some(token) = provision_token else {
                return Ok(AuthDecision::Reject(QuarantineReason::DeviceUnknown));
            };
            self.directory
                .provision(tenant, device_id, site_id, &hash_token(token))
                .await?;
            self.invalidate(tenant, device_id).await;
            record = self.lookup(tenant, device_id).await?;
            tracing::info!(tenant, device_id, "device provisioned on first contact");
        }

        let Some(record) = record else {
            // Provisioning raced with a delete; treat as unknown.
            return Ok(AuthDecision::Reject(QuarantineReason::DeviceUnknown));
        };

        if !record.token_active {
            return Ok(AuthDecision::Reject(QuarantineReason::AuthFailed));
        }
        if let Some(secret) = presented_secret {
            if hash_token(secret) != record.token_hash {
                return Ok(AuthDecision::Reject(QuarantineReason::AuthFailed));
            }
        }
        if record.tenant_status != TenantStatus::Active {
            return Ok(AuthDecision::Reject(QuarantineReason::SubscriptionInactive));
        }

        Ok(AuthDecision::Ok(AuthOk {
            site_id: record.site_id.clone(),
            tier: record.tier,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::{MemoryDevice, MemoryDirectory};
    use gp_protocol::DeviceStatus;
    use std::collections::HashMap;

    fn registered(secret: &str, tenant_status: TenantStatus) -> MemoryDevice {
        MemoryDevice {
            auth: AuthRecord {
                token_hash: hash_token(secret),
                token_active: true,
                site_id: "plant-a".into(),
                device_status: DeviceStatus::Online,
                tenant_status,
                tier: RateTier::default(),
            },
            key_map: HashMap::new(),
        }
    }

    fn cache_over(directory: Arc<MemoryDirectory>) -> AuthCache {
        AuthCache::new(directory, 100, Duration::from_secs(60), IngestMetrics::new())
    }

    #[tokio::test]
    async fn hit_after_miss_skips_directory() {
        let dir = Arc::new(MemoryDirectory::new());
        dir.insert("acme", "d1", registered("s", TenantStatus::Active));
        let cache = cache_over(Arc::clone(&dir));

        assert!(cache.lookup("acme", "d1").await.unwrap().is_some());
        assert!(cache.lookup("acme", "d1").await.unwrap().is_some());
        assert_eq!(dir.fetch_calls(), 1, "second lookup must be served from cache");
    }

    #[tokio::test]
    async fn concurrent_lookups_coalesce() {
        let dir = Arc::new(MemoryDirectory::new());
        dir.insert("acme", "d1", registered("s", TenantStatus::Active));
        let cache = Arc::new(cache_over(Arc::clone(&dir)));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(
                async move { cache.lookup("acme", "d1").await },
            ));
        }
        for h in handles {
            assert!(h.await.unwrap().unwrap().is_some());
        }
        assert!(
            dir.fetch_calls() <= 2,
            "concurrent misses must coalesce, saw {} fetches",
            dir.fetch_calls()
        );
    }

    #[tokio::test]
    async fn unknown_device_without_token_rejected() {
        let dir = Arc::new(MemoryDirectory::new());
        let cache = cache_over(dir);
        let decision = cache
            .authorize("acme", "ghost", "plant-a", None, None)
            .await
            .unwrap();
        assert!(matches!(
            decision,
            AuthDecision::Reject(QuarantineReason::DeviceUnknown)
        ));
    }

    #[tokio::test]
    async fn provision_token_registers_device() {
        let dir = Arc::new(MemoryDirectory::new());
        let cache = cache_over(Arc::clone(&dir));

        let decision = cache
            .authorize("acme", "new-dev", "plant-a", Some("boot-token"), None)
            .await
            .unwrap();
        assert!(matches!(decision, AuthDecision::Ok(_)));
        assert!(dir.contains("acme", "new-dev"));

        // Second contact: token comes from the store, not the payload.
        let decision = cache
            .authorize("acme", "new-dev", "plant-a", None, None)
            .await
            .unwrap();
        assert!(matches!(decision, AuthDecision::Ok(_)));
    }

    #[tokio::test]
    async fn wrong_secret_rejected() {
        let dir = Arc::new(MemoryDirectory::new());
        dir.insert("acme", "d1", registered("right", TenantStatus::Active));
        let cache = cache_over(dir);

        let decision = cache
            .authorize("acme", "d1", "plant-a", None, Some("wrong"))
            .await
            .unwrap();
        assert!(matches!(
            decision,
            AuthDecision::Reject(QuarantineReason::AuthFailed)
        ));

        let decision = cache
            .authorize("acme", "d1", "plant-a", None, Some("right"))
            .await
            .unwrap();
        assert!(matches!(decision, AuthDecision::Ok(_)));
    }

    #[tokio::test]
    async fn suspended_tenant_rejected() {
        let dir = Arc::new(MemoryDirectory::new());
        dir.insert("acme", "d1", registered("s", TenantStatus::Suspended));
        let cache = cache_over(dir);

        let decision = cache
            .authorize("acme", "d1", "plant-a", None, None)
            .await
            .unwrap();
        assert!(matches!(
            decision,
            AuthDecision::Reject(QuarantineReason::SubscriptionInactive)
        ));
    }

    #[tokio::test]
    async fn directory_outage_is_transient() {
        let dir = Arc::new(MemoryDirectory::new());
        dir.set_fail_lookups(true);
        let cache = cache_over(dir);
        assert!(cache.authorize("acme", "d1", "s", None, None).await.is_err());
    }
}
