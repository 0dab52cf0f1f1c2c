//! Token-bucket admission control, tenant-scoped.
//!
//! Two buckets gate every record: the tenant-aggregate bucket first (so
//! one tenant cannot starve another), then the per-device bucket. Buckets
//! live in memory and idle ones are swept on a timer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use gp_protocol::RateTier;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BucketKey {
    Tenant(String),
    Device(String, String),
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

/// In-memory token buckets keyed by tenant and (tenant, device).
#[derive(Default)]
pub struct RateLimiter {
    buckets: DashMap<BucketKey, Bucket>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one record for `(tenant, device)` under the tenant's tier.
    ///
    /// Checks the tenant-aggregate bucket first; when the per-device
    /// bucket then rejects, the aggregate token is refunded so aggregate
    /// accounting stays exact.
    pub fn try_admit(&self, tenant: &str, device_id: &str, tier: &RateTier) -> bool {
        let aggregate = tier.aggregate();
        if !self.take(BucketKey::Tenant(tenant.to_string()), &aggregate) {
            return false;
        }
        if !self.take(
            BucketKey::Device(tenant.to_string(), device_id.to_string()),
            tier,
        ) {
            self.refund(&BucketKey::Tenant(tenant.to_string()), &aggregate);
            return false;
        }
        true
    }

    fn take(&self, key: BucketKey, tier: &RateTier) -> bool {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(key).or_insert_with(|| Bucket {
            tokens: tier.burst,
            last_refill: now,
            last_used: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * tier.refill_per_sec).min(tier.burst);
        bucket.last_refill = now;
        bucket.last_used = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refund(&self, key: &BucketKey, tier: &RateTier) {
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            bucket.tokens = (bucket.tokens + 1.0).min(tier.burst);
        }
    }

    /// Evict buckets idle longer than `ttl`. Returns how many were dropped.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let before = self.buckets.len();
        // checked_sub: the monotonic clock may be younger than the TTL.
        if let Some(cutoff) = Instant::now().checked_sub(ttl) {
            self.buckets.retain(|_, b| b.last_used > cutoff);
        }
        before - self.buckets.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Background sweeper, cancelled with the process.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        ttl: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = limiter.sweep(ttl);
                        if evicted > 0 {
                            tracing::debug!(evicted, "swept idle token buckets");
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
        })
    }
}
