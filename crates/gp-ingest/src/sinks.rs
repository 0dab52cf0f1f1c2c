//! Storage seams for the pipeline: device directory, telemetry sink, and
//! quarantine sink.
//!
//! Each trait has a Postgres-backed implementation and an in-memory one
//! for tests and the e2e harness.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use gp_protocol::{QuarantineReason, TelemetryRecord};
use gp_store::devices::AuthRecord;

/// Transient lookup failure; the message stays on the bus for redelivery.
#[derive(Debug, Clone, thiserror::Error)]
#[error("directory lookup failed: {0}")]
pub struct DirectoryError(pub String);

/// Persistence failure from a sink.
#[derive(Debug, Clone, thiserror::Error)]
#[error("sink write failed: {0}")]
pub struct SinkError(pub String);

/// Hash a device secret for storage/comparison.
pub fn hash_token(secret: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(secret.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Device registry lookups used by the auth stage.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn fetch_auth(
        &self,
        tenant: &str,
        device_id: &str,
    ) -> Result<Option<AuthRecord>, DirectoryError>;

    /// First-contact registration with a provision token hash.
    async fn provision(
        &self,
        tenant: &str,
        device_id: &str,
        site_id: &str,
        token_hash: &str,
    ) -> Result<(), DirectoryError>;

    async fn key_map(
        &self,
        tenant: &str,
        device_id: &str,
    ) -> Result<HashMap<String, String>, DirectoryError>;
}

/// Batch persistence for accepted records.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn write_batch(&self, tenant: &str, records: &[TelemetryRecord])
    -> Result<(), SinkError>;
}

/// Durable storage for rejected records.
#[async_trait]
pub trait QuarantineSink: Send + Sync {
    async fn quarantine(
        &self,
        tenant: &str,
        device_id: Option<&str>,
        reason: QuarantineReason,
        raw_payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<(), SinkError>;
}

// ── Postgres-backed implementations ───────────────────────────

pub struct StoreDirectory {
    pool: PgPool,
}

impl StoreDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceDirectory for StoreDirectory {
    async fn fetch_auth(
        &self,
        tenant: &str,
        device_id: &str,
    ) -> Result<Option<AuthRecord>, DirectoryError> {
        gp_store::devices::fetch_auth(&self.pool, tenant, device_id)
            .await
            .map_err(|e| DirectoryError(e.to_string()))
    }

    async fn provision(
        &self,
        tenant: &str,
        device_id: &str,
        site_id: &str,
        token_hash: &str,
    ) -> Result<(), DirectoryError> {
        gp_store::devices::provision_device(&self.pool, tenant, device_id, site_id, token_hash)
            .await
            .map_err(|e| DirectoryError(e.to_string()))
    }

    async fn key_map(
        &self,
        tenant: &str,
        device_id: &str,
    ) -> Result<HashMap<String, String>, DirectoryError> {
        gp_store::devices::fetch_key_map(&self.pool, tenant, device_id)
            .await
            .map_err(|e| DirectoryError(e.to_string()))
    }
}

pub struct StoreTelemetry {
    pool: PgPool,
}

impl StoreTelemetry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TelemetrySink for StoreTelemetry {
    async fn write_batch(
        &self,
        tenant: &str,
        records: &[TelemetryRecord],
    ) -> Result<(), SinkError> {
        gp_store::telemetry::insert_batch(&self.pool, tenant, records)
            .await
            .map_err(|e| SinkError(e.to_string()))
    }
}

pub struct StoreQuarantine {
    pool: PgPool,
}

impl StoreQuarantine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuarantineSink for StoreQuarantine {
    async fn quarantine(
        &self,
        tenant: &str,
        device_id: Option<&str>,
        reason: QuarantineReason,
        raw_payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        gp_store::quarantine::insert(&self.pool, tenant, device_id, reason, raw_payload, received_at)
            .await
            .map_err(|e| SinkError(e.to_string()))
    }
}

// ── In-memory implementations for tests ───────────────────────

/// Registered device entry in the in-memory directory.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    pub auth: AuthRecord,
    pub key_map: HashMap<String, String>,
}

/// In-memory `DeviceDirectory` with call counting for cache assertions.
#[derive(Default)]
pub struct MemoryDirectory {
    devices: Mutex<HashMap<(String, String), MemoryDevice>>,
    fetch_calls: std::sync::atomic::AtomicU64,
    fail_lookups: std::sync::atomic::AtomicBool,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant: &str, device_id: &str, device: MemoryDevice) {
        self.devices
            .lock()
            .unwrap()
            .insert((tenant.to_string(), device_id.to_string()), device);
    }

    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups
            .store(fail, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn contains(&self, tenant: &str, device_id: &str) -> bool {
        self.devices
            .lock()
            .unwrap()
            .contains_key(&(tenant.to_string(), device_id.to_string()))
    }
}

#[async_trait]
impl DeviceDirectory for MemoryDirectory {
    async fn fetch_auth(
        &self,
        tenant: &str,
        device_id: &str,
    ) -> Result<Option<AuthRecord>, DirectoryError> {
        self.fetch_calls
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if self.fail_lookups.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(DirectoryError("simulated outage".into()));
        }
        Ok(self
            .devices
            .lock()
            .unwrap()
            .get(&(tenant.to_string(), device_id.to_string()))
            .map(|d| d.auth.clone()))
    }

    async fn provision(
        &self,
        tenant: &str,
        device_id: &str,
        site_id: &str,
        token_hash: &str,
    ) -> Result<(), DirectoryError> {
        use gp_protocol::{DeviceStatus, RateTier, TenantStatus};
        self.insert(
            tenant,
            device_id,
            MemoryDevice {
                auth: AuthRecord {
                    token_hash: token_hash.to_string(),
                    token_active: true,
                    site_id: site_id.to_string(),
                    device_status: DeviceStatus::Online,
                    tenant_status: TenantStatus::Active,
                    tier: RateTier::default(),
                },
                key_map: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn key_map(
        &self,
        tenant: &str,
        device_id: &str,
    ) -> Result<HashMap<String, String>, DirectoryError> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .get(&(tenant.to_string(), device_id.to_string()))
            .map(|d| d.key_map.clone())
            .unwrap_or_default())
    }
}

/// In-memory telemetry sink recording written batches.
#[derive(Default)]
pub struct MemoryTelemetry {
    records: Mutex<Vec<TelemetryRecord>>,
    batches: std::sync::atomic::AtomicU64,
    attempts: std::sync::atomic::AtomicU64,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn batch_count(&self) -> u64 {
        self.batches.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Write attempts, including failed ones.
    pub fn attempt_count(&self) -> u64 {
        self.attempts.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::Relaxed);
    }
}

#[async_trait]
impl TelemetrySink for MemoryTelemetry {
    async fn write_batch(
        &self,
        _tenant: &str,
        records: &[TelemetryRecord],
    ) -> Result<(), SinkError> {
        self.attempts
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if self.fail_writes.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(SinkError("simulated write failure".into()));
        }
        self.records.lock().unwrap().extend_from_slice(records);
        self.batches
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }
}

/// One quarantined record, as captured by [`MemoryQuarantine`].
#[derive(Debug, Clone)]
pub struct QuarantineEntry {
    pub tenant: String,
    pub device_id: Option<String>,
    pub reason: QuarantineReason,
    pub raw_payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// In-memory quarantine sink.
#[derive(Default)]
pub struct MemoryQuarantine {
    entries: Mutex<Vec<QuarantineEntry>>,
}

impl MemoryQuarantine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<QuarantineEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count_with_reason(&self, reason: QuarantineReason) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.reason == reason)
            .count()
    }
}

#[async_trait]
impl QuarantineSink for MemoryQuarantine {
    async fn quarantine(
        &self,
        tenant: &str,
        device_id: Option<&str>,
        reason: QuarantineReason,
        raw_payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        self.entries.lock().unwrap().push(QuarantineEntry {
            tenant: tenant.to_string(),
            device_id: device_id.map(String::from),
            reason,
            raw_payload: raw_payload.to_vec(),
            received_at,
        });
        Ok(())
    }
}
