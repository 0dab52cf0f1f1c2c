//! Device registry, auth, and key-map queries.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use gp_protocol::{DeviceStatus, RateTier, TenantStatus};

/// Everything the ingest auth stage needs for one device, fetched in a
/// single query and held in the auth cache.
#[derive(Debug, Clone)]
pub struct AuthRecord {
    pub token_hash: String,
    pub token_active: bool,
    pub site_id: String,
    pub device_status: DeviceStatus,
    pub tenant_status: TenantStatus,
    pub tier: RateTier,
}

#[derive(sqlx::FromRow)]
struct AuthRow {
    token_hash: String,
    token_status: String,
    site_id: String,
    device_status: String,
    tenant_status: String,
    tier_refill: f64,
    tier_burst: f64,
}

fn parse_device_status(s: &str) -> DeviceStatus {
    match s {
        "ONLINE" => DeviceStatus::Online,
        "STALE" => DeviceStatus::Stale,
        _ => DeviceStatus::Offline,
    }
}

fn parse_tenant_status(s: &str) -> TenantStatus {
    match s {
        "ACTIVE" => TenantStatus::Active,
        "EXPIRED" => TenantStatus::Expired,
        _ => TenantStatus::Suspended,
    }
}

/// Fetch the auth record for a device, or `None` when it is unregistered.
pub async fn fetch_auth(
    pool: &PgPool,
    tenant: &str,
    device_id: &str,
) -> Result<Option<AuthRecord>, sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    let row = sqlx::query_as::<_, AuthRow>(
        "SELECT t.token_hash, t.status AS token_status, d.site_id,
                COALESCE(s.status, 'OFFLINE') AS device_status,
                tn.status AS tenant_status, tn.tier_refill, tn.tier_burst
         FROM devices d
         JOIN device_tokens t ON t.tenant = d.tenant AND t.device_id = d.device_id
         JOIN tenants tn ON tn.tenant = d.tenant
         LEFT JOIN device_state s ON s.tenant = d.tenant AND s.device_id = d.device_id
         WHERE d.tenant = $1 AND d.device_id = $2",
    )
    .bind(tenant)
    .bind(device_id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(row.map(|r| AuthRecord {
        token_hash: r.token_hash,
        token_active: r.token_status == "ACTIVE",
        site_id: r.site_id,
        device_status: parse_device_status(&r.device_status),
        tenant_status: parse_tenant_status(&r.tenant_status),
        tier: RateTier {
            refill_per_sec: r.tier_refill,
            burst: r.tier_burst,
        },
    }))
}

/// Register a device on first contact with a provision token.
///
/// Inserts the registry row, its token hash, and an initial state row.
/// Idempotent: re-running for an existing device leaves it untouched.
pub async fn provision_device(
    pool: &PgPool,
    tenant: &str,
    device_id: &str,
    site_id: &str,
    token_hash: &str,
) -> Result<(), sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    sqlx::query(
        "INSERT INTO devices (tenant, device_id, site_id)
         VALUES ($1, $2, $3)
         ON CONFLICT (tenant, device_id) DO NOTHING",
    )
    .bind(tenant)
    .bind(device_id)
    .bind(site_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "INSERT INTO device_tokens (tenant, device_id, token_hash)
         VALUES ($1, $2, $3)
         ON CONFLICT (tenant, device_id) DO NOTHING",
    )
    .bind(tenant)
    .bind(device_id)
    .bind(token_hash)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "INSERT INTO device_state (tenant, device_id, status)
         VALUES ($1, $2, 'ONLINE')
         ON CONFLICT (tenant, device_id) DO NOTHING",
    )
    .bind(tenant)
    .bind(device_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await
}

/// Merged raw→canonical metric key map for one device.
pub async fn fetch_key_map(
    pool: &PgPool,
    tenant: &str,
    device_id: &str,
) -> Result<HashMap<String, String>, sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT raw_key, canonical_key FROM metric_key_map
         WHERE tenant = $1 AND device_id = $2",
    )
    .bind(tenant)
    .bind(device_id)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(rows.into_iter().collect())
}

/// Device state row used by the evaluator.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeviceStateRow {
    pub device_id: String,
    pub status: String,
    pub last_seen_at: Option<DateTime<Utc>>,
}

pub async fn device_states(
    pool: &PgPool,
    tenant: &str,
) -> Result<Vec<DeviceStateRow>, sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    let rows = sqlx::query_as::<_, DeviceStateRow>(
        "SELECT device_id, status, last_seen_at FROM device_state WHERE tenant = $1",
    )
    .bind(tenant)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(rows)
}

/// Site of each device in a tenant (for rule scoping).
pub async fn device_sites(
    pool: &PgPool,
    tenant: &str,
) -> Result<HashMap<String, String>, sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT device_id, site_id FROM devices WHERE tenant = $1")
            .bind(tenant)
            .fetch_all(&mut *tx)
            .await?;
    tx.commit().await?;
    Ok(rows.into_iter().collect())
}

pub async fn set_device_status(
    pool: &PgPool,
    tenant: &str,
    device_id: &str,
    status: DeviceStatus,
) -> Result<(), sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    sqlx::query(
        "UPDATE device_state SET status = $3
         WHERE tenant = $1 AND device_id = $2",
    )
    .bind(tenant)
    .bind(device_id)
    .bind(status.as_str())
    .execute(&mut *tx)
    .await?;
    tx.commit().await
}
