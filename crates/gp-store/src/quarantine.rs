//! Quarantine writes for rejected ingest records.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use gp_protocol::QuarantineReason;

/// Persist one rejected record for forensics.
pub async fn insert(
    pool: &PgPool,
    tenant: &str,
    device_id: Option<&str>,
    reason: QuarantineReason,
    raw_payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    sqlx::query(
        "INSERT INTO quarantine (tenant, device_id, reason, raw_payload, received_at)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(tenant)
    .bind(device_id)
    .bind(reason.as_str())
    .bind(raw_payload)
    .bind(received_at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await
}
