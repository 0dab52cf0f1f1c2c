//! Dead-letter writes for route deliveries that exhausted retries.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Payload bytes kept in a dead-letter row.
pub const MAX_PAYLOAD_BYTES: usize = 8 * 1024;
/// Error string bytes kept in a dead-letter row.
pub const MAX_ERROR_BYTES: usize = 2 * 1024;

/// Truncate on a char boundary at or below `max` bytes.
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[allow(clippy::too_many_arguments)]
pub async fn insert(
    pool: &PgPool,
    tenant: &str,
    route_id: Uuid,
    topic: &str,
    payload: &str,
    destination_kind: &str,
    destination_config: &serde_json::Value,
    error: &str,
    failed_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    sqlx::query(
        "INSERT INTO dead_letter (tenant, route_id, topic, payload, destination_kind,
                                  destination_config, error, failed_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(tenant)
    .bind(route_id)
    .bind(topic)
    .bind(truncate_utf8(payload, MAX_PAYLOAD_BYTES))
    .bind(destination_kind)
    .bind(destination_config)
    .bind(truncate_utf8(error, MAX_ERROR_BYTES))
    .bind(failed_at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await
}
