//! Telemetry hypertable writes and reads.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, QueryBuilder};

use gp_protocol::{MetricValue, TelemetryRecord};

/// Insert a batch of records for one tenant in a single transaction and
/// advance each device's `last_seen_at` high-water mark.
///
/// The multi-row insert is one statement; records may commit out of
/// received order across batches, the `time` column is authoritative.
pub async fn insert_batch(
    pool: &PgPool,
    tenant: &str,
    records: &[TelemetryRecord],
) -> Result<(), sqlx::Error> {
    if records.is_empty() {
        return Ok(());
    }

    let mut tx = crate::tenant_tx(pool, tenant).await?;

    let mut builder: QueryBuilder<sqlx::Postgres> =
        QueryBuilder::new("INSERT INTO telemetry (tenant, device_id, site_id, time, seq, metrics) ");
    builder.push_values(records, |mut b, rec| {
        b.push_bind(&rec.tenant)
            .push_bind(&rec.device_id)
            .push_bind(&rec.site_id)
            .push_bind(rec.time)
            .push_bind(rec.seq)
            .push_bind(serde_json::to_value(&rec.metrics).unwrap_or_default());
    });
    builder.build().execute(&mut *tx).await?;

    // Conditional last-seen update: only ever moves forward.
    let mut latest: std::collections::HashMap<&str, DateTime<Utc>> = std::collections::HashMap::new();
    for rec in records {
        let entry = latest.entry(rec.device_id.as_str()).or_insert(rec.time);
        if rec.time > *entry {
            *entry = rec.time;
        }
    }
    for (device_id, seen_at) in latest {
        sqlx::query(
            "INSERT INTO device_state (tenant, device_id, status, last_seen_at)
             VALUES ($1, $2, 'ONLINE', $3)
             ON CONFLICT (tenant, device_id) DO UPDATE
             SET last_seen_at = GREATEST(device_state.last_seen_at, EXCLUDED.last_seen_at)",
        )
        .bind(tenant)
        .bind(device_id)
        .bind(seen_at)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}

/// One reading of a single metric.
#[derive(Debug, Clone)]
pub struct Reading {
    pub time: DateTime<Utc>,
    pub value: MetricValue,
}

/// Readings of `metric` for a device since `since`, oldest first.
pub async fn readings_since(
    pool: &PgPool,
    tenant: &str,
    device_id: &str,
    metric: &str,
    since: DateTime<Utc>,
) -> Result<Vec<Reading>, sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    let rows: Vec<(DateTime<Utc>, serde_json::Value)> = sqlx::query_as(
        "SELECT time, metrics -> $4 FROM telemetry
         WHERE tenant = $1 AND device_id = $2 AND time >= $3 AND metrics ? $4
         ORDER BY time ASC",
    )
    .bind(tenant)
    .bind(device_id)
    .bind(since)
    .bind(metric)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(rows
        .into_iter()
        .filter_map(|(time, value)| {
            serde_json::from_value::<MetricValue>(value)
                .ok()
                .map(|value| Reading { time, value })
        })
        .collect())
}

/// The most recent reading of `metric` for a device, if any.
pub async fn latest_reading(
    pool: &PgPool,
    tenant: &str,
    device_id: &str,
    metric: &str,
) -> Result<Option<Reading>, sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    let row: Option<(DateTime<Utc>, serde_json::Value)> = sqlx::query_as(
        "SELECT time, metrics -> $3 FROM telemetry
         WHERE tenant = $1 AND device_id = $2 AND metrics ? $3
         ORDER BY time DESC LIMIT 1",
    )
    .bind(tenant)
    .bind(device_id)
    .bind(metric)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(row.and_then(|(time, value)| {
        serde_json::from_value::<MetricValue>(value)
            .ok()
            .map(|value| Reading { time, value })
    }))
}

/// Devices with at least one reading since `since` (used by the evaluator
/// to restrict rule evaluation to recently active devices).
pub async fn active_devices_since(
    pool: &PgPool,
    tenant: &str,
    since: DateTime<Utc>,
) -> Result<Vec<String>, sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT device_id FROM telemetry
         WHERE tenant = $1 AND time >= $2",
    )
    .bind(tenant)
    .bind(since)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(rows.into_iter().map(|(d,)| d).collect())
}
