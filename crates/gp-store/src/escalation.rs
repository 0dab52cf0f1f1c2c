//! Escalation policy, on-call schedule, and notification handoff queries.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use gp_protocol::{EscalationLevel, EscalationPolicy, NotificationJob, OncallSchedule, Rotation};

pub async fn fetch_policy(
    pool: &PgPool,
    tenant: &str,
    policy_id: Uuid,
) -> Result<Option<EscalationPolicy>, sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    let row: Option<(serde_json::Value,)> = sqlx::query_as(
        "SELECT levels FROM escalation_policies WHERE tenant = $1 AND policy_id = $2",
    )
    .bind(tenant)
    .bind(policy_id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(row.and_then(|(levels,)| {
        let levels: Vec<EscalationLevel> = serde_json::from_value(levels).ok()?;
        Some(EscalationPolicy {
            policy_id,
            tenant: tenant.to_string(),
            levels,
        })
    }))
}

pub async fn upsert_policy(pool: &PgPool, policy: &EscalationPolicy) -> Result<(), sqlx::Error> {
    let levels =
        serde_json::to_value(&policy.levels).map_err(|e| sqlx::Error::Encode(e.into()))?;
    let mut tx = crate::tenant_tx(pool, &policy.tenant).await?;
    sqlx::query(
        "INSERT INTO escalation_policies (policy_id, tenant, levels)
         VALUES ($1, $2, $3)
         ON CONFLICT (policy_id) DO UPDATE SET levels = EXCLUDED.levels",
    )
    .bind(policy.policy_id)
    .bind(&policy.tenant)
    .bind(levels)
    .execute(&mut *tx)
    .await?;
    tx.commit().await
}

pub async fn fetch_schedule(
    pool: &PgPool,
    tenant: &str,
    schedule_id: Uuid,
) -> Result<Option<OncallSchedule>, sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    let row: Option<(serde_json::Value,)> = sqlx::query_as(
        "SELECT rotations FROM oncall_schedules WHERE tenant = $1 AND schedule_id = $2",
    )
    .bind(tenant)
    .bind(schedule_id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(row.and_then(|(rotations,)| {
        let rotations: Vec<Rotation> = serde_json::from_value(rotations).ok()?;
        Some(OncallSchedule {
            schedule_id,
            tenant: tenant.to_string(),
            rotations,
        })
    }))
}

pub async fn upsert_schedule(pool: &PgPool, schedule: &OncallSchedule) -> Result<(), sqlx::Error> {
    let rotations =
        serde_json::to_value(&schedule.rotations).map_err(|e| sqlx::Error::Encode(e.into()))?;
    let mut tx = crate::tenant_tx(pool, &schedule.tenant).await?;
    sqlx::query(
        "INSERT INTO oncall_schedules (schedule_id, tenant, rotations)
         VALUES ($1, $2, $3)
         ON CONFLICT (schedule_id) DO UPDATE SET rotations = EXCLUDED.rotations",
    )
    .bind(schedule.schedule_id)
    .bind(&schedule.tenant)
    .bind(rotations)
    .execute(&mut *tx)
    .await?;
    tx.commit().await
}

/// Record a notification handoff keyed by `(alert_id, escalation_level)`.
///
/// Returns `false` when the job was already recorded, which makes re-ticks
/// after a crash produce-at-least-once without double-notifying within one
/// storage epoch.
pub async fn record_notification(
    pool: &PgPool,
    job: &NotificationJob,
    produced_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let payload = serde_json::to_value(job).map_err(|e| sqlx::Error::Encode(e.into()))?;
    let mut tx = crate::tenant_tx(pool, &job.tenant).await?;
    let result = sqlx::query(
        "INSERT INTO notification_jobs (alert_id, escalation_level, tenant, payload, produced_at)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (alert_id, escalation_level) DO NOTHING",
    )
    .bind(job.alert_id)
    .bind(job.escalation_level)
    .bind(&job.tenant)
    .bind(payload)
    .bind(produced_at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}
