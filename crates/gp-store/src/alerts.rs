//! Alert persistence and lifecycle queries.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use gp_protocol::{Alert, AlertStatus, AlertType, Severity};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AlertRow {
    pub alert_id: Uuid,
    pub tenant: String,
    pub device_id: String,
    pub rule_id: Option<Uuid>,
    pub alert_type: String,
    pub severity: String,
    pub status: String,
    pub fingerprint: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub escalation_level: i32,
    pub next_escalation_at: Option<DateTime<Utc>>,
}

pub fn parse_severity(s: &str) -> Severity {
    match s {
        "critical" => Severity::Critical,
        "warning" => Severity::Warning,
        _ => Severity::Info,
    }
}

pub fn severity_str(s: Severity) -> &'static str {
    match s {
        Severity::Critical => "critical",
        Severity::Warning => "warning",
        Severity::Info => "info",
    }
}

impl AlertRow {
    pub fn into_alert(self) -> Alert {
        Alert {
            alert_id: self.alert_id,
            tenant: self.tenant,
            device_id: self.device_id,
            rule_id: self.rule_id,
            alert_type: if self.alert_type == "no_heartbeat" {
                AlertType::NoHeartbeat
            } else {
                AlertType::Rule
            },
            severity: parse_severity(&self.severity),
            status: match self.status.as_str() {
                "OPEN" => AlertStatus::Open,
                "ACK" => AlertStatus::Ack,
                _ => AlertStatus::Closed,
            },
            fingerprint: self.fingerprint,
            summary: self.summary,
            created_at: self.created_at,
            acknowledged_at: self.acknowledged_at,
            closed_at: self.closed_at,
            escalation_level: self.escalation_level,
            next_escalation_at: self.next_escalation_at,
        }
    }
}

/// The OPEN alert for a fingerprint, if one exists. The partial unique
/// index guarantees at most one.
pub async fn find_open(
    pool: &PgPool,
    tenant: &str,
    fingerprint: &str,
) -> Result<Option<AlertRow>, sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    let row = sqlx::query_as::<_, AlertRow>(
        "SELECT * FROM alerts
         WHERE tenant = $1 AND fingerprint = $2 AND status = 'OPEN'",
    )
    .bind(tenant)
    .bind(fingerprint)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(row)
}

/// Open a new alert. `next_escalation_at = created_at` so the orchestrator
/// picks it up on its next tick (level 0 fires with no delay).
#[allow(clippy::too_many_arguments)]
pub async fn insert_open(
    pool: &PgPool,
    tenant: &str,
    device_id: &str,
    rule_id: Option<Uuid>,
    alert_type: AlertType,
    severity: Severity,
    fingerprint: &str,
    summary: &str,
    now: DateTime<Utc>,
) -> Result<Uuid, sqlx::Error> {
    let alert_id = Uuid::now_v7();
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    sqlx::query(
        "INSERT INTO alerts (alert_id, tenant, device_id, rule_id, alert_type, severity,
                             status, fingerprint, summary, created_at, updated_at,
                             escalation_level, next_escalation_at)
         VALUES ($1, $2, $3, $4, $5, $6, 'OPEN', $7, $8, $9, $9, -1, $9)",
    )
    .bind(alert_id)
    .bind(tenant)
    .bind(device_id)
    .bind(rule_id)
    .bind(match alert_type {
        AlertType::Rule => "rule",
        AlertType::NoHeartbeat => "no_heartbeat",
    })
    .bind(severity_str(severity))
    .bind(fingerprint)
    .bind(summary)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(alert_id)
}

/// Refresh an already-open alert: bump `updated_at`, raise severity if the
/// rule now reports a higher one (never lowered while open).
pub async fn touch_open(
    pool: &PgPool,
    tenant: &str,
    alert_id: Uuid,
    severity: Severity,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    sqlx::query(
        "UPDATE alerts SET updated_at = $3,
             severity = CASE
                 WHEN $4 = 'critical' THEN 'critical'
                 WHEN $4 = 'warning' AND severity = 'info' THEN 'warning'
                 ELSE severity
             END
         WHERE tenant = $1 AND alert_id = $2 AND status = 'OPEN'",
    )
    .bind(tenant)
    .bind(alert_id)
    .bind(now)
    .bind(severity_str(severity))
    .execute(&mut *tx)
    .await?;
    tx.commit().await
}

/// Close the OPEN alert with this exact fingerprint. Returns whether a row
/// transitioned.
pub async fn close_open(
    pool: &PgPool,
    tenant: &str,
    fingerprint: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    let result = sqlx::query(
        "UPDATE alerts SET status = 'CLOSED', closed_at = $3, updated_at = $3,
                           next_escalation_at = NULL
         WHERE tenant = $1 AND fingerprint = $2 AND status = 'OPEN'",
    )
    .bind(tenant)
    .bind(fingerprint)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

/// OPEN alerts whose escalation timer has expired, across all tenants.
pub async fn due_escalations(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<AlertRow>, sqlx::Error> {
    sqlx::query_as::<_, AlertRow>(
        "SELECT * FROM alerts
         WHERE status = 'OPEN' AND next_escalation_at IS NOT NULL
           AND next_escalation_at <= $1
         ORDER BY next_escalation_at ASC
         LIMIT $2",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Record an escalation advance: the new level plus when the next one fires
/// (`None` when the policy is exhausted).
pub async fn set_escalation(
    pool: &PgPool,
    tenant: &str,
    alert_id: Uuid,
    level: i32,
    next_at: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    sqlx::query(
        "UPDATE alerts SET escalation_level = $3, next_escalation_at = $4
         WHERE tenant = $1 AND alert_id = $2 AND status = 'OPEN'",
    )
    .bind(tenant)
    .bind(alert_id)
    .bind(level)
    .bind(next_at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await
}
