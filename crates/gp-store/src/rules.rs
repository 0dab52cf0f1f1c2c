//! Alert rule queries.

use sqlx::PgPool;
use uuid::Uuid;

use gp_protocol::{AlertRule, DeviceScope, RuleMode, Severity};

use crate::alerts::parse_severity;

#[derive(sqlx::FromRow)]
struct RuleRow {
    rule_id: Uuid,
    tenant: String,
    severity: String,
    enabled: bool,
    duration_seconds: i64,
    device_scope: serde_json::Value,
    config: serde_json::Value,
    escalation_policy_id: Option<Uuid>,
}

fn row_to_rule(row: RuleRow) -> Option<AlertRule> {
    let device_scope: DeviceScope = serde_json::from_value(row.device_scope).ok()?;
    let mode: RuleMode = serde_json::from_value(row.config).ok()?;
    Some(AlertRule {
        rule_id: row.rule_id,
        tenant: row.tenant,
        severity: parse_severity(&row.severity),
        enabled: row.enabled,
        device_scope,
        duration_seconds: row.duration_seconds.max(0) as u32,
        mode,
        escalation_policy_id: row.escalation_policy_id,
    })
}

/// All enabled rules for a tenant. Rows with unparseable config are
/// skipped with a warning rather than failing the whole evaluation pass.
pub async fn enabled_rules(pool: &PgPool, tenant: &str) -> Result<Vec<AlertRule>, sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    let rows = sqlx::query_as::<_, RuleRow>(
        "SELECT rule_id, tenant, severity, enabled, duration_seconds,
                device_scope, config, escalation_policy_id
         FROM alert_rules
         WHERE tenant = $1 AND enabled",
    )
    .bind(tenant)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let rule_id = row.rule_id;
            let rule = row_to_rule(row);
            if rule.is_none() {
                tracing::warn!(rule_id = %rule_id, "skipping rule with invalid config");
            }
            rule
        })
        .collect())
}

/// The escalation policy a rule points at, if any.
pub async fn escalation_policy_id(
    pool: &PgPool,
    tenant: &str,
    rule_id: Uuid,
) -> Result<Option<Uuid>, sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    let row: Option<(Option<Uuid>,)> = sqlx::query_as(
        "SELECT escalation_policy_id FROM alert_rules WHERE tenant = $1 AND rule_id = $2",
    )
    .bind(tenant)
    .bind(rule_id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(row.and_then(|(id,)| id))
}

/// Insert or replace a rule (used by provisioning paths and tests).
pub async fn upsert_rule(pool: &PgPool, rule: &AlertRule) -> Result<(), sqlx::Error> {
    let config = serde_json::to_value(&rule.mode).map_err(|e| sqlx::Error::Encode(e.into()))?;
    let scope =
        serde_json::to_value(&rule.device_scope).map_err(|e| sqlx::Error::Encode(e.into()))?;
    let mut tx = crate::tenant_tx(pool, &rule.tenant).await?;
    sqlx::query(
        "INSERT INTO alert_rules (rule_id, tenant, severity, enabled, duration_seconds,
                                  device_scope, config, escalation_policy_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         ON CONFLICT (rule_id) DO UPDATE SET
             severity = EXCLUDED.severity,
             enabled = EXCLUDED.enabled,
             duration_seconds = EXCLUDED.duration_seconds,
             device_scope = EXCLUDED.device_scope,
             config = EXCLUDED.config,
             escalation_policy_id = EXCLUDED.escalation_policy_id",
    )
    .bind(rule.rule_id)
    .bind(&rule.tenant)
    .bind(crate::alerts::severity_str(rule.severity))
    .bind(rule.enabled)
    .bind(i64::from(rule.duration_seconds))
    .bind(scope)
    .bind(config)
    .bind(rule.escalation_policy_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await
}
