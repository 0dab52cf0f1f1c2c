//! Tenant and per-tenant settings queries.

use sqlx::PgPool;

/// Evaluator thresholds, overridable per tenant.
#[derive(Debug, Clone, Copy)]
pub struct TenantSettings {
    pub heartbeat_stale_seconds: i64,
    pub heartbeat_offline_seconds: i64,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            heartbeat_stale_seconds: 120,
            heartbeat_offline_seconds: 300,
        }
    }
}

/// Identifiers of all ACTIVE tenants.
pub async fn active_tenants(pool: &PgPool) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT tenant FROM tenants WHERE status = 'ACTIVE' ORDER BY tenant")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(t,)| t).collect())
}

/// Settings for one tenant, falling back to defaults when unset.
pub async fn settings(pool: &PgPool, tenant: &str) -> Result<TenantSettings, sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    let row: Option<(i64, i64)> = sqlx::query_as(
        "SELECT heartbeat_stale_seconds, heartbeat_offline_seconds
         FROM tenant_settings WHERE tenant = $1",
    )
    .bind(tenant)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(row
        .map(|(stale, offline)| TenantSettings {
            heartbeat_stale_seconds: stale,
            heartbeat_offline_seconds: offline,
        })
        .unwrap_or_default())
}

/// Audit an operator-privileged access before it runs. Operator sessions
/// bypass RLS, so the audit row is the only trace.
pub async fn audit_operator(
    pool: &PgPool,
    operator: &str,
    action: &str,
    tenant: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO operator_audit (operator, action, tenant) VALUES ($1, $2, $3)")
        .bind(operator)
        .bind(action)
        .bind(tenant)
        .execute(pool)
        .await?;
    Ok(())
}
