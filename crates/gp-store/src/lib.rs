//! PostgreSQL/TimescaleDB access layer.
//!
//! Each sub-module provides typed query functions over a `PgPool`. Every
//! tenant-scoped interaction goes through [`tenant_tx`], which sets the
//! `app.tenant_id` session variable so row-level security enforces
//! isolation underneath the explicit `tenant = $1` predicates.

pub mod alerts;
pub mod dead_letter;
pub mod devices;
pub mod escalation;
pub mod quarantine;
pub mod routes;
pub mod rules;
pub mod telemetry;
pub mod tenants;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

/// Pool settings, loadable from environment variables.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Connection string (DATABASE_URL).
    pub dsn: String,
    /// Minimum pool size (PG_POOL_MIN, default 2).
    pub pool_min: u32,
    /// Maximum pool size (PG_POOL_MAX, default 10).
    pub pool_max: u32,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let env_u32 = |key: &str, default: u32| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        Self {
            dsn: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/gridpulse".to_string()),
            pool_min: env_u32("PG_POOL_MIN", 2),
            pool_max: env_u32("PG_POOL_MAX", 10),
        }
    }
}

/// Connect to PostgreSQL, apply the schema, and return the pool.
///
/// Acquire is capped at 3 s and every session gets a 10 s statement
/// timeout, so a stuck query cannot wedge a worker.
pub async fn connect(config: &StoreConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .min_connections(config.pool_min)
        .max_connections(config.pool_max)
        .acquire_timeout(Duration::from_secs(3))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("SET statement_timeout = '10s'")
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(&config.dsn)
        .await?;

    tracing::info!("applying database schema");
    sqlx::raw_sql(include_str!("../schema.sql"))
        .execute(&pool)
        .await?;
    tracing::info!("schema applied");

    Ok(pool)
}

/// Begin a transaction scoped to one tenant.
///
/// Sets `app.tenant_id` with `set_config(..., true)` so the variable is
/// transaction-local; RLS policies match it against each row's tenant.
pub async fn tenant_tx<'p>(
    pool: &'p PgPool,
    tenant: &str,
) -> Result<Transaction<'p, Postgres>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT set_config('app.tenant_id', $1, true)")
        .bind(tenant)
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

/// Derive a stable 64-bit advisory-lock key from a scope string.
pub fn lock_key(scope: &str) -> i64 {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(scope.as_bytes());
    i64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// A held session-level advisory lock.
///
/// The lock lives on a detached connection; dropping the guard closes
/// that connection, which releases the lock server-side. Prefer calling
/// [`AdvisoryLock::release`] so the unlock is explicit and awaited.
pub struct AdvisoryLock {
    conn: Option<sqlx::postgres::PgConnection>,
    scope: String,
}

impl AdvisoryLock {
    /// Try to acquire the lock for `scope`. Returns `None` when another
    /// session already holds it.
    pub async fn try_acquire(pool: &PgPool, scope: &str) -> Result<Option<Self>, sqlx::Error> {
        let mut conn = pool.acquire().await?.detach();
        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .bind(lock_key(scope))
            .fetch_one(&mut conn)
            .await?;
        if locked {
            Ok(Some(Self {
                conn: Some(conn),
                scope: scope.to_string(),
            }))
        } else {
            Ok(None)
        }
    }

    pub async fn release(mut self) -> Result<(), sqlx::Error> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(lock_key(&self.scope))
                .execute(&mut conn)
                .await?;
            use sqlx::Connection;
            conn.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_stable_and_scoped() {
        assert_eq!(lock_key("evaluator:acme"), lock_key("evaluator:acme"));
        assert_ne!(lock_key("evaluator:acme"), lock_key("evaluator:other"));
        assert_ne!(lock_key("evaluator:acme"), lock_key("orchestrator:acme"));
    }

    #[test]
    fn config_defaults() {
        // Only checks the parse fallbacks; DATABASE_URL may be set in CI.
        let config = StoreConfig {
            dsn: "postgres://localhost/gridpulse".into(),
            pool_min: 2,
            pool_max: 10,
        };
        assert!(config.pool_min <= config.pool_max);
    }
}
