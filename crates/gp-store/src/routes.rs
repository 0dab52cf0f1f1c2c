//! Route table queries.

use sqlx::PgPool;
use uuid::Uuid;

use gp_protocol::{Destination, PayloadFilter, Route};

#[derive(sqlx::FromRow)]
struct RouteRow {
    route_id: Uuid,
    tenant: String,
    topic_filter: String,
    payload_filter: Option<serde_json::Value>,
    destination: serde_json::Value,
    enabled: bool,
}

fn row_to_route(row: RouteRow) -> Option<Route> {
    let destination: Destination = serde_json::from_value(row.destination).ok()?;
    let payload_filter: Option<PayloadFilter> = match row.payload_filter {
        Some(v) => Some(serde_json::from_value(v).ok()?),
        None => None,
    };
    Some(Route {
        route_id: row.route_id,
        tenant: row.tenant,
        topic_filter: row.topic_filter,
        payload_filter,
        destination,
        enabled: row.enabled,
    })
}

/// All enabled routes for a tenant.
pub async fn enabled_routes(pool: &PgPool, tenant: &str) -> Result<Vec<Route>, sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    let rows = sqlx::query_as::<_, RouteRow>(
        "SELECT route_id, tenant, topic_filter, payload_filter, destination, enabled
         FROM routes WHERE tenant = $1 AND enabled",
    )
    .bind(tenant)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(rows.into_iter().filter_map(row_to_route).collect())
}

/// One route by id (delivery-side lookup).
pub async fn fetch_route(
    pool: &PgPool,
    tenant: &str,
    route_id: Uuid,
) -> Result<Option<Route>, sqlx::Error> {
    let mut tx = crate::tenant_tx(pool, tenant).await?;
    let row = sqlx::query_as::<_, RouteRow>(
        "SELECT route_id, tenant, topic_filter, payload_filter, destination, enabled
         FROM routes WHERE tenant = $1 AND route_id = $2",
    )
    .bind(tenant)
    .bind(route_id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(row.and_then(row_to_route))
}

pub async fn upsert_route(pool: &PgPool, route: &Route) -> Result<(), sqlx::Error> {
    let destination =
        serde_json::to_value(&route.destination).map_err(|e| sqlx::Error::Encode(e.into()))?;
    let payload_filter = route
        .payload_filter
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| sqlx::Error::Encode(e.into()))?;
    let mut tx = crate::tenant_tx(pool, &route.tenant).await?;
    sqlx::query(
        "INSERT INTO routes (route_id, tenant, topic_filter, payload_filter, destination, enabled)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (route_id) DO UPDATE SET
             topic_filter = EXCLUDED.topic_filter,
             payload_filter = EXCLUDED.payload_filter,
             destination = EXCLUDED.destination,
             enabled = EXCLUDED.enabled",
    )
    .bind(route.route_id)
    .bind(&route.tenant)
    .bind(&route.topic_filter)
    .bind(payload_filter)
    .bind(destination)
    .bind(route.enabled)
    .execute(&mut *tx)
    .await?;
    tx.commit().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_parses_webhook_destination() {
        let row = RouteRow {
            route_id: Uuid::nil(),
            tenant: "acme".into(),
            topic_filter: "tenant/acme/device/+/telemetry".into(),
            payload_filter: None,
            destination: serde_json::json!({"kind": "webhook", "url": "https://example.test/hook"}),
            enabled: true,
        };
        let route = row_to_route(row).unwrap();
        assert!(matches!(route.destination, Destination::Webhook { .. }));
    }

    #[test]
    fn bad_destination_is_skipped() {
        let row = RouteRow {
            route_id: Uuid::nil(),
            tenant: "acme".into(),
            topic_filter: "#".into(),
            payload_filter: None,
            destination: serde_json::json!({"kind": "carrier_pigeon"}),
            enabled: true,
        };
        assert!(row_to_route(row).is_none());
    }
}
