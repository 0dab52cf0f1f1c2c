//! Direct HTTP ingest endpoint.
//!
//! `POST /v1/ingest/{tenant}/{device}` runs the same pipeline as the bus
//! path, with the device secret carried as a bearer token. Status codes:
//! 200 accepted, 400 validation, 401 auth, 429 rate limit, 503
//! backpressure. A rejected record never gets a 200.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::post;
use base64::Engine as _;
use chrono::Utc;

use gp_protocol::{Envelope, MsgType, PayloadBody, QuarantineReason, topics};

use crate::pipeline::{IngestOutcome, Pipeline};

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/v1/ingest/{tenant}/{device}", post(ingest))
        .with_state(pipeline)
}

fn bearer_secret(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(String::from)
}

async fn ingest(
    State(pipeline): State<Arc<Pipeline>>,
    Path((tenant, device)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let secret = bearer_secret(&headers);

    let payload = match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(serde_json::Value::Object(map)) => PayloadBody::Object(map),
        _ => PayloadBody::Binary(base64::engine::general_purpose::STANDARD.encode(&body)),
    };
    let envelope = Envelope {
        topic: topics::telemetry(&tenant, &device),
        tenant,
        device,
        msg_type: MsgType::Telemetry,
        received_at: Utc::now(),
        seq: match &payload {
            PayloadBody::Object(map) => map.get("seq").and_then(|v| v.as_i64()),
            PayloadBody::Binary(_) => None,
        },
        payload,
    };

    match pipeline.process(&envelope, secret.as_deref(), false).await {
        Ok(IngestOutcome::Accepted) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({"status": "accepted"})),
        ),
        Ok(IngestOutcome::Rejected(reason)) => {
            let status = match reason {
                QuarantineReason::AuthFailed
                | QuarantineReason::DeviceUnknown
                | QuarantineReason::SubscriptionInactive => StatusCode::UNAUTHORIZED,
                _ => StatusCode::BAD_REQUEST,
            };
            (
                status,
                axum::Json(serde_json::json!({"error": reason.as_str()})),
            )
        }
        Ok(IngestOutcome::RateLimited) => (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(serde_json::json!({"error": "rate_limited"})),
        ),
        Ok(IngestOutcome::Backpressure) => (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(serde_json::json!({"error": "backpressure"})),
        ),
        Err(e) => {
            tracing::error!(error = %e, "http ingest transient failure");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(serde_json::json!({"error": "temporarily_unavailable"})),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthCache;
    use crate::batch::{BatchWriterConfig, spawn_batch_writer};
    use crate::fanout::{RouteTable, spawn_fanout};
    use crate::metrics::IngestMetrics;
    use crate::normalize::KeyMapCache;
    use crate::ratelimit::RateLimiter;
    use crate::sinks::{
        MemoryDevice, MemoryDirectory, MemoryQuarantine, MemoryTelemetry, hash_token,
    };
    use crate::validate::Limits;
    use gp_bus::MockBus;
    use gp_protocol::{DeviceStatus, RateTier, TenantStatus};
    use gp_store::devices::AuthRecord;
    use std::collections::HashMap;
    use std::time::Duration;

    async fn serve_pipeline(tier: RateTier) -> (std::net::SocketAddr, Arc<MemoryTelemetry>) {
        let metrics = IngestMetrics::new();
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert(
            "acme",
            "d1",
            MemoryDevice {
                auth: AuthRecord {
                    token_hash: hash_token("secret"),
                    token_active: true,
                    site_id: "plant-a".into(),
                    device_status: DeviceStatus::Online,
                    tenant_status: TenantStatus::Active,
                    tier,
                },
                key_map: HashMap::new(),
            },
        );
        let sink = Arc::new(MemoryTelemetry::new());
        let quarantine = Arc::new(MemoryQuarantine::new());
        let bus = Arc::new(MockBus::new());

        let (batch, _writer) = spawn_batch_writer(
            Arc::clone(&sink) as _,
            Arc::clone(&quarantine) as _,
            BatchWriterConfig {
                batch_size: 1,
                flush_interval: Duration::from_millis(10),
                ..Default::default()
            },
            metrics.clone(),
        );
        let (fanout, _fw) = spawn_fanout(bus as _, 1, 16, metrics.clone());

        let pipeline = Arc::new(Pipeline {
            auth: AuthCache::new(
                Arc::clone(&directory) as _,
                100,
                Duration::from_secs(60),
                metrics.clone(),
            ),
            limiter: Arc::new(RateLimiter::new()),
            keymap: KeyMapCache::new(directory as _, 100, Duration::from_secs(60), metrics.clone()),
            batch,
            fanout,
            routes: Arc::new(RouteTable::new()),
            quarantine: quarantine as _,
            metrics,
            limits: Limits::default(),
        });

        let app = router(pipeline);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, sink)
    }

    fn body(site: &str) -> serde_json::Value {
        serde_json::json!({
            "ts": Utc::now().timestamp(),
            "site_id": site,
            "metrics": {"temperature": 21.0}
        })
    }

    #[tokio::test]
    async fn accepted_returns_200() {
        let (addr, sink) = serve_pipeline(RateTier::default()).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/v1/ingest/acme/d1"))
            .header("authorization", "Bearer secret")
            .json(&body("plant-a"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        tokio::time::timeout(Duration::from_secs(1), async {
            while sink.records().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn wrong_secret_returns_401() {
        let (addr, _sink) = serve_pipeline(RateTier::default()).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/v1/ingest/acme/d1"))
            .header("authorization", "Bearer wrong")
            .json(&body("plant-a"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
    }

    #[tokio::test]
    async fn unknown_device_returns_401() {
        let (addr, _sink) = serve_pipeline(RateTier::default()).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/v1/ingest/acme/ghost"))
            .json(&body("plant-a"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
    }

    #[tokio::test]
    async fn validation_failure_returns_400() {
        let (addr, _sink) = serve_pipeline(RateTier::default()).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/v1/ingest/acme/d1"))
            .json(&body("wrong-site"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let err: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(err["error"], "site_mismatch");
    }

    #[tokio::test]
    async fn rate_limit_returns_429() {
        let (addr, _sink) = serve_pipeline(RateTier {
            refill_per_sec: 0.0,
            burst: 1.0,
        })
        .await;
        let client = reqwest::Client::new();
        let url = format!("http://{addr}/v1/ingest/acme/d1");

        let first = client.post(&url).json(&body("plant-a")).send().await.unwrap();
        assert_eq!(first.status(), 200);
        let second = client.post(&url).json(&body("plant-a")).send().await.unwrap();
        assert_eq!(second.status(), 429);
    }
}
