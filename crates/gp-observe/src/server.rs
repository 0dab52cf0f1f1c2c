//! Health and metrics HTTP server.
//!
//! Every process mounts the same two endpoints:
//! - `GET /health` — 200 with per-component liveness JSON
//! - `GET /metrics` — Prometheus text exposition

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::net::TcpListener;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Component liveness flags shared with the worker tasks that own them.
#[derive(Clone, Default)]
pub struct Health {
    components: Arc<std::sync::Mutex<Vec<(&'static str, Arc<AtomicBool>)>>>,
}

impl Health {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component; the returned flag starts live.
    pub fn component(&self, name: &'static str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(true));
        self.components
            .lock()
            .unwrap()
            .push((name, Arc::clone(&flag)));
        flag
    }

    fn snapshot(&self) -> (bool, serde_json::Value) {
        let components = self.components.lock().unwrap();
        let mut all_live = true;
        let mut map = serde_json::Map::new();
        for (name, flag) in components.iter() {
            let live = flag.load(Ordering::Relaxed);
            all_live &= live;
            map.insert((*name).to_string(), serde_json::Value::Bool(live));
        }
        (all_live, serde_json::Value::Object(map))
    }
}

/// Metrics rendering callback handed in by each process.
pub type RenderFn = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Clone)]
struct ServerState {
    health: Health,
    render: RenderFn,
}

async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let (all_live, components) = state.health.snapshot();
    let body = serde_json::json!({
        "status": if all_live { "ok" } else { "degraded" },
        "components": components,
    });
    (StatusCode::OK, axum::Json(body))
}

async fn metrics_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let body = (state.render)();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        body,
    )
}

/// Build the observability router; exposed separately so a process can
/// merge its own routes (the ingestor adds its HTTP ingest endpoint).
pub fn router(health: Health, render: RenderFn) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(ServerState { health, render })
}

/// Serve `/health` and `/metrics` on `addr` until the process exits.
pub async fn serve(addr: String, health: Health, render: RenderFn) -> std::io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "observability server listening");
    axum::serve(listener, router(health, render)).await
}
