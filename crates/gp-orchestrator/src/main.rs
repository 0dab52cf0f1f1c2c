//! GridPulse alert orchestrator — escalation and notification handoff.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use gp_bus::{Bus, BusConfig, JetStreamBus};
use gp_observe::Health;
use gp_orchestrator::{BusNotificationSink, NotificationSink, OrchestratorConfig, OrchestratorMetrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "gp-orchestrator starting");

    let config = OrchestratorConfig::from_env();
    let store_config = gp_store::StoreConfig::from_env();
    let bus_config = BusConfig::from_env();

    let pool = gp_store::connect(&store_config).await?;
    let bus: Arc<dyn Bus> = Arc::new(JetStreamBus::connect(&bus_config).await?);
    let sink: Arc<dyn NotificationSink> = Arc::new(BusNotificationSink::new(bus));

    let metrics = OrchestratorMetrics::default();
    let cancel = CancellationToken::new();

    let health = Health::new();
    let _db_live = health.component("db");
    let _bus_live = health.component("bus");
    let render_metrics = metrics.clone();
    let observe = tokio::spawn(gp_observe::serve(
        config.http_listen_addr.clone(),
        health,
        Arc::new(move || render_metrics.render()),
    ));

    let ticker = tokio::spawn(gp_orchestrator::run(
        pool.clone(),
        sink,
        config,
        metrics,
        cancel.clone(),
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        result = observe => {
            tracing::error!(?result, "observability server exited unexpectedly");
        }
    }

    cancel.cancel();
    let _ = ticker.await;
    pool.close().await;
    tracing::info!("gp-orchestrator stopped");
    Ok(())
}
