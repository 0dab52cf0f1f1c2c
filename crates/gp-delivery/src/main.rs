//! GridPulse route delivery worker — fan-out to external sinks.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use gp_bus::{Bus, BusConfig, JetStreamBus};
use gp_delivery::{
    DeliveryConfig, DeliveryMetrics, Executor, StoreDeadLetters, StoreRouteLookup,
};
use gp_mqtt::{Channel, MqttChannel, MqttConfig};
use gp_observe::Health;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "gp-delivery starting");

    let config = DeliveryConfig::from_env();
    let store_config = gp_store::StoreConfig::from_env();
    let bus_config = BusConfig::from_env();
    let mqtt_config = MqttConfig::from_env("gp-delivery");

    let pool = gp_store::connect(&store_config).await?;
    let bus: Arc<dyn Bus> = Arc::new(JetStreamBus::connect(&bus_config).await?);

    // MQTT channel for republish destinations. The event loop only keeps
    // the connection alive; incoming traffic is not consumed here.
    let (channel, mut eventloop) = MqttChannel::connect(&mqtt_config, false)?;
    let mqtt: Arc<dyn Channel> = Arc::new(channel);
    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                tracing::warn!(error = %e, "mqtt event loop error, reconnecting in 5s");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        }
    });

    let executor = Arc::new(Executor::new(
        config.http_timeout,
        config.retry_after_cap,
        Some(mqtt),
    ));
    let routes = Arc::new(StoreRouteLookup::new(pool.clone()));
    let dead_letters = Arc::new(StoreDeadLetters::new(pool.clone()));

    let metrics = DeliveryMetrics::default();
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

    let worker = tokio::spawn(gp_delivery::run(
        bus,
        executor,
        routes,
        dead_letters,
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
    let _ = worker.await;
    pool.close().await;
    tracing::info!("gp-delivery stopped");
    Ok(())
}
