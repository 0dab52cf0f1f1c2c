//! GridPulse bus bridge — device broker to durable bus.
//!
//! Subscribes to the MQTT device topic space and republishes each message
//! as an envelope on the internal bus with durable acknowledgement.

use std::sync::Arc;

use rumqttc::QoS;
use tracing_subscriber::EnvFilter;

use gp_bus::{BusConfig, JetStreamBus};
use gp_mqtt::{Channel, MqttChannel, MqttConfig};
use gp_observe::{Health, write_gauge, write_labeled_counter};
use gp_protocol::topics;

use gp_bridge::bridge;
use gp_bridge::{BridgeConfig, BridgeMetrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "gp-bridge starting");

    let config = BridgeConfig::from_env();
    let mqtt_config = MqttConfig::from_env("gp-bridge");
    let bus_config = BusConfig::from_env();

    let bus = Arc::new(JetStreamBus::connect(&bus_config).await?);

    // Manual acks: a QoS 1 publish is only acked after the bus confirms.
    let (channel, eventloop) = MqttChannel::connect(&mqtt_config, true)?;
    let channel: Arc<dyn Channel> = Arc::new(channel);
    channel.subscribe(&topics::all_devices(), QoS::AtLeastOnce).await?;
    tracing::info!("subscribed to device topic space");

    let metrics = BridgeMetrics::default();
    let health = Health::new();
    let _mqtt_live = health.component("mqtt");
    let _bus_live = health.component("bus");

    let render_metrics = metrics.clone();
    let observe = tokio::spawn(gp_observe::serve(
        config.http_listen_addr.clone(),
        health,
        Arc::new(move || {
            let mut buf = String::with_capacity(1024);
            write_labeled_counter(
                &mut buf,
                "gp_bridge_messages_total",
                "Device messages seen by the bridge.",
                "result",
                &render_metrics.messages_total,
            );
            write_gauge(
                &mut buf,
                "gp_bridge_queue_depth",
                "Bus publishes currently in flight.",
                &render_metrics.queue_depth,
            );
            buf
        }),
    ));

    tokio::select! {
        () = bridge::run(eventloop, channel, bus, metrics, config.max_in_flight) => {
            tracing::error!("bridge loop exited unexpectedly");
        }
        result = observe => {
            tracing::error!(?result, "observability server exited unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    tracing::info!("gp-bridge stopped");
    Ok(())
}
