//! MQTT channel — async client for the device-facing broker.
//!
//! Wraps `rumqttc::AsyncClient` with the manual-ack discipline the bridge
//! relies on: an incoming QoS 1 publish is only acknowledged to the broker
//! after the message is durably on the bus.

use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, Publish, QoS};

use crate::config::MqttConfig;
use crate::error::{MqttError, MqttResult};
use crate::tls;

// ── Channel trait ─────────────────────────────────────────────

/// Abstraction for MQTT publish/subscribe/ack.
///
/// Enables mocking in tests without a real MQTT broker.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Publish a raw payload to a topic.
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()>;

    /// Subscribe to a topic filter.
    async fn subscribe(&self, filter: &str, qos: QoS) -> MqttResult<()>;

    /// Manually acknowledge an incoming publish (manual-ack mode).
    async fn ack(&self, publish: &Publish) -> MqttResult<()>;
}

// ── MqttChannel ───────────────────────────────────────────────

/// MQTT channel connected to the device-facing broker.
///
/// Owns the `AsyncClient`; the `EventLoop` is returned separately from
/// `connect()` and must be driven by the caller in a spawned task.
pub struct MqttChannel {
    client: AsyncClient,
}

impl MqttChannel {
    /// Connect with settings from `config`.
    ///
    /// When `manual_acks` is set, incoming QoS 1 publishes stay unacked
    /// until [`Channel::ack`] is called, so broker redelivery covers any
    /// message lost before it reached the bus.
    pub fn connect(config: &MqttConfig, manual_acks: bool) -> MqttResult<(Self, EventLoop)> {
        let mut options =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(std::time::Duration::from_secs(config.keepalive_secs.into()));
        options.set_manual_acks(manual_acks);

        if config.use_tls {
            let transport = tls::load_tls_transport(config)?;
            options.set_transport(transport);
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        Ok((Self { client }, eventloop))
    }
}

#[async_trait]
impl Channel for MqttChannel {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()> {
        self.client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| MqttError::Publish(e.to_string()))
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> MqttResult<()> {
        self.client
            .subscribe(filter, qos)
            .await
            .map_err(|e| MqttError::Subscribe(e.to_string()))
    }

    async fn ack(&self, publish: &Publish) -> MqttResult<()> {
        self.client
            .ack(publish)
            .await
            .map_err(|e| MqttError::Ack(e.to_string()))
    }
}
