//! MQTT → bus bridge loop.
//!
//! Subscribes to the device topic space, wraps each publish in an
//! [`Envelope`], and publishes it to the tenant's stream subject with a
//! durable ack. The MQTT publish is only acknowledged to the broker after
//! the bus confirms, so a failed bus publish leaves the message for broker
//! redelivery.

use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Utc};
use rumqttc::{Event, EventLoop, Packet, Publish};
use tokio::sync::Semaphore;

use gp_bus::Bus;
use gp_mqtt::Channel;
use gp_observe::{Gauge, LabeledCounter};
use gp_protocol::{Envelope, PayloadBody, StreamKind, topics};

/// Bridge counters, rendered by the metrics endpoint.
#[derive(Clone, Default)]
pub struct BridgeMetrics {
    /// result = forwarded | publish_failed | ignored
    pub messages_total: LabeledCounter,
    pub queue_depth: Gauge,
}

/// Build the bus envelope for one MQTT publish.
///
/// JSON object payloads are embedded as-is; anything else is carried as
/// base64 binary. A `seq` field on an object payload is lifted into the
/// envelope for per-device ordering diagnostics.
pub fn build_envelope(topic: &str, payload: &[u8], received_at: DateTime<Utc>) -> Option<Envelope> {
    let parsed = topics::parse_topic(topic)?;

    let body = match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(serde_json::Value::Object(map)) => PayloadBody::Object(map),
        _ => PayloadBody::Binary(base64::engine::general_purpose::STANDARD.encode(payload)),
    };
    let seq = match &body {
        PayloadBody::Object(map) => map.get("seq").and_then(|v| v.as_i64()),
        PayloadBody::Binary(_) => None,
    };

    Some(Envelope {
        tenant: parsed.tenant,
        device: parsed.device,
        msg_type: parsed.msg_type,
        topic: topic.to_string(),
        received_at,
        payload: body,
        seq,
    })
}

/// Forward one incoming publish to the bus, acking the broker only after
/// the bus confirmed durability.
pub async fn handle_publish(
    publish: &Publish,
    channel: &dyn Channel,
    bus: &dyn Bus,
    metrics: &BridgeMetrics,
) {
    let Some(envelope) = build_envelope(&publish.topic, &publish.payload, Utc::now()) else {
        tracing::debug!(topic = %publish.topic, "ignoring message on unknown topic");
        metrics.messages_total.inc("ignored");
        // Nothing downstream will ever want this; drop it at the broker.
        let _ = channel.ack(publish).await;
        return;
    };

    let subject = StreamKind::from(envelope.msg_type).subject(&envelope.tenant);
    let bytes = match envelope.to_bytes() {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize envelope");
            metrics.messages_total.inc("ignored");
            let _ = channel.ack(publish).await;
            return;
        }
    };

    match bus.publish_acked(&subject, &bytes).await {
        Ok(()) => {
            metrics.messages_total.inc("forwarded");
            if let Err(e) = channel.ack(publish).await {
                tracing::warn!(error = %e, "failed to ack broker after bus publish");
            }
        }
        Err(e) => {
            // Leave the MQTT message unacked; the broker redelivers.
            metrics.messages_total.inc("publish_failed");
            tracing::error!(
                error = %e,
                tenant = %envelope.tenant,
                device = %envelope.device,
                "bus publish failed, leaving message for broker redelivery"
            );
        }
    }
}

/// Drive the MQTT event loop, forwarding publishes with bounded in-flight
/// concurrency. Runs until the task is cancelled.
pub async fn run(
    mut eventloop: EventLoop,
    channel: Arc<dyn Channel>,
    bus: Arc<dyn Bus>,
    metrics: BridgeMetrics,
    max_in_flight: usize,
) {
    let in_flight = Arc::new(Semaphore::new(max_in_flight));
    tracing::info!(max_in_flight, "bridge started");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let permit = Arc::clone(&in_flight)
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                let channel = Arc::clone(&channel);
                let bus = Arc::clone(&bus);
                let metrics = metrics.clone();
                metrics.queue_depth.inc();
                tokio::spawn(async move {
                    handle_publish(&publish, channel.as_ref(), bus.as_ref(), &metrics).await;
                    metrics.queue_depth.dec();
                    drop(permit);
                });
            }
            Ok(_) => {} // ConnAck, SubAck, PingResp, etc.
            Err(e) => {
                tracing::error!(error = %e, "mqtt event loop error, reconnecting in 5s");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gp_bus::MockBus;
    use gp_mqtt::MockChannel;
    use gp_protocol::MsgType;
    use rumqttc::QoS;

    fn telemetry_publish(payload: &[u8]) -> Publish {
        Publish::new(
            "tenant/acme/device/sensor-17/telemetry",
            QoS::AtLeastOnce,
            payload.to_vec(),
        )
    }

    #[test]
    fn envelope_from_json_payload() {
        let payload = br#"{"ts": 1700000000, "site_id": "plant-a", "seq": 9, "metrics": {}}"#;
        let env = build_envelope(
            "tenant/acme/device/sensor-17/telemetry",
            payload,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(env.tenant, "acme");
        assert_eq!(env.device, "sensor-17");
        assert_eq!(env.msg_type, MsgType::Telemetry);
        assert_eq!(env.seq, Some(9));
        assert!(matches!(env.payload, PayloadBody::Object(_)));
    }

    #[test]
    fn envelope_from_binary_payload() {
        let env = build_envelope(
            "tenant/acme/device/sensor-17/shadow",
            &[0xde, 0xad, 0xbe, 0xef],
            Utc::now(),
        )
        .unwrap();
        match &env.payload {
            PayloadBody::Binary(b64) => {
                assert_eq!(env.payload.decode_binary().unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
                assert!(!b64.is_empty());
            }
            PayloadBody::Object(_) => panic!("expected binary payload"),
        }
    }

    #[test]
    fn unknown_topic_yields_no_envelope() {
        assert!(build_envelope("some/random/topic", b"{}", Utc::now()).is_none());
    }

    #[tokio::test]
    async fn forwarded_message_is_acked() {
        let channel = MockChannel::new();
        let bus = MockBus::new();
        let metrics = BridgeMetrics::default();

        let publish = telemetry_publish(br#"{"ts": 1, "site_id": "s", "metrics": {}}"#);
        handle_publish(&publish, &channel, &bus, &metrics).await;

        let published = bus.published(StreamKind::Telemetry);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "telemetry.acme");
        let env = Envelope::from_bytes(&published[0].1).unwrap();
        assert_eq!(env.device, "sensor-17");

        assert_eq!(channel.acked_topics().len(), 1);
        assert_eq!(metrics.messages_total.get("forwarded"), 1);
    }

    #[tokio::test]
    async fn bus_failure_leaves_message_unacked() {
        let channel = MockChannel::new();
        let bus = MockBus::new();
        bus.set_fail_publish(true);
        let metrics = BridgeMetrics::default();

        let publish = telemetry_publish(br#"{"ts": 1, "site_id": "s", "metrics": {}}"#);
        handle_publish(&publish, &channel, &bus, &metrics).await;

        assert!(bus.published(StreamKind::Telemetry).is_empty());
        assert!(channel.acked_topics().is_empty(), "must not ack on bus failure");
        assert_eq!(metrics.messages_total.get("publish_failed"), 1);
    }

    #[tokio::test]
    async fn unknown_topic_is_acked_and_dropped() {
        let channel = MockChannel::new();
        let bus = MockBus::new();
        let metrics = BridgeMetrics::default();

        let publish = Publish::new("garbage/topic", QoS::AtLeastOnce, b"x".to_vec());
        handle_publish(&publish, &channel, &bus, &metrics).await;

        assert!(bus.published(StreamKind::Telemetry).is_empty());
        assert_eq!(channel.acked_topics().len(), 1);
        assert_eq!(metrics.messages_total.get("ignored"), 1);
    }

    #[tokio::test]
    async fn shadow_and_command_route_to_their_streams() {
        let channel = MockChannel::new();
        let bus = MockBus::new();
        let metrics = BridgeMetrics::default();

        let shadow = Publish::new(
            "tenant/acme/device/d/shadow",
            QoS::AtLeastOnce,
            br#"{"reported": {}}"#.to_vec(),
        );
        let command = Publish::new(
            "tenant/acme/device/d/command",
            QoS::AtLeastOnce,
            br#"{"cmd": "reboot"}"#.to_vec(),
        );
        handle_publish(&shadow, &channel, &bus, &metrics).await;
        handle_publish(&command, &channel, &bus, &metrics).await;

        assert_eq!(bus.published(StreamKind::Shadow).len(), 1);
        assert_eq!(bus.published(StreamKind::Commands).len(), 1);
    }
}
