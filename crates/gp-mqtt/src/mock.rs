//! Mock MQTT channel for testing without a real broker.
//!
//! Records all published messages, subscription filters, and manual acks
//! for assertion in tests.

use async_trait::async_trait;
use rumqttc::{Publish, QoS};
use std::sync::Mutex;

use crate::channel::Channel;
use crate::error::{MqttError, MqttResult};

/// A recorded publish call.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// Mock implementation of the `Channel` trait.
///
/// Stores all publishes, subscriptions, and acks in memory for test
/// verification. Thread-safe via `Mutex` (fine for test contexts).
pub struct MockChannel {
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    acked: Mutex<Vec<String>>,
    fail_publish: Mutex<bool>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            acked: Mutex::new(Vec::new()),
            fail_publish: Mutex::new(false),
        }
    }

    /// Make subsequent publishes fail.
    pub fn set_fail_publish(&self, fail: bool) {
        *self.fail_publish.lock().unwrap() = fail;
    }

    /// Get all published messages.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap().clone()
    }

    /// Get published messages for a specific topic.
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Topics of incoming publishes that were manually acked.
    pub fn acked_topics(&self) -> Vec<String> {
        self.acked.lock().unwrap().clone()
    }

    /// Check whether a subscription was made to the given filter.
    pub fn is_subscribed_to(&self, filter: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .any(|(f, _)| f == filter)
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()> {
        if *self.fail_publish.lock().unwrap() {
            return Err(MqttError::Publish("mock publish failure".into()));
        }
        self.published.lock().unwrap().push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> MqttResult<()> {
        self.subscriptions
            .lock()
            .unwrap()
            .push((filter.to_string(), qos));
        Ok(())
    }

    async fn ack(&self, publish: &Publish) -> MqttResult<()> {
        self.acked.lock().unwrap().push(publish.topic.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_records_messages() {
        let mock = MockChannel::new();
        mock.publish("test/topic", b"hello", QoS::AtLeastOnce)
            .await
            .unwrap();

        let msgs = mock.published();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].topic, "test/topic");
        assert_eq!(msgs[0].payload, b"hello");
    }

    #[tokio::test]
    async fn subscribe_records_filters() {
        let mock = MockChannel::new();
        mock.subscribe("tenant/+/device/+/+", QoS::AtLeastOnce)
            .await
            .unwrap();

        assert!(mock.is_subscribed_to("tenant/+/device/+/+"));
        assert!(!mock.is_subscribed_to("tenant/acme/#"));
    }

    #[tokio::test]
    async fn ack_records_topic() {
        let mock = MockChannel::new();
        let publish = Publish::new("tenant/acme/device/d/telemetry", QoS::AtLeastOnce, "");
        mock.ack(&publish).await.unwrap();
        assert_eq!(mock.acked_topics(), vec!["tenant/acme/device/d/telemetry"]);
    }

    #[tokio::test]
    async fn failing_publish() {
        let mock = MockChannel::new();
        mock.set_fail_publish(true);
        assert!(mock.publish("t", b"d", QoS::AtLeastOnce).await.is_err());
        assert!(mock.published().is_empty());
    }
}
