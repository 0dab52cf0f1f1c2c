//! Route definitions, delivery jobs, and filter matching.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// External sink a route delivers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    Webhook {
        url: String,
    },
    MqttRepublish {
        topic: String,
    },
    ObjectStorage {
        endpoint: String,
        prefix: String,
    },
}

impl Destination {
    pub fn kind(&self) -> &'static str {
        match self {
            Destination::Webhook { .. } => "webhook",
            Destination::MqttRepublish { .. } => "mqtt_republish",
            Destination::ObjectStorage { .. } => "object_storage",
        }
    }
}

/// Optional payload predicate: the value at `path` (a JSON pointer) must
/// exist, and equal `equals` when one is given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadFilter {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<serde_json::Value>,
}

impl PayloadFilter {
    pub fn matches(&self, payload: &serde_json::Value) -> bool {
        match payload.pointer(&self.path) {
            Some(found) => match &self.equals {
                Some(want) => found == want,
                None => true,
            },
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub route_id: Uuid,
    pub tenant: String,
    /// MQTT-style filter (`+` one level, trailing `#` for the rest).
    pub topic_filter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_filter: Option<PayloadFilter>,
    pub destination: Destination,
    pub enabled: bool,
}

impl Route {
    pub fn matches(&self, topic: &str, payload: &serde_json::Value) -> bool {
        if !self.enabled || !topic_matches(&self.topic_filter, topic) {
            return false;
        }
        match &self.payload_filter {
            Some(f) => f.matches(payload),
            None => true,
        }
    }
}

/// Ephemeral job carried on the ROUTES stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub tenant: String,
    pub route_id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// MQTT-style topic filter match: `+` matches one level, a trailing `#`
/// matches the remainder.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/').peekable();
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return filter_parts.peek().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
