//! Device-facing MQTT channel for GridPulse services.
//!
//! Wraps `rumqttc` behind a small `Channel` trait so the bridge and the
//! route-delivery worker can be tested without a broker:
//! - `MqttChannel` with TLS (mTLS) for production brokers
//! - `MockChannel` recording publishes/subscriptions/acks for tests

pub mod channel;
pub mod config;
pub mod error;
pub mod mock;
pub mod tls;

pub use channel::{Channel, MqttChannel};
pub use config::MqttConfig;
pub use error::{MqttError, MqttResult};
pub use mock::MockChannel;
