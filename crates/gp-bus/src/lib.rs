//! Durable message bus for GridPulse, backed by NATS JetStream.
//!
//! Provides:
//! - `Bus` trait for acknowledged publish and pull consumption (mockable)
//! - `JetStreamBus` production implementation with stream provisioning
//! - `MockBus` in-memory implementation with redelivery simulation
//!
//! Every publish waits for the JetStream ack before returning, so a
//! producer never advances past an unconfirmed message.

pub mod bus;
pub mod config;
pub mod error;
pub mod jetstream;
pub mod mock;

pub use bus::{Bus, BusConsumer, BusMessage, subject_matches};
pub use config::BusConfig;
pub use error::{BusError, BusResult};
pub use jetstream::JetStreamBus;
pub use mock::MockBus;

/// Bus-level redelivery cap applied to every durable consumer.
pub const MAX_DELIVER: i64 = 3;
