//! GridPulse route delivery worker library.
//!
//! Consumes delivery jobs from the ROUTES stream and executes them
//! against webhook, MQTT-republish, and object-storage destinations with
//! at-least-once semantics: retryable failures ride the bus redelivery
//! (capped), terminal failures land in the dead-letter table.

pub mod config;
pub mod deliver;
pub mod outcome;
pub mod worker;

pub use config::DeliveryConfig;
pub use deliver::Executor;
pub use outcome::DeliveryOutcome;
pub use worker::{
    DeadLetterEntry, DeadLetters, DeliveryMetrics, MemoryDeadLetters, MemoryRouteLookup,
    RouteLookup, StoreDeadLetters, StoreRouteLookup, run,
};
