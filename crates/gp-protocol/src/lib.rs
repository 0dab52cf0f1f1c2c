//! Shared protocol types for the GridPulse fleet platform.
//!
//! Defines the wire contracts every process agrees on: bus envelopes,
//! telemetry payloads, MQTT topics, bus subjects, and the alerting and
//! routing domain model.

pub mod alerts;
pub mod envelope;
pub mod escalation;
pub mod quarantine;
pub mod routes;
pub mod subjects;
pub mod telemetry;
pub mod tenant;
pub mod topics;

pub use alerts::*;
pub use envelope::*;
pub use escalation::*;
pub use quarantine::*;
pub use routes::*;
pub use subjects::*;
pub use telemetry::*;
pub use tenant::*;
