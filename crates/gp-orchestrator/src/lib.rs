//! GridPulse alert orchestrator library.
//!
//! Drives the escalation timeline of OPEN alerts: advances policy
//! levels, resolves on-call responders, and hands idempotent
//! notification jobs to the sink.

pub mod config;
pub mod sink;
pub mod tick;

pub use config::OrchestratorConfig;
pub use sink::{BusNotificationSink, MemorySink, NotificationError, NotificationSink};
pub use tick::{OrchestratorMetrics, next_escalation_at, resolve_recipients, run, tick};
