//! GridPulse bus bridge library (exposed for integration tests).

pub mod bridge;
pub mod config;

pub use bridge::{BridgeMetrics, build_envelope, handle_publish, run};
pub use config::BridgeConfig;
