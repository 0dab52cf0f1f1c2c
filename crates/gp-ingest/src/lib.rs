//! GridPulse ingestor library.
//!
//! The telemetry data plane: envelopes come off the bus (or the HTTP
//! endpoint), pass through auth, validation, rate limiting, and key
//! normalization, then land in the batch writer and the route fan-out
//! queue. Rejects are quarantined with a reason code.

pub mod auth;
pub mod batch;
pub mod config;
pub mod fanout;
pub mod http;
pub mod metrics;
pub mod normalize;
pub mod pipeline;
pub mod ratelimit;
pub mod sinks;
pub mod validate;

pub use auth::AuthCache;
pub use batch::{BatchWriterConfig, BatchWriterHandle, spawn_batch_writer};
pub use config::IngestConfig;
pub use fanout::{FanoutHandle, RouteTable, spawn_fanout};
pub use metrics::IngestMetrics;
pub use pipeline::{IngestOutcome, Pipeline, PipelineError};
pub use ratelimit::RateLimiter;
pub use sinks::{
    DeviceDirectory, DirectoryError, MemoryDirectory, MemoryQuarantine, MemoryTelemetry,
    QuarantineSink, SinkError, StoreDirectory, StoreQuarantine, StoreTelemetry, TelemetrySink,
    hash_token,
};
pub use validate::Limits;
