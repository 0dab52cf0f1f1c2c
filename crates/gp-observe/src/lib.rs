//! Process observability: counters, histograms, Prometheus text
//! exposition, and the `/health` + `/metrics` HTTP server every GridPulse
//! process exposes.

pub mod metrics;
pub mod render;
pub mod server;

pub use metrics::{Counter, Gauge, Histogram, LabeledCounter};
pub use render::{
    escape_label_value, write_counter, write_gauge, write_histogram, write_labeled_counter,
};
pub use server::{Health, serve};
