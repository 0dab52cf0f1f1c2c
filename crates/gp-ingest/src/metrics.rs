//! Ingestor metric registry and exposition rendering.

use gp_observe::{
    Counter, Gauge, Histogram, LabeledCounter, write_counter, write_gauge, write_histogram,
    write_labeled_counter,
};

/// All ingestor counters, created once at boot and threaded through the
/// pipeline context.
#[derive(Clone, Default)]
pub struct IngestMetrics {
    /// result = accepted | rejected | rate_limited
    pub messages_total: LabeledCounter,
    /// Batch-writer channel depth.
    pub queue_depth: Gauge,
    pub batch_write_seconds: Histogram,
    pub records_written: Counter,
    pub batches_flushed: Counter,
    pub cache_hits_total: Counter,
    pub cache_misses_total: Counter,
    pub metric_keys_remapped_total: Counter,
    pub route_jobs_enqueued_total: Counter,
    pub route_jobs_dropped_total: Counter,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prometheus text exposition for `/metrics`.
    pub fn render(&self) -> String {
        let mut buf = String::with_capacity(2048);
        write_labeled_counter(
            &mut buf,
            "gp_ingest_messages_total",
            "Envelopes processed by admission result.",
            "result",
            &self.messages_total,
        );
        write_gauge(
            &mut buf,
            "gp_ingest_queue_depth",
            "Records buffered toward the batch writer.",
            &self.queue_depth,
        );
        write_histogram(
            &mut buf,
            "gp_ingest_batch_write_seconds",
            "Latency of batch flushes to the store.",
            &self.batch_write_seconds,
        );
        write_counter(
            &mut buf,
            "gp_ingest_records_written_total",
            "Telemetry records persisted.",
            &self.records_written,
        );
        write_counter(
            &mut buf,
            "gp_ingest_batches_flushed_total",
            "Batches flushed to the store.",
            &self.batches_flushed,
        );
        write_counter(
            &mut buf,
            "gp_ingest_cache_hits_total",
            "Auth cache hits.",
            &self.cache_hits_total,
        );
        write_counter(
            &mut buf,
            "gp_ingest_cache_misses_total",
            "Auth cache misses.",
            &self.cache_misses_total,
        );
        write_counter(
            &mut buf,
            "gp_ingest_metric_keys_remapped_total",
            "Metric keys rewritten to canonical form.",
            &self.metric_keys_remapped_total,
        );
        write_counter(
            &mut buf,
            "gp_ingest_route_jobs_enqueued_total",
            "Delivery jobs enqueued for route fan-out.",
            &self.route_jobs_enqueued_total,
        );
        write_counter(
            &mut buf,
            "gp_ingest_route_jobs_dropped_total",
            "Delivery jobs dropped because the fan-out queue was full.",
            &self.route_jobs_dropped_total,
        );
        buf
    }
}
