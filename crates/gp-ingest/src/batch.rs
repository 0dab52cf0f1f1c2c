//! Batch writer: accumulates validated records per tenant and flushes
//! them as single multi-row transactions.
//!
//! Flush triggers: the tenant buffer reaches `batch_size`, the oldest
//! buffered record exceeds `flush_interval`, or shutdown (channel close).
//! Failed flushes retry with exponential backoff; records that exhaust
//! the retries are quarantined with reason `write_failed`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use gp_protocol::{QuarantineReason, TelemetryRecord};

use crate::metrics::IngestMetrics;
use crate::sinks::{QuarantineSink, TelemetrySink};

#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub max_attempts: u32,
    pub channel_capacity: usize,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_millis(1000),
            retry_base: Duration::from_millis(100),
            retry_cap: Duration::from_secs(5),
            max_attempts: 3,
            channel_capacity: 10_000,
        }
    }
}

/// Producer-side handle; the writer task owns the buffers exclusively.
#[derive(Clone)]
pub struct BatchWriterHandle {
    tx: mpsc::Sender<TelemetryRecord>,
    metrics: IngestMetrics,
}

/// The fan-out queue is full (HTTP callers surface 503).
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("batch queue full")]
    Full,
    #[error("batch writer stopped")]
    Closed,
}

impl BatchWriterHandle {
    /// Enqueue, waiting for space (bus consumers use this: blocking here
    /// is the natural backpressure before the message is acked).
    pub async fn enqueue(&self, record: TelemetryRecord) -> Result<(), EnqueueError> {
        self.tx
            .send(record)
            .await
            .map_err(|_| EnqueueError::Closed)?;
        self.metrics.queue_depth.inc();
        Ok(())
    }

    /// Enqueue without waiting (HTTP ingest uses this and maps `Full` to
    /// a 503 backpressure response).
    pub fn try_enqueue(&self, record: TelemetryRecord) -> Result<(), EnqueueError> {
        match self.tx.try_send(record) {
            Ok(()) => {
                self.metrics.queue_depth.inc();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(EnqueueError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }
}

struct TenantBuffer {
    records: Vec<TelemetryRecord>,
    oldest: Instant,
}

/// Spawn the writer task. Dropping every handle clone closes the channel;
/// the task then flushes all buffers one final time and exits.
pub fn spawn_batch_writer(
    sink: Arc<dyn TelemetrySink>,
    quarantine: Arc<dyn QuarantineSink>,
    config: BatchWriterConfig,
    metrics: IngestMetrics,
) -> (BatchWriterHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let handle = BatchWriterHandle {
        tx,
        metrics: metrics.clone(),
    };
    let task = tokio::spawn(run_writer(rx, sink, quarantine, config, metrics));
    (handle, task)
}

async fn run_writer(
    mut rx: mpsc::Receiver<TelemetryRecord>,
    sink: Arc<dyn TelemetrySink>,
    quarantine: Arc<dyn QuarantineSink>,
    config: BatchWriterConfig,
    metrics: IngestMetrics,
) {
    let mut buffers: HashMap<String, TenantBuffer> = HashMap::new();
    let tick = (config.flush_interval / 2).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(record) => {
                    metrics.queue_depth.dec();
                    let tenant = record.tenant.clone();
                    let buffer = buffers.entry(tenant.clone()).or_insert_with(|| TenantBuffer {
                        records: Vec::with_capacity(config.batch_size),
                        oldest: Instant::now(),
                    });
                    if buffer.records.is_empty() {
                        buffer.oldest = Instant::now();
                    }
                    buffer.records.push(record);

                    if buffer.records.len() >= config.batch_size {
                        let records = std::mem::take(&mut buffer.records);
                        flush(&tenant, records, &*sink, &*quarantine, &config, &metrics).await;
                    }
                }
                None => {
                    // Shutdown: drain everything still buffered.
                    for (tenant, buffer) in buffers.drain() {
                        if !buffer.records.is_empty() {
                            flush(&tenant, buffer.records, &*sink, &*quarantine, &config, &metrics)
                                .await;
                        }
                    }
                    tracing::info!("batch writer drained and stopped");
                    return;
                }
            },
            _ = ticker.tick() => {
                let due: Vec<String> = buffers
                    .iter()
                    .filter(|(_, b)| {
                        !b.records.is_empty() && b.oldest.elapsed() >= config.flush_interval
                    })
                    .map(|(t, _)| t.clone())
                    .collect();
                for tenant in due {
                    if let Some(buffer) = buffers.get_mut(&tenant) {
                        let records = std::mem::take(&mut buffer.records);
                        flush(&tenant, records, &*sink, &*quarantine, &config, &metrics).await;
                    }
                }
            }
        }
    }
}

async fn flush(
    tenant: &str,
    records: Vec<TelemetryRecord>,
    sink: &dyn TelemetrySink,
    quarantine: &dyn QuarantineSink,
    config: &BatchWriterConfig,
    metrics: &IngestMetrics,
) {
    let started = Instant::now();
    let mut last_error = None;

    for attempt in 1..=config.max_attempts {
        match sink.write_batch(tenant, &records).await {
            Ok(()) => {
                metrics.batch_write_seconds.observe(started.elapsed().as_secs_f64());
                metrics.records_written.add(records.len() as u64);
                metrics.batches_flushed.inc();
                tracing::debug!(tenant, count = records.len(), "batch flushed");
                return;
            }
            Err(e) => {
                tracing::warn!(
                    tenant,
                    attempt,
                    error = %e,
                    "batch flush failed"
                );
                last_error = Some(e);
                if attempt < config.max_attempts {
                    let backoff = config
                        .retry_base
                        .saturating_mul(1 << (attempt - 1))
                        .min(config.retry_cap);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    tracing::error!(
        tenant,
        count = records.len(),
        error = %last_error.map(|e| e.to_string()).unwrap_or_default(),
        "batch flush exhausted retries, quarantining records"
    );
    for record in &records {
        let raw = serde_json::to_vec(record).unwrap_or_default();
        if let Err(e) = quarantine
            .quarantine(
                tenant,
                Some(&record.device_id),
                QuarantineReason::WriteFailed,
                &raw,
                record.time,
            )
            .await
        {
            tracing::error!(tenant, error = %e, "failed to quarantine record after write failure");
        }
    }
}
