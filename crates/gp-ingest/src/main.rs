//! GridPulse ingestor — telemetry admission and persistence.
//!
//! Pull-consumes the TELEMETRY stream, runs every envelope through the
//! admission pipeline, batches accepted records into the store, and fans
//! matched records out to the ROUTES stream.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use gp_bus::{Bus, BusConfig, JetStreamBus};
use gp_ingest::batch::BatchWriterConfig;
use gp_ingest::fanout::{RouteTable, StoreRouteSource, spawn_fanout};
use gp_ingest::pipeline::{Pipeline, run_worker};
use gp_ingest::sinks::{StoreDirectory, StoreQuarantine, StoreTelemetry};
use gp_ingest::{AuthCache, IngestConfig, IngestMetrics, Limits, RateLimiter, spawn_batch_writer};
use gp_observe::Health;
use gp_protocol::StreamKind;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "gp-ingest starting");

    let config = IngestConfig::from_env();
    let store_config = gp_store::StoreConfig::from_env();
    let bus_config = BusConfig::from_env();

    let pool = gp_store::connect(&store_config).await?;
    let bus: Arc<dyn Bus> = Arc::new(JetStreamBus::connect(&bus_config).await?);

    let metrics = IngestMetrics::new();
    let cancel = CancellationToken::new();

    // Shared state: caches, buckets, route table.
    let directory = Arc::new(StoreDirectory::new(pool.clone()));
    let auth = AuthCache::new(
        directory.clone() as _,
        config.auth_cache_max_size,
        config.auth_cache_ttl,
        metrics.clone(),
    );
    let keymap = gp_ingest::normalize::KeyMapCache::new(
        directory as _,
        config.metric_map_cache_size,
        config.metric_map_cache_ttl,
        metrics.clone(),
    );
    let limiter = Arc::new(RateLimiter::new());
    let sweeper = limiter.spawn_sweeper(
        config.bucket_cleanup_interval,
        config.bucket_ttl,
        cancel.clone(),
    );

    let routes = Arc::new(RouteTable::new());
    let route_source = Arc::new(StoreRouteSource::new(pool.clone()));
    let route_refresher =
        routes.spawn_refresher(route_source, config.settings_poll, cancel.clone());

    // Batch writer and route fan-out.
    let (batch, writer_task) = spawn_batch_writer(
        Arc::new(StoreTelemetry::new(pool.clone())),
        Arc::new(StoreQuarantine::new(pool.clone())),
        BatchWriterConfig {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
            ..Default::default()
        },
        metrics.clone(),
    );
    let (fanout, fanout_workers) = spawn_fanout(
        Arc::clone(&bus),
        config.delivery_worker_count,
        10_000,
        metrics.clone(),
    );

    let pipeline = Arc::new(Pipeline {
        auth,
        limiter,
        keymap,
        batch,
        fanout,
        routes,
        quarantine: Arc::new(StoreQuarantine::new(pool.clone())),
        metrics: metrics.clone(),
        limits: Limits::default().with_max_payload(config.max_payload_bytes),
    });

    // Bus consumers, one durable binding per worker.
    let mut workers = Vec::with_capacity(config.ingest_worker_count);
    for worker in 0..config.ingest_worker_count {
        let consumer = bus
            .pull_consumer(
                StreamKind::Telemetry,
                "ingest",
                &StreamKind::Telemetry.filter_all(),
            )
            .await?;
        workers.push(tokio::spawn(run_worker(
            Arc::clone(&pipeline),
            consumer,
            cancel.clone(),
            worker,
        )));
    }

    // HTTP surface: health + metrics + direct ingest.
    let health = Health::new();
    let _bus_live = health.component("bus");
    let _db_live = health.component("db");
    let render_metrics = metrics.clone();
    let app = gp_observe::server::router(health, Arc::new(move || render_metrics.render()))
        .merge(gp_ingest::http::router(Arc::clone(&pipeline)))
        .layer(tower_http::trace::TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(&config.http_listen_addr).await?;
    tracing::info!(addr = %config.http_listen_addr, "http server listening");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "http server exited");
        }
    });

    tracing::info!(workers = config.ingest_worker_count, "gp-ingest ready");
    shutdown_signal().await;

    // Staged drain, per the shutdown contract: stop intake, drain the
    // queues, flush the writer, then release resources.
    tracing::info!(stage = "stop_consume", "shutdown started");
    cancel.cancel();
    for (i, worker) in workers.into_iter().enumerate() {
        if tokio::time::timeout(Duration::from_secs(10), worker).await.is_err() {
            tracing::warn!(worker = i, stage = "stop_consume", "worker did not stop in time");
        }
    }

    tracing::info!(stage = "flush_batches", "draining batch writer");
    server.abort();
    drop(pipeline); // closes the batch and fan-out channels
    if tokio::time::timeout(Duration::from_secs(10), writer_task).await.is_err() {
        tracing::warn!(stage = "flush_batches", "batch writer did not drain in time");
    }

    tracing::info!(stage = "drain_routes", "draining route fan-out");
    for worker in fanout_workers {
        if tokio::time::timeout(Duration::from_secs(5), worker).await.is_err() {
            tracing::warn!(stage = "drain_routes", "fan-out worker did not drain in time");
        }
    }

    let _ = sweeper.await;
    let _ = route_refresher.await;

    tracing::info!(stage = "close_db", "closing database pool");
    pool.close().await;

    tracing::info!("gp-ingest stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = term.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    tracing::info!("shutdown signal received");
}
