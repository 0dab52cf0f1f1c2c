//! Delivery consume loop: fetch jobs, execute, ack/nak/dead-letter.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gp_bus::{Bus, BusConsumer, BusMessage, MAX_DELIVER};
use gp_observe::{Counter, Gauge, LabeledCounter, write_counter, write_gauge, write_labeled_counter};
use gp_protocol::{DeliveryJob, Route, StreamKind};

use crate::config::DeliveryConfig;
use crate::deliver::Executor;
use crate::outcome::DeliveryOutcome;

#[derive(Clone, Default)]
pub struct DeliveryMetrics {
    /// result = delivered | retried | dead_lettered | dropped
    pub messages_total: LabeledCounter,
    pub delivery_failures_total: Counter,
    pub dlq_writes_total: Counter,
    pub queue_depth: Gauge,
}

impl DeliveryMetrics {
    pub fn render(&self) -> String {
        let mut buf = String::with_capacity(1024);
        write_labeled_counter(
            &mut buf,
            "gp_delivery_messages_total",
            "Delivery jobs by outcome.",
            "result",
            &self.messages_total,
        );
        write_counter(
            &mut buf,
            "gp_delivery_failures_total",
            "Failed delivery attempts.",
            &self.delivery_failures_total,
        );
        write_counter(
            &mut buf,
            "gp_delivery_dlq_writes_total",
            "Dead-letter rows written.",
            &self.dlq_writes_total,
        );
        write_gauge(
            &mut buf,
            "gp_delivery_queue_depth",
            "Jobs waiting in the internal delivery queue.",
            &self.queue_depth,
        );
        buf
    }
}

/// Route configuration lookup at delivery time.
#[async_trait]
pub trait RouteLookup: Send + Sync {
    async fn fetch(&self, tenant: &str, route_id: Uuid) -> Result<Option<Route>, String>;
}

/// Store-backed lookup with a short TTL cache.
pub struct StoreRouteLookup {
    pool: sqlx::PgPool,
    cache: moka::future::Cache<(String, Uuid), Option<Route>>,
}

impl StoreRouteLookup {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            cache: moka::future::Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(60))
                .build(),
        }
    }
}

#[async_trait]
impl RouteLookup for StoreRouteLookup {
    async fn fetch(&self, tenant: &str, route_id: Uuid) -> Result<Option<Route>, String> {
        let pool = self.pool.clone();
        let tenant_owned = tenant.to_string();
        self.cache
            .try_get_with((tenant_owned.clone(), route_id), async move {
                gp_store::routes::fetch_route(&pool, &tenant_owned, route_id)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await
            .map_err(|e| e.to_string())
    }
}

/// In-memory lookup for tests.
#[derive(Default)]
pub struct MemoryRouteLookup {
    routes: StdMutex<std::collections::HashMap<(String, Uuid), Route>>,
}

impl MemoryRouteLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, route: Route) {
        self.routes
            .lock()
            .unwrap()
            .insert((route.tenant.clone(), route.route_id), route);
    }
}

#[async_trait]
impl RouteLookup for MemoryRouteLookup {
    async fn fetch(&self, tenant: &str, route_id: Uuid) -> Result<Option<Route>, String> {
        Ok(self
            .routes
            .lock()
            .unwrap()
            .get(&(tenant.to_string(), route_id))
            .cloned())
    }
}

/// A delivery that exhausted its retries or failed terminally.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub tenant: String,
    pub route_id: Uuid,
    pub topic: String,
    pub payload: String,
    pub destination_kind: String,
    pub destination_config: serde_json::Value,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Dead-letter persistence.
#[async_trait]
pub trait DeadLetters: Send + Sync {
    async fn record(&self, entry: DeadLetterEntry) -> Result<(), String>;
}

pub struct StoreDeadLetters {
    pool: sqlx::PgPool,
}

impl StoreDeadLetters {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetters for StoreDeadLetters {
    async fn record(&self, entry: DeadLetterEntry) -> Result<(), String> {
        gp_store::dead_letter::insert(
            &self.pool,
            &entry.tenant,
            entry.route_id,
            &entry.topic,
            &entry.payload,
            &entry.destination_kind,
            &entry.destination_config,
            &entry.error,
            entry.failed_at,
        )
        .await
        .map_err(|e| e.to_string())
    }
}

/// In-memory dead letters for tests, applying the same truncation limits
/// as the store.
#[derive(Default)]
pub struct MemoryDeadLetters {
    entries: StdMutex<Vec<DeadLetterEntry>>,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetters for MemoryDeadLetters {
    async fn record(&self, mut entry: DeadLetterEntry) -> Result<(), String> {
        entry.payload = gp_store::dead_letter::truncate_utf8(
            &entry.payload,
            gp_store::dead_letter::MAX_PAYLOAD_BYTES,
        )
        .to_string();
        entry.error = gp_store::dead_letter::truncate_utf8(
            &entry.error,
            gp_store::dead_letter::MAX_ERROR_BYTES,
        )
        .to_string();
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}

/// Handle one delivery job message end to end.
pub async fn process_message(
    msg: BusMessage,
    executor: &Executor,
    routes: &dyn RouteLookup,
    dead_letters: &dyn DeadLetters,
    metrics: &DeliveryMetrics,
) {
    let job: DeliveryJob = match serde_json::from_slice(&msg.payload) {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(subject = %msg.subject, error = %e, "undecodable delivery job");
            let _ = msg.term().await;
            return;
        }
    };

    let route = match routes.fetch(&job.tenant, job.route_id).await {
        Ok(Some(route)) => route,
        Ok(None) => {
            // Route deleted since matching; nothing left to deliver to.
            tracing::warn!(tenant = %job.tenant, route_id = %job.route_id, "route gone, dropping job");
            metrics.messages_total.inc("dropped");
            let _ = msg.ack().await;
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "route lookup failed, leaving job for redelivery");
            let _ = msg.nak(Some(Duration::from_secs(1))).await;
            return;
        }
    };

    match executor.deliver(&route.destination, &job).await {
        DeliveryOutcome::Delivered => {
            metrics.messages_total.inc("delivered");
            let _ = msg.ack().await;
        }
        DeliveryOutcome::Retry(delay) => {
            metrics.delivery_failures_total.inc();
            if msg.delivery_count >= MAX_DELIVER as u64 {
                // Retries exhausted at the bus level: dead-letter now,
                // terminate so the bus stops redelivering.
                write_dead_letter(
                    &job,
                    &route,
                    "retries exhausted".to_string(),
                    dead_letters,
                    metrics,
                )
                .await;
                let _ = msg.term().await;
            } else {
                metrics.messages_total.inc("retried");
                let _ = msg.nak(delay).await;
            }
        }
        DeliveryOutcome::Terminal(error) => {
            metrics.delivery_failures_total.inc();
            write_dead_letter(&job, &route, error, dead_letters, metrics).await;
            let _ = msg.ack().await;
        }
    }
}

async fn write_dead_letter(
    job: &DeliveryJob,
    route: &Route,
    error: String,
    dead_letters: &dyn DeadLetters,
    metrics: &DeliveryMetrics,
) {
    let entry = DeadLetterEntry {
        tenant: job.tenant.clone(),
        route_id: job.route_id,
        topic: job.topic.clone(),
        payload: job.payload.to_string(),
        destination_kind: route.destination.kind().to_string(),
        destination_config: serde_json::to_value(&route.destination).unwrap_or_default(),
        error,
        failed_at: Utc::now(),
    };
    match dead_letters.record(entry).await {
        Ok(()) => {
            metrics.messages_total.inc("dead_lettered");
            metrics.dlq_writes_total.inc();
        }
        Err(e) => {
            tracing::error!(
                tenant = %job.tenant,
                route_id = %job.route_id,
                error = %e,
                "failed to record dead letter"
            );
        }
    }
}

/// Consume the ROUTES stream until cancelled.
///
/// A small internal queue feeds the processor pool; when its fill-ratio
/// exceeds 0.8 the fetch loop pauses briefly per poll so downstream
/// sinks can recover.
pub async fn run(
    bus: Arc<dyn Bus>,
    executor: Arc<Executor>,
    routes: Arc<dyn RouteLookup>,
    dead_letters: Arc<dyn DeadLetters>,
    config: DeliveryConfig,
    metrics: DeliveryMetrics,
    cancel: CancellationToken,
) {
    let mut consumer = match bus
        .pull_consumer(
            StreamKind::Routes,
            "route-delivery",
            &StreamKind::Routes.filter_all(),
        )
        .await
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "cannot bind route-delivery consumer");
            return;
        }
    };

    let (tx, rx) = mpsc::channel::<BusMessage>(config.queue_capacity);
    let rx = Arc::new(Mutex::new(rx));

    let mut processors = Vec::with_capacity(config.worker_count);
    for _ in 0..config.worker_count {
        let rx = Arc::clone(&rx);
        let executor = Arc::clone(&executor);
        let routes = Arc::clone(&routes);
        let dead_letters = Arc::clone(&dead_letters);
        let metrics = metrics.clone();
        processors.push(tokio::spawn(async move {
            loop {
                let msg = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                let Some(msg) = msg else { break };
                metrics.queue_depth.dec();
                process_message(msg, &executor, &*routes, &*dead_letters, &metrics).await;
            }
        }));
    }

    tracing::info!(workers = config.worker_count, "route delivery started");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let fill = 1.0 - (tx.capacity() as f64 / config.queue_capacity as f64);
        if fill > 0.8 {
            tokio::time::sleep(config.backpressure_pause).await;
        }

        let fetched = tokio::select! {
            r = consumer.fetch(16, Duration::from_millis(500)) => r,
            () = cancel.cancelled() => break,
        };
        match fetched {
            Ok(batch) if batch.is_empty() => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Ok(batch) => {
                for msg in batch {
                    metrics.queue_depth.inc();
                    if tx.send(msg).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "routes fetch failed");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }

    drop(tx);
    for p in processors {
        let _ = p.await;
    }
    tracing::info!("route delivery stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use gp_bus::MockBus;
    use gp_protocol::Destination;
    use std::net::SocketAddr;

    async fn serve_status(
        status: axum::http::StatusCode,
        hits: Arc<std::sync::atomic::AtomicU32>,
    ) -> SocketAddr {
        use axum::routing::post;
        let app = axum::Router::new().route(
            "/hook",
            post(move || {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn webhook_route(url: String) -> Route {
        Route {
            route_id: Uuid::now_v7(),
            tenant: "acme".into(),
            topic_filter: "#".into(),
            payload_filter: None,
            destination: Destination::Webhook { url },
            enabled: true,
        }
    }

    fn job_for(route: &Route, payload: serde_json::Value) -> DeliveryJob {
        DeliveryJob {
            tenant: route.tenant.clone(),
            route_id: route.route_id,
            topic: "tenant/acme/device/d/telemetry".into(),
            payload,
            attempt: 1,
            max_attempts: 3,
        }
    }

    struct Fixture {
        bus: Arc<MockBus>,
        executor: Executor,
        routes: MemoryRouteLookup,
        dead_letters: MemoryDeadLetters,
        metrics: DeliveryMetrics,
    }

    fn fixture() -> Fixture {
        Fixture {
            bus: Arc::new(MockBus::new()),
            executor: Executor::new(Duration::from_secs(2), Duration::from_secs(60), None),
            routes: MemoryRouteLookup::new(),
            dead_letters: MemoryDeadLetters::new(),
            metrics: DeliveryMetrics::default(),
        }
    }

    async fn publish_and_fetch(f: &Fixture, job: &DeliveryJob) -> Vec<BusMessage> {
        f.bus
            .publish_acked("routes.acme", &serde_json::to_vec(job).unwrap())
            .await
            .unwrap();
        let mut consumer = f
            .bus
            .pull_consumer(StreamKind::Routes, "route-delivery", "routes.>")
            .await
            .unwrap();
        consumer.fetch(16, Duration::from_millis(10)).await.unwrap()
    }

    #[tokio::test]
    async fn successful_delivery_acks() {
        let hits = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let addr = serve_status(axum::http::StatusCode::OK, Arc::clone(&hits)).await;

        let f = fixture();
        let route = webhook_route(format!("http://{addr}/hook"));
        f.routes.insert(route.clone());
        let job = job_for(&route, serde_json::json!({"m": 1}));

        let msgs = publish_and_fetch(&f, &job).await;
        process_message(
            msgs.into_iter().next().unwrap(),
            &f.executor,
            &f.routes,
            &f.dead_letters,
            &f.metrics,
        )
        .await;

        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(f.bus.acked_count(StreamKind::Routes, "route-delivery"), 1);
        assert!(f.dead_letters.entries().is_empty());
        assert_eq!(f.metrics.messages_total.get("delivered"), 1);
    }

    #[tokio::test]
    async fn failing_webhook_dead_letters_after_redelivery_cap() {
        let hits = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let addr =
            serve_status(axum::http::StatusCode::INTERNAL_SERVER_ERROR, Arc::clone(&hits)).await;

        let f = fixture();
        let route = webhook_route(format!("http://{addr}/hook"));
        f.routes.insert(route.clone());
        let job = job_for(&route, serde_json::json!({"m": 1}));

        f.bus
            .publish_acked("routes.acme", &serde_json::to_vec(&job).unwrap())
            .await
            .unwrap();
        let mut consumer = f
            .bus
            .pull_consumer(StreamKind::Routes, "route-delivery", "routes.>")
            .await
            .unwrap();

        // Drive fetch/process until the bus stops redelivering.
        for _ in 0..MAX_DELIVER {
            let msgs = consumer.fetch(16, Duration::from_millis(10)).await.unwrap();
            assert_eq!(msgs.len(), 1);
            process_message(
                msgs.into_iter().next().unwrap(),
                &f.executor,
                &f.routes,
                &f.dead_letters,
                &f.metrics,
            )
            .await;
        }
        let no_more = consumer.fetch(16, Duration::from_millis(10)).await.unwrap();
        assert!(no_more.is_empty(), "no redelivery after the cap");

        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 3);
        let entries = f.dead_letters.entries();
        assert_eq!(entries.len(), 1, "exactly one dead-letter row");
        assert_eq!(entries[0].destination_kind, "webhook");
        assert!(entries[0].error.contains("retries exhausted"));
        assert_eq!(f.metrics.dlq_writes_total.get(), 1);
    }

    #[tokio::test]
    async fn terminal_4xx_dead_letters_immediately() {
        let hits = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let addr = serve_status(axum::http::StatusCode::GONE, Arc::clone(&hits)).await;

        let f = fixture();
        let route = webhook_route(format!("http://{addr}/hook"));
        f.routes.insert(route.clone());
        let job = job_for(&route, serde_json::json!({"m": 1}));

        let msgs = publish_and_fetch(&f, &job).await;
        process_message(
            msgs.into_iter().next().unwrap(),
            &f.executor,
            &f.routes,
            &f.dead_letters,
            &f.metrics,
        )
        .await;

        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(f.dead_letters.entries().len(), 1);
        // Acked: a terminal failure must not be retried.
        assert_eq!(f.bus.acked_count(StreamKind::Routes, "route-delivery"), 1);
    }

    #[tokio::test]
    async fn dead_letter_payload_is_truncated() {
        let f = fixture();
        let route = webhook_route("http://127.0.0.1:1/hook".into());
        // Force terminal via missing route? Use Terminal by 4xx instead:
        // record directly through write_dead_letter.
        let big = "p".repeat(20 * 1024);
        let job = job_for(&route, serde_json::json!({"blob": big}));
        write_dead_letter(
            &job,
            &route,
            "e".repeat(5 * 1024),
            &f.dead_letters,
            &f.metrics,
        )
        .await;

        let entries = f.dead_letters.entries();
        assert!(entries[0].payload.len() <= gp_store::dead_letter::MAX_PAYLOAD_BYTES);
        assert!(entries[0].error.len() <= gp_store::dead_letter::MAX_ERROR_BYTES);
    }

    #[tokio::test]
    async fn missing_route_drops_job() {
        let f = fixture();
        let route = webhook_route("http://127.0.0.1:1/hook".into());
        // Route is NOT inserted into the lookup.
        let job = job_for(&route, serde_json::json!({"m": 1}));

        let msgs = publish_and_fetch(&f, &job).await;
        process_message(
            msgs.into_iter().next().unwrap(),
            &f.executor,
            &f.routes,
            &f.dead_letters,
            &f.metrics,
        )
        .await;

        assert_eq!(f.metrics.messages_total.get("dropped"), 1);
        assert_eq!(f.bus.acked_count(StreamKind::Routes, "route-delivery"), 1);
    }
}
