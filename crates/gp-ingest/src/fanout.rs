//! Route matching and delivery-job fan-out.
//!
//! Matching happens here, off the ingest hot path's DB worker: accepted
//! envelopes are matched against the tenant's route table and a
//! [`DeliveryJob`] is pushed onto a bounded queue. A small publisher pool
//! moves jobs onto the ROUTES stream. When the queue is full the job is
//! dropped with a warning counter; the ingest path never blocks on
//! fan-out.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use gp_bus::Bus;
use gp_protocol::{DeliveryJob, Route, StreamKind};

use crate::metrics::IngestMetrics;
use crate::sinks::SinkError;

/// Delivery attempts allowed per job, mirrored into the job body.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Source of route definitions for periodic refresh.
#[async_trait]
pub trait RouteSource: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, Vec<Route>>, SinkError>;
}

/// Postgres-backed route source.
pub struct StoreRouteSource {
    pool: sqlx::PgPool,
}

impl StoreRouteSource {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RouteSource for StoreRouteSource {
    async fn load(&self) -> Result<HashMap<String, Vec<Route>>, SinkError> {
        let tenants = gp_store::tenants::active_tenants(&self.pool)
            .await
            .map_err(|e| SinkError(e.to_string()))?;
        let mut out = HashMap::new();
        for tenant in tenants {
            let routes = gp_store::routes::enabled_routes(&self.pool, &tenant)
                .await
                .map_err(|e| SinkError(e.to_string()))?;
            if !routes.is_empty() {
                out.insert(tenant, routes);
            }
        }
        Ok(out)
    }
}

/// In-memory snapshot of enabled routes per tenant.
#[derive(Default)]
pub struct RouteTable {
    inner: RwLock<HashMap<String, Arc<Vec<Route>>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_routes(&self, tenant: &str, routes: Vec<Route>) {
        self.inner
            .write()
            .unwrap()
            .insert(tenant.to_string(), Arc::new(routes));
    }

    pub fn replace_all(&self, routes: HashMap<String, Vec<Route>>) {
        let mut inner = self.inner.write().unwrap();
        inner.clear();
        for (tenant, list) in routes {
            inner.insert(tenant, Arc::new(list));
        }
    }

    /// Routes matching one accepted envelope.
    pub fn matching(
        &self,
        tenant: &str,
        topic: &str,
        payload: &serde_json::Value,
    ) -> Vec<Route> {
        let snapshot = self.inner.read().unwrap().get(tenant).cloned();
        snapshot
            .map(|routes| {
                routes
                    .iter()
                    .filter(|r| r.matches(topic, payload))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Periodic refresh from the source until cancelled.
    pub fn spawn_refresher(
        self: &Arc<Self>,
        source: Arc<dyn RouteSource>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => match source.load().await {
                        Ok(routes) => table.replace_all(routes),
                        Err(e) => tracing::warn!(error = %e, "route table refresh failed"),
                    },
                    () = cancel.cancelled() => break,
                }
            }
        })
    }
}

/// Producer handle for the fan-out queue.
#[derive(Clone)]
pub struct FanoutHandle {
    tx: mpsc::Sender<DeliveryJob>,
    metrics: IngestMetrics,
}

impl FanoutHandle {
    /// Queue a job; drops with a counter when the queue is full.
    pub fn enqueue(&self, job: DeliveryJob) {
        match self.tx.try_send(job) {
            Ok(()) => self.metrics.route_jobs_enqueued_total.inc(),
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.metrics.route_jobs_dropped_total.inc();
                tracing::warn!(
                    tenant = %job.tenant,
                    route_id = %job.route_id,
                    "fan-out queue full, dropping delivery job"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.route_jobs_dropped_total.inc();
            }
        }
    }
}

/// Spawn the publisher pool. Workers drain the queue and exit when every
/// handle clone is dropped and the queue is empty.
pub fn spawn_fanout(
    bus: Arc<dyn Bus>,
    worker_count: usize,
    capacity: usize,
    metrics: IngestMetrics,
) -> (FanoutHandle, Vec<tokio::task::JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel::<DeliveryJob>(capacity);
    let rx = Arc::new(Mutex::new(rx));

    let mut workers = Vec::with_capacity(worker_count);
    for worker in 0..worker_count {
        let rx = Arc::clone(&rx);
        let bus = Arc::clone(&bus);
        workers.push(tokio::spawn(async move {
            loop {
                let job = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                let Some(job) = job else { break };
                publish_job(&*bus, &job).await;
            }
            tracing::debug!(worker, "fan-out publisher stopped");
        }));
    }

    (FanoutHandle { tx, metrics }, workers)
}

async fn publish_job(bus: &dyn Bus, job: &DeliveryJob) {
    let subject = StreamKind::Routes.subject(&job.tenant);
    let bytes = match serde_json::to_vec(job) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize delivery job");
            return;
        }
    };

    for attempt in 1..=3u32 {
        match bus.publish_acked(&subject, &bytes).await {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!(attempt, error = %e, subject, "route job publish failed");
                if attempt < 3 {
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
            }
        }
    }
    tracing::error!(
        tenant = %job.tenant,
        route_id = %job.route_id,
        "dropping delivery job after repeated publish failures"
    );
}
