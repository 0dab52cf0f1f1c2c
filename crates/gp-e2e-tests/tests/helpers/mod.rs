//! Shared harness wiring the real pipeline to in-memory infrastructure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rumqttc::{Publish, QoS};
use tokio_util::sync::CancellationToken;

use gp_bridge::BridgeMetrics;
use gp_bus::{Bus, MockBus};
use gp_ingest::batch::{BatchWriterConfig, spawn_batch_writer};
use gp_ingest::fanout::{RouteTable, spawn_fanout};
use gp_ingest::normalize::KeyMapCache;
use gp_ingest::pipeline::{Pipeline, run_worker};
use gp_ingest::sinks::{
    MemoryDevice, MemoryDirectory, MemoryQuarantine, MemoryTelemetry, hash_token,
};
use gp_ingest::{AuthCache, IngestMetrics, Limits, RateLimiter};
use gp_mqtt::MockChannel;
use gp_protocol::{DeviceStatus, RateTier, StreamKind, TenantStatus, topics};
use gp_store::devices::AuthRecord;

pub struct TestHarness {
    pub bus: Arc<MockBus>,
    pub channel: Arc<MockChannel>,
    pub directory: Arc<MemoryDirectory>,
    pub sink: Arc<MemoryTelemetry>,
    pub quarantine: Arc<MemoryQuarantine>,
    pub pipeline: Arc<Pipeline>,
    pub ingest_metrics: IngestMetrics,
    pub bridge_metrics: BridgeMetrics,
    _writer: tokio::task::JoinHandle<()>,
    _fanout_workers: Vec<tokio::task::JoinHandle<()>>,
}

impl TestHarness {
    pub fn new() -> Self {
        let bus = Arc::new(MockBus::new());
        let channel = Arc::new(MockChannel::new());
        let directory = Arc::new(MemoryDirectory::new());
        let sink = Arc::new(MemoryTelemetry::new());
        let quarantine = Arc::new(MemoryQuarantine::new());
        let ingest_metrics = IngestMetrics::new();

        let (batch, writer) = spawn_batch_writer(
            Arc::clone(&sink) as _,
            Arc::clone(&quarantine) as _,
            BatchWriterConfig {
                batch_size: 10,
                flush_interval: Duration::from_millis(20),
                retry_base: Duration::from_millis(1),
                retry_cap: Duration::from_millis(5),
                max_attempts: 3,
                channel_capacity: 1000,
            },
            ingest_metrics.clone(),
        );
        let (fanout, fanout_workers) = spawn_fanout(
            Arc::clone(&bus) as Arc<dyn Bus>,
            2,
            1000,
            ingest_metrics.clone(),
        );

        let pipeline = Arc::new(Pipeline {
            auth: AuthCache::new(
                Arc::clone(&directory) as _,
                10_000,
                Duration::from_secs(60),
                ingest_metrics.clone(),
            ),
            limiter: Arc::new(RateLimiter::new()),
            keymap: KeyMapCache::new(
                Arc::clone(&directory) as _,
                5_000,
                Duration::from_secs(60),
                ingest_metrics.clone(),
            ),
            batch,
            fanout,
            routes: Arc::new(RouteTable::new()),
            quarantine: Arc::clone(&quarantine) as _,
            metrics: ingest_metrics.clone(),
            limits: Limits::default(),
        });

        Self {
            bus,
            channel,
            directory,
            sink,
            quarantine,
            pipeline,
            ingest_metrics,
            bridge_metrics: BridgeMetrics::default(),
            _writer: writer,
            _fanout_workers: fanout_workers,
        }
    }

    pub fn register_device(&self, tenant: &str, device: &str, tier: RateTier) {
        self.register_device_with_key_map(tenant, device, tier, HashMap::new());
    }

    pub fn register_device_with_key_map(
        &self,
        tenant: &str,
        device: &str,
        tier: RateTier,
        key_map: HashMap<String, String>,
    ) {
        self.directory.insert(
            tenant,
            device,
            MemoryDevice {
                auth: AuthRecord {
                    token_hash: hash_token("device-secret"),
                    token_active: true,
                    site_id: "plant-a".into(),
                    device_status: DeviceStatus::Online,
                    tenant_status: TenantStatus::Active,
                    tier,
                },
                key_map,
            },
        );
    }

    /// Simulate a device publish arriving at the broker and crossing the
    /// bridge onto the bus.
    pub async fn device_publish(&self, tenant: &str, device: &str, payload: serde_json::Value) {
        let publish = Publish::new(
            topics::telemetry(tenant, device),
            QoS::AtLeastOnce,
            serde_json::to_vec(&payload).unwrap(),
        );
        gp_bridge::handle_publish(
            &publish,
            self.channel.as_ref(),
            self.bus.as_ref(),
            &self.bridge_metrics,
        )
        .await;
    }

    /// Telemetry payload with the harness site and the current clock.
    pub fn payload(&self, metrics: serde_json::Value) -> serde_json::Value {
        self.payload_at(Utc::now().timestamp(), metrics)
    }

    pub fn payload_at(&self, ts: i64, metrics: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "version": "1",
            "ts": ts,
            "site_id": "plant-a",
            "metrics": metrics,
        })
    }

    /// Run ingest workers until the TELEMETRY stream shows `acked`
    /// decisively-handled messages, then stop them.
    pub async fn run_ingest_until_acked(&self, acked: usize) {
        let cancel = CancellationToken::new();
        let mut workers = Vec::new();
        for i in 0..2 {
            let consumer = self
                .bus
                .pull_consumer(StreamKind::Telemetry, "ingest", "telemetry.>")
                .await
                .unwrap();
            workers.push(tokio::spawn(run_worker(
                Arc::clone(&self.pipeline),
                consumer,
                cancel.clone(),
                i,
            )));
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while self.bus.acked_count(StreamKind::Telemetry, "ingest") < acked {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("expected messages to be decisively acked");

        cancel.cancel();
        for w in workers {
            w.await.unwrap();
        }
    }

    pub async fn wait_records(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.sink.records().len() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("expected records to be persisted");
    }
}
