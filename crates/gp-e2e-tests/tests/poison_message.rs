//! Poison-message handling: an oversized payload is quarantined exactly
//! once with no retry storm.

mod helpers;

use gp_bus::{Bus, BusConsumer};
use gp_protocol::{QuarantineReason, RateTier, StreamKind};
use helpers::TestHarness;

#[tokio::test]
async fn oversized_payload_quarantines_once() {
    let h = TestHarness::new();
    h.register_device("acme", "d1", RateTier::default());

    // ~8 MB of metric blob, far over the admission limit.
    let blob = "x".repeat(8 * 1024 * 1024);
    h.device_publish("acme", "d1", h.payload(serde_json::json!({"blob": blob})))
        .await;

    h.run_ingest_until_acked(1).await;

    assert_eq!(
        h.quarantine.count_with_reason(QuarantineReason::PayloadTooLarge),
        1
    );
    assert_eq!(
        h.ingest_metrics.messages_total.get("rejected"),
        1,
        "rejected counter must increment exactly once"
    );
    assert!(h.sink.records().is_empty());

    // Acked decisively: the bus has nothing left to redeliver.
    assert_eq!(h.bus.acked_count(StreamKind::Telemetry, "ingest"), 1);
    let mut consumer = h
        .bus
        .pull_consumer(StreamKind::Telemetry, "ingest", "telemetry.>")
        .await
        .unwrap();
    let leftover = consumer
        .fetch(16, std::time::Duration::from_millis(10))
        .await
        .unwrap();
    assert!(leftover.is_empty(), "no retry storm after quarantine");
}

#[tokio::test]
async fn malformed_payload_quarantines_with_reason() {
    let h = TestHarness::new();
    h.register_device("acme", "d1", RateTier::default());

    // Missing ts and site_id entirely.
    h.device_publish("acme", "d1", serde_json::json!({"unexpected": true}))
        .await;
    h.run_ingest_until_acked(1).await;

    assert_eq!(
        h.quarantine
            .count_with_reason(QuarantineReason::EnvelopeMalformed),
        1
    );
    // Forensics keep the raw envelope bytes.
    let entries = h.quarantine.entries();
    assert!(!entries[0].raw_payload.is_empty());
    assert_eq!(entries[0].tenant, "acme");
}
