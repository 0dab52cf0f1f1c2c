//! The ingest pipeline: one envelope in, one admission decision out.
//!
//! Stage order: size/shape → device auth (+ first-contact provisioning) →
//! subscription standing → payload validation → tenant-then-device rate
//! limit → metric-key normalization → batch enqueue + route fan-out.
//!
//! Decisive rejections are quarantined and acked; rate-limited records
//! are dropped with a counter and acked (the device retries); transient
//! dependency failures bubble out so the bus redelivers.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use gp_bus::{BusConsumer, BusMessage};
use gp_protocol::{
    DeliveryJob, Envelope, MsgType, PayloadBody, QuarantineReason, TelemetryRecord,
    tenant_of_subject,
};

use crate::auth::{AuthCache, AuthDecision};
use crate::batch::{BatchWriterHandle, EnqueueError};
use crate::fanout::{FanoutHandle, MAX_DELIVERY_ATTEMPTS, RouteTable};
use crate::metrics::IngestMetrics;
use crate::normalize::KeyMapCache;
use crate::ratelimit::RateLimiter;
use crate::sinks::QuarantineSink;
use crate::validate::{Limits, validate_payload};

/// Admission decision for one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    Rejected(QuarantineReason),
    RateLimited,
    /// Batch queue full on the non-blocking path (HTTP 503).
    Backpressure,
}

/// A dependency failed transiently; the message must stay on the bus.
#[derive(Debug, thiserror::Error)]
#[error("transient pipeline failure: {0}")]
pub struct PipelineError(pub String);

/// Everything one envelope needs, wired once at boot.
pub struct Pipeline {
    pub auth: AuthCache,
    pub limiter: Arc<RateLimiter>,
    pub keymap: KeyMapCache,
    pub batch: BatchWriterHandle,
    pub fanout: FanoutHandle,
    pub routes: Arc<RouteTable>,
    pub quarantine: Arc<dyn QuarantineSink>,
    pub metrics: IngestMetrics,
    pub limits: Limits,
}

impl Pipeline {
    /// Run the full pipeline for one envelope.
    ///
    /// `presented_secret` carries the HTTP bearer secret; the bridged
    /// path passes `None` (the broker already authenticated transport).
    /// `blocking_enqueue` selects await-for-space (bus path) versus
    /// fail-fast 503 (HTTP path).
    pub async fn process(
        &self,
        envelope: &Envelope,
        presented_secret: Option<&str>,
        blocking_enqueue: bool,
    ) -> Result<IngestOutcome, PipelineError> {
        if envelope.msg_type != MsgType::Telemetry {
            return self
                .reject(envelope, QuarantineReason::EnvelopeMalformed)
                .await;
        }

        // Size gate first: an oversized blob must not reach the parser.
        if envelope.payload.approx_len() > self.limits.max_payload_bytes {
            return self
                .reject(envelope, QuarantineReason::PayloadTooLarge)
                .await;
        }
        let PayloadBody::Object(map) = &envelope.payload else {
            return self
                .reject(envelope, QuarantineReason::EnvelopeMalformed)
                .await;
        };
        let provision_token = map
            .get("provision_token")
            .and_then(|v| v.as_str())
            .map(String::from);
        let site_hint = map
            .get("site_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        // Stage 2-3: device auth, provisioning, tenant standing.
        let auth = match self
            .auth
            .authorize(
                &envelope.tenant,
                &envelope.device,
                &site_hint,
                provision_token.as_deref(),
                presented_secret,
            )
            .await
            .map_err(|e| PipelineError(e.to_string()))?
        {
            AuthDecision::Ok(ok) => ok,
            AuthDecision::Reject(reason) => return self.reject(envelope, reason).await,
        };

        // Stage 4: payload validation against the registered site.
        let now = Utc::now();
        let (payload, time) = match validate_payload(envelope, &auth.site_id, &self.limits, now) {
            Ok(parsed) => parsed,
            Err(reason) => return self.reject(envelope, reason).await,
        };

        // Stage 5: admission. Dropped, counted, acked; never quarantined.
        if !self
            .limiter
            .try_admit(&envelope.tenant, &envelope.device, &auth.tier)
        {
            self.metrics.messages_total.inc("rate_limited");
            tracing::debug!(
                tenant = %envelope.tenant,
                device = %envelope.device,
                "record rate limited"
            );
            return Ok(IngestOutcome::RateLimited);
        }

        // Stage 6: metric-key normalization.
        let metrics = self
            .keymap
            .normalize(&envelope.tenant, &envelope.device, payload.metrics)
            .await
            .map_err(|e| PipelineError(e.to_string()))?;

        let record = TelemetryRecord {
            tenant: envelope.tenant.clone(),
            device_id: envelope.device.clone(),
            site_id: auth.site_id.clone(),
            time,
            seq: payload.seq.or(envelope.seq),
            metrics,
        };

        // Stage 7: hand off to the batch writer, then fan out.
        let delivery_payload = serde_json::json!({
            "tenant": record.tenant,
            "device": record.device_id,
            "site_id": record.site_id,
            "ts": record.time.timestamp(),
            "seq": record.seq,
            "metrics": record.metrics,
        });

        if blocking_enqueue {
            self.batch
                .enqueue(record)
                .await
                .map_err(|e| PipelineError(e.to_string()))?;
        } else {
            match self.batch.try_enqueue(record) {
                Ok(()) => {}
                Err(EnqueueError::Full) => return Ok(IngestOutcome::Backpressure),
                Err(e @ EnqueueError::Closed) => return Err(PipelineError(e.to_string())),
            }
        }

        for route in self
            .routes
            .matching(&envelope.tenant, &envelope.topic, &delivery_payload)
        {
            self.fanout.enqueue(DeliveryJob {
                tenant: envelope.tenant.clone(),
                route_id: route.route_id,
                topic: envelope.topic.clone(),
                payload: delivery_payload.clone(),
                attempt: 1,
                max_attempts: MAX_DELIVERY_ATTEMPTS,
            });
        }

        self.metrics.messages_total.inc("accepted");
        Ok(IngestOutcome::Accepted)
    }

    async fn reject(
        &self,
        envelope: &Envelope,
        reason: QuarantineReason,
    ) -> Result<IngestOutcome, PipelineError> {
        let raw = envelope.to_bytes().unwrap_or_default();
        self.quarantine
            .quarantine(
                &envelope.tenant,
                Some(&envelope.device),
                reason,
                &raw,
                envelope.received_at,
            )
            .await
            .map_err(|e| PipelineError(e.to_string()))?;
        self.metrics.messages_total.inc("rejected");
        tracing::info!(
            tenant = %envelope.tenant,
            device = %envelope.device,
            reason = %reason,
            "record quarantined"
        );
        Ok(IngestOutcome::Rejected(reason))
    }
}

/// Consume the telemetry stream with one worker.
///
/// Ack discipline: every decisive outcome (accepted, rejected,
/// rate-limited) acks after the record is enqueued or quarantined; a
/// transient failure naks with a short delay so the bus redelivers up to
/// its cap. Cancellation is checked between fetches; the in-hand batch is
/// always finished first.
pub async fn run_worker(
    pipeline: Arc<Pipeline>,
    mut consumer: Box<dyn BusConsumer>,
    cancel: CancellationToken,
    worker: usize,
) {
    tracing::info!(worker, "ingest worker started");
    loop {
        let fetched = tokio::select! {
            r = consumer.fetch(16, std::time::Duration::from_millis(500)) => r,
            () = cancel.cancelled() => break,
        };
        match fetched {
            Ok(batch) if batch.is_empty() => {
                // Idle pacing; the fetch wait already bounds latency on a
                // real bus, this covers consumers that return immediately.
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
            Ok(batch) => {
                for msg in batch {
                    handle_message(&pipeline, msg).await;
                }
            }
            Err(e) => {
                tracing::warn!(worker, error = %e, "bus fetch failed");
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
        }
        if cancel.is_cancelled() {
            break;
        }
    }
    tracing::info!(worker, "ingest worker stopped");
}

async fn handle_message(pipeline: &Pipeline, msg: BusMessage) {
    let envelope = match Envelope::from_bytes(&msg.payload) {
        Ok(env) => env,
        Err(e) => {
            // No parseable envelope; fall back to the subject's tenant so
            // the reject still lands in the right quarantine partition.
            let tenant = tenant_of_subject(&msg.subject).unwrap_or("unknown").to_string();
            tracing::warn!(subject = %msg.subject, error = %e, "undecodable envelope");
            let _ = pipeline
                .quarantine
                .quarantine(
                    &tenant,
                    None,
                    QuarantineReason::EnvelopeMalformed,
                    &msg.payload,
                    Utc::now(),
                )
                .await;
            pipeline.metrics.messages_total.inc("rejected");
            let _ = msg.ack().await;
            return;
        }
    };

    match pipeline.process(&envelope, None, true).await {
        Ok(_) => {
            if let Err(e) = msg.ack().await {
                tracing::warn!(error = %e, "ack failed");
            }
        }
        Err(e) => {
            tracing::warn!(
                tenant = %envelope.tenant,
                device = %envelope.device,
                delivery = msg.delivery_count,
                error = %e,
                "transient failure, leaving message for redelivery"
            );
            let _ = msg.nak(Some(std::time::Duration::from_secs(1))).await;
        }
    }
}
