//! NATS JetStream implementation of the bus.

use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{AckPolicy, pull::Config as PullConfig},
    stream::Config as StreamConfig,
};
use async_trait::async_trait;
use futures::StreamExt;

use gp_protocol::StreamKind;

use crate::MAX_DELIVER;
use crate::bus::{Bus, BusConsumer, BusMessage, MessageAcker};
use crate::config::BusConfig;
use crate::error::{BusError, BusResult};

/// Bus implementation on a JetStream-enabled NATS server.
pub struct JetStreamBus {
    context: jetstream::Context,
    op_timeout: Duration,
}

const ALL_STREAMS: [StreamKind; 5] = [
    StreamKind::Telemetry,
    StreamKind::Shadow,
    StreamKind::Commands,
    StreamKind::Routes,
    StreamKind::Notify,
];

impl JetStreamBus {
    /// Connect to NATS and provision the durable streams.
    pub async fn connect(config: &BusConfig) -> BusResult<Self> {
        tracing::info!(url = %config.url, "connecting to bus");
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        let context = jetstream::new(client);

        let bus = Self {
            context,
            op_timeout: Duration::from_secs(config.op_timeout_secs),
        };
        bus.ensure_streams(config).await?;
        tracing::info!("bus streams provisioned");
        Ok(bus)
    }

    async fn ensure_streams(&self, config: &BusConfig) -> BusResult<()> {
        for kind in ALL_STREAMS {
            let retention_hours = match kind {
                StreamKind::Routes => config.routes_retention_hours,
                _ => config.retention_hours,
            };
            let stream_config = StreamConfig {
                name: kind.name().to_string(),
                subjects: vec![kind.binding()],
                max_age: Duration::from_secs(retention_hours * 3600),
                duplicate_window: Duration::from_secs(120),
                ..Default::default()
            };
            self.context
                .get_or_create_stream(stream_config)
                .await
                .map_err(|e| BusError::Stream(format!("{}: {e}", kind.name())))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Bus for JetStreamBus {
    async fn publish_acked(&self, subject: &str, payload: &[u8]) -> BusResult<()> {
        let publish = self
            .context
            .publish(subject.to_string(), payload.to_vec().into());
        let ack_future = tokio::time::timeout(self.op_timeout, publish)
            .await
            .map_err(|_| BusError::Publish("publish timed out".into()))?
            .map_err(|e| BusError::Publish(e.to_string()))?;

        // The message is only durable once the server acks it.
        tokio::time::timeout(self.op_timeout, ack_future)
            .await
            .map_err(|_| BusError::Publish("publish ack timed out".into()))?
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn pull_consumer(
        &self,
        stream: StreamKind,
        durable: &str,
        filter: &str,
    ) -> BusResult<Box<dyn BusConsumer>> {
        let js_stream = self
            .context
            .get_stream(stream.name())
            .await
            .map_err(|e| BusError::Stream(format!("{}: {e}", stream.name())))?;

        let consumer = js_stream
            .get_or_create_consumer(
                durable,
                PullConfig {
                    durable_name: Some(durable.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    filter_subject: filter.to_string(),
                    max_deliver: MAX_DELIVER,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::Consume(e.to_string()))?;

        tracing::info!(stream = stream.name(), durable, filter, "pull consumer bound");
        Ok(Box::new(JetStreamConsumer { consumer }))
    }
}

struct JetStreamConsumer {
    consumer: jetstream::consumer::Consumer<PullConfig>,
}

#[async_trait]
impl BusConsumer for JetStreamConsumer {
    async fn fetch(&mut self, max: usize, wait: Duration) -> BusResult<Vec<BusMessage>> {
        let batch = self
            .consumer
            .fetch()
            .max_messages(max)
            .expires(wait)
            .messages()
            .await
            .map_err(|e| BusError::Consume(e.to_string()))?;

        let collected: Vec<_> = batch.collect().await;
        let mut out = Vec::with_capacity(collected.len());
        for item in collected {
            match item {
                Ok(msg) => {
                    let delivery_count = msg.info().map(|i| i.delivered as u64).unwrap_or(1);
                    let subject = msg.subject.to_string();
                    let payload = msg.payload.to_vec();
                    out.push(BusMessage::new(
                        subject,
                        payload,
                        delivery_count,
                        Box::new(JetStreamAcker { message: msg }),
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to receive bus message");
                }
            }
        }
        Ok(out)
    }
}

struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait]
impl MessageAcker for JetStreamAcker {
    async fn ack(&self) -> BusResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }

    async fn nak(&self, delay: Option<Duration>) -> BusResult<()> {
        self.message
            .ack_with(jetstream::AckKind::Nak(delay))
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }

    async fn term(&self) -> BusResult<()> {
        self.message
            .ack_with(jetstream::AckKind::Term)
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}
