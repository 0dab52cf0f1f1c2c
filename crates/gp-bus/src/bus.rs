//! Bus abstraction: acknowledged publish plus durable pull consumers.

use std::time::Duration;

use async_trait::async_trait;

use gp_protocol::StreamKind;

use crate::error::BusResult;

/// Abstraction over the durable message bus.
///
/// Enables running pipelines against `MockBus` in tests without a broker.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish and wait for the durable ack before returning.
    async fn publish_acked(&self, subject: &str, payload: &[u8]) -> BusResult<()>;

    /// Create (or bind to) a durable pull consumer on a stream.
    async fn pull_consumer(
        &self,
        stream: StreamKind,
        durable: &str,
        filter: &str,
    ) -> BusResult<Box<dyn BusConsumer>>;
}

/// A durable pull consumer handle.
#[async_trait]
pub trait BusConsumer: Send {
    /// Fetch up to `max` messages, waiting at most `wait` for the first.
    async fn fetch(&mut self, max: usize, wait: Duration) -> BusResult<Vec<BusMessage>>;
}

/// Per-message acknowledgement handle.
#[async_trait]
pub trait MessageAcker: Send + Sync {
    async fn ack(&self) -> BusResult<()>;
    /// Negative-ack: redeliver, optionally after a delay.
    async fn nak(&self, delay: Option<Duration>) -> BusResult<()>;
    /// Terminate: never redeliver.
    async fn term(&self) -> BusResult<()>;
}

/// One consumed message with its delivery metadata.
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    /// 1-based delivery attempt for this consumer.
    pub delivery_count: u64,
    acker: Box<dyn MessageAcker>,
}

impl BusMessage {
    pub fn new(
        subject: String,
        payload: Vec<u8>,
        delivery_count: u64,
        acker: Box<dyn MessageAcker>,
    ) -> Self {
        Self {
            subject,
            payload,
            delivery_count,
            acker,
        }
    }

    pub async fn ack(&self) -> BusResult<()> {
        self.acker.ack().await
    }

    pub async fn nak(&self, delay: Option<Duration>) -> BusResult<()> {
        self.acker.nak(delay).await
    }

    pub async fn term(&self) -> BusResult<()> {
        self.acker.term().await
    }
}

impl std::fmt::Debug for BusMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusMessage")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

/// NATS-style subject filter match: `*` matches one token, a trailing `>`
/// matches the remainder.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_parts = filter.split('.').peekable();
    let mut subject_parts = subject.split('.');

    loop {
        match (filter_parts.next(), subject_parts.next()) {
            (Some(">"), _) => return filter_parts.peek().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
