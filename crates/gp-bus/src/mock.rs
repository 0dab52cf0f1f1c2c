//! In-memory bus for testing without a broker.
//!
//! Faithful to the consumer contract: explicit acks, per-durable delivery
//! counting, nak-with-delay visibility, and the `MAX_DELIVER` redelivery
//! cap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use gp_protocol::StreamKind;

use crate::MAX_DELIVER;
use crate::bus::{Bus, BusConsumer, BusMessage, MessageAcker, subject_matches};
use crate::error::{BusError, BusResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryStatus {
    Pending,
    InFlight,
    Acked,
    Termed,
}

#[derive(Debug)]
struct DeliveryState {
    deliveries: u64,
    status: DeliveryStatus,
    visible_after: Option<Instant>,
}

impl Default for DeliveryState {
    fn default() -> Self {
        Self {
            deliveries: 0,
            status: DeliveryStatus::Pending,
            visible_after: None,
        }
    }
}

#[derive(Debug)]
struct Stored {
    subject: String,
    payload: Vec<u8>,
    /// Per-durable delivery bookkeeping.
    consumers: HashMap<String, DeliveryState>,
}

type SharedStored = Arc<Mutex<Stored>>;

#[derive(Default)]
struct State {
    streams: HashMap<&'static str, Vec<SharedStored>>,
    fail_publish: bool,
}

/// Mock implementation of the [`Bus`] trait.
///
/// Stores published messages per stream and hands out consumers that
/// honour ack/nak/term and the redelivery cap.
#[derive(Clone)]
pub struct MockBus {
    state: Arc<Mutex<State>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Make subsequent publishes fail, to exercise producer error paths.
    pub fn set_fail_publish(&self, fail: bool) {
        self.state.lock().unwrap().fail_publish = fail;
    }

    /// All messages published to a stream, as `(subject, payload)` pairs.
    pub fn published(&self, stream: StreamKind) -> Vec<(String, Vec<u8>)> {
        let state = self.state.lock().unwrap();
        state
            .streams
            .get(stream.name())
            .map(|msgs| {
                msgs.iter()
                    .map(|m| {
                        let m = m.lock().unwrap();
                        (m.subject.clone(), m.payload.clone())
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of messages a durable has fully acknowledged on a stream.
    pub fn acked_count(&self, stream: StreamKind, durable: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .streams
            .get(stream.name())
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| {
                        m.lock()
                            .unwrap()
                            .consumers
                            .get(durable)
                            .is_some_and(|d| d.status == DeliveryStatus::Acked)
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    fn stream_for_subject(subject: &str) -> Option<StreamKind> {
        [
            StreamKind::Telemetry,
            StreamKind::Shadow,
            StreamKind::Commands,
            StreamKind::Routes,
            StreamKind::Notify,
        ]
        .into_iter()
        .find(|k| subject_matches(&k.filter_all(), subject))
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MockBus {
    async fn publish_acked(&self, subject: &str, payload: &[u8]) -> BusResult<()> {
        let stream = Self::stream_for_subject(subject)
            .ok_or_else(|| BusError::Publish(format!("no stream for subject {subject}")))?;

        let mut state = self.state.lock().unwrap();
        if state.fail_publish {
            return Err(BusError::Publish("mock publish failure".into()));
        }
        state
            .streams
            .entry(stream.name())
            .or_default()
            .push(Arc::new(Mutex::new(Stored {
                subject: subject.to_string(),
                payload: payload.to_vec(),
                consumers: HashMap::new(),
            })));
        Ok(())
    }

    async fn pull_consumer(
        &self,
        stream: StreamKind,
        durable: &str,
        filter: &str,
    ) -> BusResult<Box<dyn BusConsumer>> {
        Ok(Box::new(MockConsumer {
            state: Arc::clone(&self.state),
            stream: stream.name(),
            durable: durable.to_string(),
            filter: filter.to_string(),
        }))
    }
}

struct MockConsumer {
    state: Arc<Mutex<State>>,
    stream: &'static str,
    durable: String,
    filter: String,
}

#[async_trait]
impl BusConsumer for MockConsumer {
    async fn fetch(&mut self, max: usize, _wait: Duration) -> BusResult<Vec<BusMessage>> {
        let now = Instant::now();
        let stored: Vec<SharedStored> = {
            let state = self.state.lock().unwrap();
            state
                .streams
                .get(self.stream)
                .map(|v| v.clone())
                .unwrap_or_default()
        };

        let mut out = Vec::new();
        for entry in stored {
            if out.len() >= max {
                break;
            }
            let mut msg = entry.lock().unwrap();
            if !subject_matches(&self.filter, &msg.subject) {
                continue;
            }
            let delivery = msg.consumers.entry(self.durable.clone()).or_default();
            let visible = delivery.visible_after.is_none_or(|t| t <= now);
            if delivery.status != DeliveryStatus::Pending
                || !visible
                || delivery.deliveries >= MAX_DELIVER as u64
            {
                continue;
            }
            delivery.deliveries += 1;
            delivery.status = DeliveryStatus::InFlight;
            let delivery_count = delivery.deliveries;
            let subject = msg.subject.clone();
            let payload = msg.payload.clone();
            drop(msg);

            out.push(BusMessage::new(
                subject,
                payload,
                delivery_count,
                Box::new(MockAcker {
                    stored: entry,
                    durable: self.durable.clone(),
                }),
            ));
        }
        Ok(out)
    }
}

struct MockAcker {
    stored: SharedStored,
    durable: String,
}

impl MockAcker {
    fn set(&self, status: DeliveryStatus, visible_after: Option<Instant>) {
        let mut msg = self.stored.lock().unwrap();
        if let Some(d) = msg.consumers.get_mut(&self.durable) {
            d.status = status;
            d.visible_after = visible_after;
        }
    }
}

#[async_trait]
impl MessageAcker for MockAcker {
    async fn ack(&self) -> BusResult<()> {
        self.set(DeliveryStatus::Acked, None);
        Ok(())
    }

    async fn nak(&self, delay: Option<Duration>) -> BusResult<()> {
        self.set(
            DeliveryStatus::Pending,
            delay.map(|d| Instant::now() + d),
        );
        Ok(())
    }

    async fn term(&self) -> BusResult<()> {
        self.set(DeliveryStatus::Termed, None);
        Ok(())
    }
}
