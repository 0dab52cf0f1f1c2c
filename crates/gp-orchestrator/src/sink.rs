//! Notification handoff sinks.
//!
//! The orchestrator only guarantees at-least-once production of
//! notification jobs; composing message content and delivering to chat,
//! mail, or paging providers is a downstream concern.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use gp_bus::Bus;
use gp_protocol::{NotificationJob, StreamKind};

#[derive(Debug, Clone, thiserror::Error)]
#[error("notification handoff failed: {0}")]
pub struct NotificationError(pub String);

/// Where produced notification jobs go.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn produce(&self, job: &NotificationJob) -> Result<(), NotificationError>;
}

/// Publishes jobs to the NOTIFY stream with a durable ack.
pub struct BusNotificationSink {
    bus: Arc<dyn Bus>,
}

impl BusNotificationSink {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl NotificationSink for BusNotificationSink {
    async fn produce(&self, job: &NotificationJob) -> Result<(), NotificationError> {
        let subject = StreamKind::Notify.subject(&job.tenant);
        let bytes = serde_json::to_vec(job).map_err(|e| NotificationError(e.to_string()))?;
        self.bus
            .publish_acked(&subject, &bytes)
            .await
            .map_err(|e| NotificationError(e.to_string()))
    }
}

/// In-memory sink recording produced jobs for tests.
#[derive(Default)]
pub struct MemorySink {
    jobs: Mutex<Vec<NotificationJob>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<NotificationJob> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn produce(&self, job: &NotificationJob) -> Result<(), NotificationError> {
        self.jobs.lock().unwrap().push(job.clone());
        Ok(())
    }
}
