//! Bus subject naming for the durable streams.
//!
//! Each stream holds one subject per tenant so consumers can filter by
//! tenant (`telemetry.acme`) or take everything (`telemetry.>`).

use crate::envelope::MsgType;

/// Durable stream identity on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Telemetry,
    Shadow,
    Commands,
    Routes,
    Notify,
}

impl StreamKind {
    pub fn name(&self) -> &'static str {
        match self {
            StreamKind::Telemetry => "TELEMETRY",
            StreamKind::Shadow => "SHADOW",
            StreamKind::Commands => "COMMANDS",
            StreamKind::Routes => "ROUTES",
            StreamKind::Notify => "NOTIFY",
        }
    }

    /// Subject prefix for this stream.
    pub fn prefix(&self) -> &'static str {
        match self {
            StreamKind::Telemetry => "telemetry",
            StreamKind::Shadow => "shadow",
            StreamKind::Commands => "commands",
            StreamKind::Routes => "routes",
            StreamKind::Notify => "notify",
        }
    }

    /// Wildcard binding for the stream (`telemetry.*`).
    pub fn binding(&self) -> String {
        format!("{}.*", self.prefix())
    }

    /// Consumer filter matching every tenant (`telemetry.>`).
    pub fn filter_all(&self) -> String {
        format!("{}.>", self.prefix())
    }

    /// Subject for one tenant (`telemetry.acme`).
    pub fn subject(&self, tenant: &str) -> String {
        format!("{}.{tenant}", self.prefix())
    }
}

impl From<MsgType> for StreamKind {
    fn from(m: MsgType) -> Self {
        match m {
            MsgType::Telemetry => StreamKind::Telemetry,
            MsgType::Shadow => StreamKind::Shadow,
            MsgType::Command => StreamKind::Commands,
        }
    }
}

/// Extract the tenant from a subject like `telemetry.acme`.
pub fn tenant_of_subject(subject: &str) -> Option<&str> {
    subject.split_once('.').map(|(_, t)| t).filter(|t| !t.is_empty())
}
