//! Bus error types.

/// Errors surfaced by bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus connect failed: {0}")]
    Connect(String),

    #[error("stream provisioning failed: {0}")]
    Stream(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("ack failed: {0}")]
    Ack(String),
}

pub type BusResult<T> = Result<T, BusError>;
