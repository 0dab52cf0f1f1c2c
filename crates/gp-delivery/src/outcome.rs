//! Delivery outcome classification.

use std::time::Duration;

/// What happened to one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Transient: leave the message for bus redelivery, optionally after
    /// a server-requested delay.
    Retry(Option<Duration>),
    /// Permanent: acknowledge and dead-letter.
    Terminal(String),
}

/// Classify an HTTP response status for webhook/object-storage sinks.
///
/// 2xx succeeds; 5xx and 429 are retryable (429 honours Retry-After up
/// to `retry_after_cap`); any other 4xx is terminal.
pub fn classify_http_status(
    status: u16,
    retry_after_secs: Option<u64>,
    retry_after_cap: Duration,
) -> DeliveryOutcome {
    match status {
        200..=299 => DeliveryOutcome::Delivered,
        429 => {
            let delay = retry_after_secs
                .map(Duration::from_secs)
                .map(|d| d.min(retry_after_cap));
            DeliveryOutcome::Retry(delay)
        }
        500..=599 => DeliveryOutcome::Retry(None),
        other => DeliveryOutcome::Terminal(format!("http status {other}")),
    }
}
