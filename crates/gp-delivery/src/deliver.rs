//! Destination execution: webhook POST, MQTT republish, object storage.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::QoS;

use gp_mqtt::Channel;
use gp_protocol::{DeliveryJob, Destination};

use crate::outcome::{DeliveryOutcome, classify_http_status};

/// Executes one delivery attempt against a destination.
pub struct Executor {
    http: reqwest::Client,
    mqtt: Option<Arc<dyn Channel>>,
    retry_after_cap: Duration,
}

impl Executor {
    pub fn new(
        http_timeout: Duration,
        retry_after_cap: Duration,
        mqtt: Option<Arc<dyn Channel>>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            mqtt,
            retry_after_cap,
        }
    }

    pub async fn deliver(&self, destination: &Destination, job: &DeliveryJob) -> DeliveryOutcome {
        match destination {
            Destination::Webhook { url } => self.post_json(url, job).await,
            Destination::ObjectStorage { endpoint, prefix } => {
                // Key layout: prefix/topic with path separators preserved.
                let url = format!(
                    "{}/{}/{}",
                    endpoint.trim_end_matches('/'),
                    prefix.trim_matches('/'),
                    job.topic
                );
                self.put_json(&url, job).await
            }
            Destination::MqttRepublish { topic } => self.republish(topic, job).await,
        }
    }

    async fn post_json(&self, url: &str, job: &DeliveryJob) -> DeliveryOutcome {
        match self.http.post(url).json(&job.payload).send().await {
            Ok(resp) => self.classify(resp),
            // Connection refused, DNS failure, timeout: all retryable.
            Err(e) => {
                tracing::warn!(url, error = %e, "webhook request failed");
                DeliveryOutcome::Retry(None)
            }
        }
    }

    async fn put_json(&self, url: &str, job: &DeliveryJob) -> DeliveryOutcome {
        match self.http.put(url).json(&job.payload).send().await {
            Ok(resp) => self.classify(resp),
            Err(e) => {
                tracing::warn!(url, error = %e, "object storage put failed");
                DeliveryOutcome::Retry(None)
            }
        }
    }

    fn classify(&self, resp: reqwest::Response) -> DeliveryOutcome {
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        classify_http_status(resp.status().as_u16(), retry_after, self.retry_after_cap)
    }

    async fn republish(&self, topic: &str, job: &DeliveryJob) -> DeliveryOutcome {
        let Some(mqtt) = &self.mqtt else {
            return DeliveryOutcome::Terminal("no mqtt channel configured".into());
        };
        let bytes = match serde_json::to_vec(&job.payload) {
            Ok(b) => b,
            Err(e) => return DeliveryOutcome::Terminal(format!("unserializable payload: {e}")),
        };
        match mqtt.publish(topic, &bytes, QoS::AtLeastOnce).await {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(e) => {
                tracing::warn!(topic, error = %e, "mqtt republish failed");
                DeliveryOutcome::Retry(None)
            }
        }
    }
}
