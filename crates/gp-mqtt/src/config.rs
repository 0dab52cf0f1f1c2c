//! MQTT connection configuration.

use serde::Deserialize;

/// MQTT broker connection settings, loadable from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname (MQTT_BROKER_HOST, default "localhost").
    pub broker_host: String,
    /// Broker port (MQTT_BROKER_PORT, default 8883 for TLS).
    pub broker_port: u16,
    /// Client ID, unique per process instance (MQTT_CLIENT_ID).
    pub client_id: String,
    /// Enable TLS; plaintext is for local development only (MQTT_USE_TLS).
    pub use_tls: bool,
    /// Path to CA certificate PEM (MQTT_CA_CERT).
    pub ca_cert_path: String,
    /// Path to client certificate PEM for mTLS (MQTT_CLIENT_CERT).
    pub client_cert_path: String,
    /// Path to client private key PEM (MQTT_CLIENT_KEY).
    pub client_key_path: String,
    /// Keep-alive interval in seconds.
    pub keepalive_secs: u16,
}

fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

impl MqttConfig {
    pub fn from_env(default_client_id: &str) -> Self {
        let use_tls = env_bool("MQTT_USE_TLS");
        Self {
            broker_host: std::env::var("MQTT_BROKER_HOST").unwrap_or_else(|_| "localhost".into()),
            broker_port: std::env::var("MQTT_BROKER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(if use_tls { 8883 } else { 1883 }),
            client_id: std::env::var("MQTT_CLIENT_ID")
                .unwrap_or_else(|_| default_client_id.to_string()),
            use_tls,
            ca_cert_path: std::env::var("MQTT_CA_CERT").unwrap_or_default(),
            client_cert_path: std::env::var("MQTT_CLIENT_CERT").unwrap_or_default(),
            client_key_path: std::env::var("MQTT_CLIENT_KEY").unwrap_or_default(),
            keepalive_secs: 30,
        }
    }
}
