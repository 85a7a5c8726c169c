use std::time::Duration;

use rumqttc::{MqttOptions, Transport};
use serde::{Deserialize, Serialize};

use super::topic::DEFAULT_MAX_TOPIC_LEN;

/// Broker connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub use_tls: bool,
    /// MQTT username; falls back to the verified identity's subject when empty
    pub username: String,
    /// MQTT password; the bearer token is sent instead when empty
    pub password: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub max_payload_bytes: usize,
    pub max_topic_len: usize,
    /// Capacity of the client request channel
    pub request_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            use_tls: false,
            username: String::new(),
            password: String::new(),
            client_id: "realtimemq".to_string(),
            keep_alive_secs: 30,
            max_payload_bytes: 256 * 1024,
            max_topic_len: DEFAULT_MAX_TOPIC_LEN,
            request_capacity: 100,
        }
    }
}

impl BrokerConfig {
    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options =
            MqttOptions::new(self.client_id.clone(), self.broker_host.clone(), self.broker_port);
        options
            .set_keep_alive(Duration::from_secs(self.keep_alive_secs))
            .set_clean_session(true);
        if !self.username.is_empty() {
            options.set_credentials(self.username.clone(), self.password.clone());
        }
        if self.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }

    pub fn limits(&self) -> PublishLimits {
        PublishLimits {
            max_payload_bytes: self.max_payload_bytes,
            max_topic_len: self.max_topic_len,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishLimits {
    pub max_payload_bytes: usize,
    pub max_topic_len: usize,
}

impl Default for PublishLimits {
    fn default() -> Self {
        BrokerConfig::default().limits()
    }
}

/// Reconnect and retry timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}
