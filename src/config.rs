use color_eyre::eyre::eyre;
use color_eyre::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::{CredentialProvider, HmacTokenVerifier, IssuingCredential, StaticCredential, TokenIssuer};
use crate::error::RelayError;
use crate::mqtt::config::{BackoffConfig, BrokerConfig};
use crate::mqtt::message_manager::qos_from_level;
use crate::mqtt::mqtt_handler::ManagerSettings;
use crate::notification::NotifyConfig;

pub const CONFIG_ENV: &str = "REALTIMEMQ_CONFIG";
const APP_DIR: &str = "realtimemq";
const CONFIG_FILE: &str = "config.toml";
const DB_FILE: &str = "messages.db";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub broker: BrokerConfig,
    pub backoff: BackoffConfig,
    pub gateway: GatewayConfig,
    pub notify: NotifyConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Publishes held while the broker is unreachable
    pub buffer_capacity: usize,
    pub shutdown_grace_ms: u64,
    pub ack_timeout_ms: u64,
    pub persistence_workers: usize,
    pub inbound_partitions: usize,
    /// Queue depth of each inbound partition
    pub inbound_capacity: usize,
    pub reconcile_max_attempts: u32,
    pub subscribe_active_topics_on_start: bool,
    pub default_qos: u8,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1_000,
            shutdown_grace_ms: 5_000,
            ack_timeout_ms: 10_000,
            persistence_workers: 4,
            inbound_partitions: 4,
            inbound_capacity: 256,
            reconcile_max_attempts: 5,
            subscribe_active_topics_on_start: true,
            default_qos: 1,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let mut db_path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        db_path.push(APP_DIR);
        db_path.push(DB_FILE);
        Self { db_path }
    }
}

#[derive(Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC key shared with the broker's auth hook
    pub secret: String,
    /// Externally issued bearer token; a fresh token is minted per attempt when unset
    pub token: Option<String>,
    pub subject: String,
    pub token_ttl_secs: u64,
    /// Revoked token ids
    pub revoked: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            token: None,
            subject: APP_DIR.to_string(),
            token_ttl_secs: 300,
            revoked: Vec::new(),
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"***")
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("subject", &self.subject)
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("revoked", &self.revoked.len())
            .finish()
    }
}

impl AuthConfig {
    pub fn verifier(&self) -> HmacTokenVerifier {
        HmacTokenVerifier::new(self.secret.as_bytes().to_vec()).with_revoked(self.revoked.clone())
    }

    pub fn provider(&self) -> Arc<dyn CredentialProvider> {
        match &self.token {
            Some(token) => Arc::new(StaticCredential::new(token.clone())),
            None => Arc::new(IssuingCredential::new(
                TokenIssuer::new(self.secret.as_bytes().to_vec()),
                self.subject.clone(),
                Duration::from_secs(self.token_ttl_secs),
            )),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> tracing::Level {
        self.level.parse().unwrap_or_else(|_| {
            warn!("Unknown log level '{}', using info", self.level);
            tracing::Level::INFO
        })
    }
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(eyre!("{} must be a boolean, got '{}'", name, other)),
    }
}

fn get_config_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        })
}

pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    let mut path = get_config_dir();
    path.push(APP_DIR);
    path.push(CONFIG_FILE);
    path
}

impl RelayConfig {
    pub fn default_qos(&self) -> rumqttc::QoS {
        qos_from_level(self.gateway.default_qos).unwrap_or(rumqttc::QoS::AtLeastOnce)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.gateway.shutdown_grace_ms)
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            buffer_capacity: self.gateway.buffer_capacity,
            ack_timeout: Duration::from_millis(self.gateway.ack_timeout_ms),
            inbound_partitions: self.gateway.inbound_partitions,
            inbound_capacity: self.gateway.inbound_capacity,
            subscribe_qos: self.default_qos(),
            backoff: self.backoff.clone(),
            username: self.broker.username.clone(),
            password: self.broker.password.clone(),
        }
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config: RelayConfig = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Default path, default file on first run, environment overrides, validation.
    pub async fn load() -> Result<Self> {
        let path = default_config_path();
        ensure_default_config(&path).await?;
        let mut config = Self::load_from(&path).await?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;
        Ok(())
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_BROKER") {
            self.broker.broker_host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.broker.broker_port = port
                .trim()
                .parse()
                .map_err(|e| eyre!("MQTT_PORT must be a port number: {}", e))?;
        }
        if let Some(user) = lookup("MQTT_USER") {
            self.broker.username = user;
        }
        if let Some(pass) = lookup("MQTT_PASS") {
            self.broker.password = pass;
        }
        if let Some(tls) = lookup("MQTT_USE_TLS") {
            self.broker.use_tls = parse_flag("MQTT_USE_TLS", &tls)?;
        }
        if let Some(auto) = lookup("MQTT_AUTO_START") {
            self.gateway.subscribe_active_topics_on_start = parse_flag("MQTT_AUTO_START", &auto)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        let fail = |msg: &str| Err(RelayError::Config(msg.to_string()));
        if self.broker.broker_host.trim().is_empty() {
            return fail("broker.broker_host must not be empty");
        }
        if self.broker.broker_port == 0 {
            return fail("broker.broker_port must not be 0");
        }
        if self.broker.keep_alive_secs < 5 {
            return fail("broker.keep_alive_secs must be at least 5");
        }
        if self.broker.max_payload_bytes == 0 || self.broker.max_topic_len == 0 {
            return fail("broker payload and topic limits must be positive");
        }
        if self.broker.request_capacity == 0 {
            return fail("broker.request_capacity must be positive");
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return fail("backoff.jitter must be between 0.0 and 1.0");
        }
        if self.backoff.multiplier < 1.0 {
            return fail("backoff.multiplier must be at least 1.0");
        }
        if self.backoff.initial_ms == 0 || self.backoff.max_ms < self.backoff.initial_ms {
            return fail("backoff.initial_ms must be positive and not above backoff.max_ms");
        }
        let gateway = &self.gateway;
        if gateway.buffer_capacity == 0
            || gateway.persistence_workers == 0
            || gateway.inbound_partitions == 0
            || gateway.inbound_capacity == 0
            || gateway.reconcile_max_attempts == 0
        {
            return fail("gateway capacities and worker counts must be positive");
        }
        if qos_from_level(gateway.default_qos).is_none() {
            return fail("gateway.default_qos must be 0, 1 or 2");
        }
        if self.notify.prefix.trim_matches('/').is_empty() {
            return fail("notify.prefix must not be empty");
        }
        if self.auth.secret.is_empty() {
            return fail("auth.secret must be set");
        }
        if self.auth.token.is_none() && self.auth.token_ttl_secs == 0 {
            return fail("auth.token_ttl_secs must be positive");
        }
        Ok(())
    }
}

/// Writes a default configuration with a fresh signing secret if none exists.
pub async fn ensure_default_config(path: &Path) -> Result<()> {
    if tokio::fs::try_exists(path)
        .await
        .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
    {
        return Ok(());
    }

    info!("Creating default configuration at {}", path.display());
    let mut config = RelayConfig::default();
    let secret: [u8; 32] = rand::thread_rng().gen();
    config.auth.secret = hex::encode(secret);
    config.save_to(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.auth.secret = "s3cret".into();
        config
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: RelayConfig = toml::from_str(
            r#"
            [broker]
            broker_host = "mqtt.example.com"
            use_tls = true

            [notify]
            broadcast_copy = false
            "#,
        )
        .unwrap();
        assert_eq!(config.broker.broker_host, "mqtt.example.com");
        assert_eq!(config.broker.broker_port, 1883);
        assert!(config.broker.use_tls);
        assert_eq!(config.notify.prefix, "notify");
        assert!(!config.notify.broadcast_copy);
        assert_eq!(config.gateway, GatewayConfig::default());
    }

    #[test]
    fn environment_overrides_broker_settings() {
        let env: HashMap<&str, &str> = [
            ("MQTT_BROKER", "broker.local"),
            ("MQTT_PORT", "8883"),
            ("MQTT_USER", "relay"),
            ("MQTT_PASS", "pw"),
            ("MQTT_USE_TLS", "true"),
            ("MQTT_AUTO_START", "0"),
        ]
        .into_iter()
        .collect();
        let mut config = valid();
        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.broker.broker_host, "broker.local");
        assert_eq!(config.broker.broker_port, 8883);
        assert_eq!(config.broker.username, "relay");
        assert!(config.broker.use_tls);
        assert!(!config.gateway.subscribe_active_topics_on_start);
    }

    #[test]
    fn bad_environment_values_are_errors() {
        let mut config = valid();
        assert!(config
            .apply_env_overrides(|key| (key == "MQTT_PORT").then(|| "http".to_string()))
            .is_err());
        assert!(config
            .apply_env_overrides(|key| (key == "MQTT_USE_TLS").then(|| "maybe".to_string()))
            .is_err());
    }

    #[test]
    fn validation_rejects_unusable_values() {
        assert!(valid().validate().is_ok());
        assert!(RelayConfig::default().validate().is_err());

        let mut config = valid();
        config.backoff.jitter = 1.5;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.gateway.buffer_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.broker.broker_port = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.broker.keep_alive_secs = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn log_level_parses_with_fallback() {
        let mut logging = LoggingConfig::default();
        assert_eq!(logging.level(), tracing::Level::INFO);
        logging.level = "debug".into();
        assert_eq!(logging.level(), tracing::Level::DEBUG);
        logging.level = "chatty".into();
        assert_eq!(logging.level(), tracing::Level::INFO);
    }

    #[tokio::test]
    async fn default_config_is_written_once_with_a_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("realtimemq").join("config.toml");

        ensure_default_config(&path).await.unwrap();
        let first = RelayConfig::load_from(&path).await.unwrap();
        assert_eq!(first.auth.secret.len(), 64);
        assert!(first.validate().is_ok());

        ensure_default_config(&path).await.unwrap();
        let second = RelayConfig::load_from(&path).await.unwrap();
        assert_eq!(first.auth.secret, second.auth.secret);
    }
}
