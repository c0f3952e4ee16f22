//! Configuration sections for the broker and the MQTT bridge.

use std::time::Duration;

use serde::Deserialize;

use crate::secret::SecretString;

/// Primary AMQP broker: connection URL, management API and shared service account.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AmqpConfig {
    /// AMQP URI used by publishers and workers; its path is replaced with
    /// the pool name when a tenant-specific URL is built.
    pub url: String,
    /// Base URL of the HTTP management API, without the `/api` suffix.
    pub management_url: String,
    /// Shared service account; receives full permissions on every pool.
    pub username: String,
    pub password: SecretString,
    /// Host and port the bridge connectors use to reach the broker's MQTT plugin.
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub request_timeout_ms: u64,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            management_url: String::new(),
            username: String::new(),
            password: SecretString::default(),
            mqtt_host: "rabbitmq".to_owned(),
            mqtt_port: 1883,
            request_timeout_ms: 10_000,
        }
    }
}

impl AmqpConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// `host:port` of the broker's MQTT listener.
    #[must_use]
    pub fn mqtt_server(&self) -> String {
        format!("{}:{}", self.mqtt_host, self.mqtt_port)
    }
}

/// MQTT bridge broker REST API.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// When false the provisioner skips every bridge step.
    pub enabled: bool,
    /// Base URL of the REST API, e.g. `http://emqx:18083/api/v5`.
    pub api_url: String,
    pub username: String,
    pub password: SecretString,
    /// Rule ids are `<rule_prefix>_<sanitized pool>`.
    pub rule_prefix: String,
    /// Rule SQL template; the tenant filter is appended to it.
    pub rule_sql: String,
    pub request_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: String::new(),
            username: String::new(),
            password: SecretString::default(),
            rule_prefix: "rabbitmq_device_messages".to_owned(),
            rule_sql: r#"SELECT * FROM "tenant/+/device/data""#.to_owned(),
            request_timeout_ms: 10_000,
        }
    }
}

impl BridgeConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
