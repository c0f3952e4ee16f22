//! Layered application configuration.
//!
//! Sources, lowest precedence first: serde defaults, an optional YAML file,
//! then `TENANTBUS__*` environment variables with `__` separating nested keys
//! (`TENANTBUS__AMQP__MANAGEMENT_URL` sets `amqp.management_url`).

use std::path::{Path, PathBuf};

use broker_admin::{AmqpConfig, BridgeConfig};
use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use replication::ReplicationConfig;
use serde::Deserialize;
use tenant_provisioner::ProvisionerConfig;
use tenant_tasks::TasksConfig;
use thiserror::Error;

use crate::logging::LoggingConfig;

/// Prefix of environment variables that override configuration keys.
pub const ENV_PREFIX: &str = "TENANTBUS__";

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("configuration file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("failed to load configuration: {0}")]
    Load(#[source] Box<figment::Error>),

    /// A required key is unset or empty
    #[error("missing required configuration key '{key}'")]
    Missing { key: &'static str },

    #[error("invalid value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Identity of the running service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Names the service queue (`<name>-service`).
    pub name: String,
    /// Tenant domains are `<slug>.<default_tenant_host>`.
    pub default_tenant_host: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "tenantbus".to_owned(),
            default_tenant_host: "localhost".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub amqp: AmqpConfig,
    pub bridge: BridgeConfig,
    pub provisioner: ProvisionerConfig,
    pub tasks: TasksConfig,
    pub replication: ReplicationConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load defaults, then `path` (if given), then the environment.
    ///
    /// # Errors
    /// Returns [`ConfigError::FileNotFound`] if `path` does not exist and
    /// [`ConfigError::Load`] if any source fails to parse or has unknown keys.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))?;
        tracing::debug!(
            config_file = ?path,
            service = %config.service.name,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Check that broker URLs and credentials are present.
    ///
    /// Bridge settings are only required while the bridge is enabled.
    ///
    /// # Errors
    /// Returns the first missing or invalid key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require("service.name", &self.service.name)?;
        require("amqp.url", &self.amqp.url)?;
        require("amqp.management_url", &self.amqp.management_url)?;
        require("amqp.username", &self.amqp.username)?;
        if self.amqp.password.is_empty() {
            return Err(ConfigError::Missing {
                key: "amqp.password",
            });
        }
        if self.bridge.enabled {
            require("bridge.api_url", &self.bridge.api_url)?;
        }
        require("tasks.namespace", &self.tasks.namespace)?;
        require("tasks.exchange", &self.tasks.exchange)?;

        if self.provisioner.max_queues_per_pool == 0 {
            return Err(ConfigError::Invalid {
                key: "provisioner.max_queues_per_pool",
                reason: "must be greater than zero".to_owned(),
            });
        }
        if !self.amqp.url.starts_with("amqp://") && !self.amqp.url.starts_with("amqps://") {
            return Err(ConfigError::Invalid {
                key: "amqp.url",
                reason: "expected an amqp:// or amqps:// URI".to_owned(),
            });
        }
        Ok(())
    }
}

fn require(key: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::Missing { key })
    } else {
        Ok(())
    }
}
