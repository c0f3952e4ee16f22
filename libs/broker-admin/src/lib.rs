//! Typed clients for the AMQP broker management API and the MQTT bridge
//! broker REST API.
//!
//! Both clients are stateless request/response wrappers (the bridge client
//! only caches its session token). Creates are idempotent and deletes treat
//! "already gone" as success; every other failure is a [`ProvisioningError`]
//! naming the failed operation.

pub mod amqp;
pub mod bridge;
pub mod config;
pub mod error;
pub mod http;
pub mod secret;

pub use amqp::{
    Binding, BindingDestination, BrokerAdmin, ExchangeKind, ExchangeSpec, HttpBrokerAdmin,
    Overflow, Permissions, QueueSpec, VHostLoad,
};
pub use bridge::{BridgeAdmin, ConnectorTarget, HttpBridgeAdmin, build_rule_sql};
pub use config::{AmqpConfig, BridgeConfig};
pub use error::{HttpError, ProvisioningError};
pub use http::{AdminResponse, Credentials, Disposition, HttpTransport};
pub use secret::SecretString;
