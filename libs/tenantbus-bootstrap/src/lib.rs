//! Process bootstrap shared by tenantbus binaries: layered configuration,
//! logging initialisation and shutdown signals.

pub mod config;
pub mod logging;
pub mod signals;


pub use config::{AppConfig, ConfigError, ENV_PREFIX, ServiceConfig};
pub use logging::{LogFormat, LoggingConfig, init_logging};
pub use signals::wait_for_shutdown;
