//! Tenant provisioning against the shared AMQP broker.
//!
//! Tenants are packed into shared virtual-host pools chosen by load. Each
//! tenant gets its own topic exchange, two bounded queues and the bindings
//! that route its device traffic, and every pool keeps one MQTT bridge rule
//! covering exactly the tenants it hosts.

pub mod config;
pub mod directory;
pub mod naming;
pub mod pool;
pub mod provisioner;

pub use config::ProvisionerConfig;
pub use directory::{InMemoryTenantDirectory, StandaloneDirectory, TenantDirectory};
pub use naming::{TenantResources, tenant_amqp_url, validate_slug};
pub use pool::{PoolCandidate, select_pool};
pub use provisioner::{ProvisionedTenant, ProvisioningStatus, TenantProvisioner};
