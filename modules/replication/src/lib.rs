//! Replication of tenant-owned models between services.
//!
//! The owning service wraps saves and deletes with a [`Replicator`], which
//! dispatches `update_<subject>` / `delete_<subject>` events once the local
//! write succeeded. Consuming services register generated replica handlers
//! through a [`ReplicaRegistry`]; upserts merge into existing records or
//! create them, and deletes of missing records succeed.

pub mod config;
pub mod error;
pub mod memory;
pub mod mixin;
pub mod model;
pub mod organization;
pub mod replica;

pub use config::ReplicationConfig;
pub use error::ReplicationError;
pub use memory::{MemoryTenantStore, MemoryTx};
pub use mixin::Replicator;
pub use model::{ReplicatedModel, record_key, sync_fields};
pub use organization::{Domain, Organization, TenantRegistry, install_lifecycle};
pub use replica::{
    ModelReplica, Record, ReplicaHandler, ReplicaRegistry, ReplicaStore, SchemalessReplica,
};
