//! Which tenants live in which pool.
//!
//! The bridge rule of a pool must list every tenant hosted there, so the
//! provisioner asks a [`TenantDirectory`] for the pool's current members.

use std::collections::BTreeMap;

use async_trait::async_trait;
use broker_admin::ProvisioningError;
use parking_lot::RwLock;

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Slugs of tenants currently assigned to `pool`.
    async fn tenants_in_pool(&self, pool: &str) -> Result<Vec<String>, ProvisioningError>;
}

/// Directory for a service that keeps no tenant records: it only ever knows
/// about the tenant it is provisioning right now.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandaloneDirectory;

#[async_trait]
impl TenantDirectory for StandaloneDirectory {
    async fn tenants_in_pool(&self, _pool: &str) -> Result<Vec<String>, ProvisioningError> {
        Ok(Vec::new())
    }
}

/// Process-local tenant → pool assignments.
#[derive(Debug, Default)]
pub struct InMemoryTenantDirectory {
    assignments: RwLock<BTreeMap<String, String>>,
}

impl InMemoryTenantDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `slug` lives in `pool`, replacing any earlier assignment.
    pub fn assign(&self, slug: &str, pool: &str) {
        self.assignments
            .write()
            .insert(slug.to_owned(), pool.to_owned());
    }

    pub fn remove(&self, slug: &str) -> Option<String> {
        self.assignments.write().remove(slug)
    }

    #[must_use]
    pub fn pool_of(&self, slug: &str) -> Option<String> {
        self.assignments.read().get(slug).cloned()
    }
}

#[async_trait]
impl TenantDirectory for InMemoryTenantDirectory {
    async fn tenants_in_pool(&self, pool: &str) -> Result<Vec<String>, ProvisioningError> {
        Ok(self
            .assignments
            .read()
            .iter()
            .filter(|(_, p)| p.as_str() == pool)
            .map(|(slug, _)| slug.clone())
            .collect())
    }
}
