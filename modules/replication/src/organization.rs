//! Tenant lifecycle tasks: `new_organization` and `delete_organization`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tenant_tasks::{
    TaskContext, TaskError, TaskHandler, TaskOptions, TaskRegistry, TenantResolver,
    TransactionManager,
};
use uuid::Uuid;

pub const NEW_ORGANIZATION: &str = "new_organization";
pub const DELETE_ORGANIZATION: &str = "delete_organization";

/// A tenant as announced by the owning service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    /// Also the tenant's schema name
    pub slug_name: String,
    #[serde(default)]
    pub is_multi_tenant: bool,
    #[serde(default = "active")]
    pub is_active: bool,
}

fn active() -> bool {
    true
}

impl Organization {
    #[must_use]
    pub fn schema_name(&self) -> &str {
        &self.slug_name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub domain: String,
    pub is_primary: bool,
}

impl Domain {
    /// `<slug>.<host>`
    #[must_use]
    pub fn primary_for(slug: &str, host: &str) -> Self {
        Self {
            domain: format!("{slug}.{host}"),
            is_primary: true,
        }
    }
}

/// Tenant bookkeeping visible inside a shared-scope task transaction.
#[async_trait]
pub trait TenantRegistry: Send {
    /// Creates the tenant, or replaces its record if it already exists.
    async fn upsert_tenant(
        &mut self,
        organization: Organization,
        domain: Domain,
    ) -> Result<(), TaskError>;

    /// Drops the tenant and everything replicated into it. Returns whether
    /// it existed.
    async fn drop_tenant(&mut self, slug: &str) -> Result<bool, TaskError>;
}

struct NewOrganization {
    default_tenant_host: String,
}

#[async_trait]
impl<Tx: TenantRegistry + 'static> TaskHandler<Tx> for NewOrganization {
    async fn handle(
        &self,
        tx: &mut Tx,
        payload: &Value,
        _ctx: Option<&TaskContext>,
    ) -> Result<(), TaskError> {
        let organization = Organization::deserialize(payload)
            .map_err(|e| TaskError::invalid_payload(NEW_ORGANIZATION, e.to_string()))?;
        if organization.slug_name.is_empty() {
            return Err(TaskError::invalid_payload(
                NEW_ORGANIZATION,
                "empty slug_name",
            ));
        }
        let domain = Domain::primary_for(&organization.slug_name, &self.default_tenant_host);
        tracing::info!(
            tenant = %organization.slug_name,
            id = %organization.id,
            domain = %domain.domain,
            "creating tenant"
        );
        tx.upsert_tenant(organization, domain).await
    }
}

struct DeleteOrganization;

#[async_trait]
impl<Tx: TenantRegistry + 'static> TaskHandler<Tx> for DeleteOrganization {
    async fn handle(
        &self,
        tx: &mut Tx,
        payload: &Value,
        ctx: Option<&TaskContext>,
    ) -> Result<(), TaskError> {
        let slug = payload
            .get("slug_name")
            .and_then(Value::as_str)
            .or_else(|| ctx.map(|c| c.tenant_slug.as_str()))
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TaskError::invalid_payload(DELETE_ORGANIZATION, "no tenant slug"))?;

        if tx.drop_tenant(slug).await? {
            tracing::info!(tenant = slug, "tenant dropped");
        } else {
            tracing::debug!(tenant = slug, "tenant already absent");
        }
        Ok(())
    }
}

/// Registers both lifecycle tasks. They run outside any tenant.
pub fn install_lifecycle<R, M>(tasks: &mut TaskRegistry<R, M>, default_tenant_host: &str)
where
    R: TenantResolver + 'static,
    M: TransactionManager<Tenant = R::Tenant> + 'static,
    M::Tx: TenantRegistry,
{
    tasks.register(
        TaskOptions::shared(NEW_ORGANIZATION),
        Arc::new(NewOrganization {
            default_tenant_host: default_tenant_host.to_owned(),
        }),
    );
    tasks.register(
        TaskOptions::shared(DELETE_ORGANIZATION).bind(),
        Arc::new(DeleteOrganization),
    );
}
