use std::sync::Arc;

use broker_admin::{
    AmqpConfig, BridgeAdmin, BrokerAdmin, ConnectorTarget, ExchangeSpec, Permissions,
    ProvisioningError,
};
use serde::Serialize;

use crate::config::ProvisionerConfig;
use crate::directory::TenantDirectory;
use crate::naming::{TenantResources, is_pool, new_pool_name, tenant_amqp_url, validate_slug};
use crate::pool::{PoolCandidate, select_pool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStatus {
    Provisioned,
}

/// Where a tenant landed and how to reach its resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedTenant {
    pub pool: String,
    /// Broker URL pointing at the tenant's pool.
    pub amqp_url: String,
    pub exchange: String,
    pub transformer_queue: String,
    pub transformed_queue: String,
    pub org_id: String,
    pub org_slug: String,
    pub status: ProvisioningStatus,
}

/// Places tenants into shared pools and owns their broker resources.
///
/// Calls against the broker are sequential and not atomic; a failure after
/// the pool was chosen triggers a best-effort teardown of the tenant's
/// resources. Pools themselves are never deleted.
pub struct TenantProvisioner {
    broker: Arc<dyn BrokerAdmin>,
    bridge: Option<Arc<dyn BridgeAdmin>>,
    directory: Arc<dyn TenantDirectory>,
    amqp: AmqpConfig,
    config: ProvisionerConfig,
}

impl TenantProvisioner {
    /// `bridge = None` skips every MQTT bridge step.
    #[must_use]
    pub fn new(
        broker: Arc<dyn BrokerAdmin>,
        bridge: Option<Arc<dyn BridgeAdmin>>,
        directory: Arc<dyn TenantDirectory>,
        amqp: AmqpConfig,
        config: ProvisionerConfig,
    ) -> Self {
        Self {
            broker,
            bridge,
            directory,
            amqp,
            config,
        }
    }

    /// Provision `org_slug` into the least-loaded pool, creating a pool when
    /// every existing one is full.
    ///
    /// # Errors
    /// Returns the first [`ProvisioningError`]. Failures after a pool was
    /// chosen are preceded by a best-effort teardown of the tenant.
    pub async fn provision_tenant(
        &self,
        org_id: &str,
        org_slug: &str,
    ) -> Result<ProvisionedTenant, ProvisioningError> {
        validate_slug("provision_tenant", org_slug)?;
        tracing::info!(tenant = %org_slug, org_id, "provisioning tenant");

        let pool = match self.least_loaded_pool().await? {
            Some(pool) => {
                tracing::info!(tenant = %org_slug, pool = %pool, "using existing pool");
                pool
            }
            None => self.create_pool().await?,
        };

        let resources = TenantResources::for_slug(org_slug);
        match self.provision_into(&pool, &resources).await {
            Ok(amqp_url) => {
                tracing::info!(tenant = %org_slug, pool = %pool, "tenant provisioned");
                Ok(ProvisionedTenant {
                    pool,
                    amqp_url,
                    exchange: resources.exchange,
                    transformer_queue: resources.transformer_queue,
                    transformed_queue: resources.transformed_queue,
                    org_id: org_id.to_owned(),
                    org_slug: org_slug.to_owned(),
                    status: ProvisioningStatus::Provisioned,
                })
            }
            Err(err) => {
                tracing::error!(tenant = %org_slug, pool = %pool, error = %err, "provisioning failed, rolling back");
                if let Err(rollback) = self.delete_tenant(&pool, org_slug).await {
                    tracing::warn!(tenant = %org_slug, pool = %pool, error = %rollback, "rollback incomplete");
                }
                Err(err)
            }
        }
    }

    /// Remove the tenant's exchange and queues from `pool`, then shrink or
    /// remove the pool's bridge rule. The pool is kept.
    ///
    /// Every step runs even when earlier ones fail.
    ///
    /// # Errors
    /// Returns [`ProvisioningError::Teardown`] listing each failed step.
    pub async fn delete_tenant(&self, pool: &str, org_slug: &str) -> Result<(), ProvisioningError> {
        validate_slug("delete_tenant", org_slug)?;
        let resources = TenantResources::for_slug(org_slug);
        let mut failures = Vec::new();

        for queue in resources.queues() {
            match self.broker.delete_queue(pool, queue).await {
                Ok(()) => tracing::info!(pool, queue, "deleted tenant queue"),
                Err(e) => {
                    tracing::warn!(pool, queue, error = %e, "failed to delete tenant queue");
                    failures.push(e);
                }
            }
        }
        match self.broker.delete_exchange(pool, &resources.exchange).await {
            Ok(()) => tracing::info!(pool, exchange = %resources.exchange, "deleted tenant exchange"),
            Err(e) => {
                tracing::warn!(pool, exchange = %resources.exchange, error = %e, "failed to delete tenant exchange");
                failures.push(e);
            }
        }

        if let Some(bridge) = &self.bridge {
            let remaining = self
                .directory
                .tenants_in_pool(pool)
                .await
                .map(|slugs| slugs.into_iter().filter(|s| s != org_slug).collect::<Vec<_>>());
            let result = match remaining {
                Ok(remaining) => bridge.teardown_pool(pool, &remaining).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!(pool, tenant = %org_slug, error = %e, "failed to update bridge for pool");
                failures.push(e);
            }
        }

        if failures.is_empty() {
            tracing::info!(pool, tenant = %org_slug, "tenant resources deleted; pool kept");
            Ok(())
        } else {
            Err(ProvisioningError::Teardown {
                slug: org_slug.to_owned(),
                failures,
            })
        }
    }

    /// Least-loaded pool below capacity, or `None` when a new pool is needed.
    ///
    /// # Errors
    /// Returns an error if listing pools or reading their load fails.
    pub async fn least_loaded_pool(&self) -> Result<Option<String>, ProvisioningError> {
        let prefix = &self.config.pool_prefix;
        let pools: Vec<String> = self
            .broker
            .list_vhosts()
            .await?
            .into_iter()
            .filter(|v| is_pool(v, prefix))
            .collect();
        if pools.is_empty() {
            tracing::info!("no tenant pools found");
            return Ok(None);
        }

        let mut candidates = Vec::with_capacity(pools.len());
        for name in pools {
            let load = self.broker.vhost_load(&name).await?;
            tracing::debug!(pool = %name, queues = load.queue_count, messages = load.message_count, score = load.score(), "pool load");
            candidates.push(PoolCandidate { name, load });
        }

        let capacity = self.config.max_queues_per_pool;
        match select_pool(&candidates, capacity) {
            Some(chosen) => Ok(Some(chosen.name.clone())),
            None => {
                tracing::info!(capacity, pools = candidates.len(), "all pools at capacity");
                Ok(None)
            }
        }
    }

    async fn create_pool(&self) -> Result<String, ProvisioningError> {
        let pool = new_pool_name(&self.config.pool_prefix);
        tracing::info!(pool = %pool, "creating tenant pool");
        self.broker.create_vhost(&pool).await?;

        if let Some(bridge) = &self.bridge {
            let target = ConnectorTarget::for_pool(&self.amqp, &pool);
            let connector = bridge.ensure_connector(&pool, &target).await?;
            bridge.ensure_action(&pool, &connector).await?;
        }
        Ok(pool)
    }

    /// Everything after pool selection. Returns the tenant's AMQP URL.
    async fn provision_into(
        &self,
        pool: &str,
        resources: &TenantResources,
    ) -> Result<String, ProvisioningError> {
        self.broker
            .set_permissions(pool, &self.amqp.username, &Permissions::full())
            .await?;
        self.broker
            .create_exchange(pool, &ExchangeSpec::topic(&resources.exchange))
            .await?;
        for queue in resources.queues() {
            self.broker
                .create_queue(pool, &self.config.queue_spec(queue))
                .await?;
        }
        for binding in resources.bindings() {
            self.broker.bind(pool, &binding).await?;
        }

        if let Some(bridge) = &self.bridge {
            let target = ConnectorTarget::for_pool(&self.amqp, pool);
            let connector = bridge.ensure_connector(pool, &target).await?;
            bridge.ensure_action(pool, &connector).await?;

            let mut slugs = self.directory.tenants_in_pool(pool).await?;
            if !slugs.iter().any(|s| *s == resources.slug) {
                slugs.push(resources.slug.clone());
            }
            bridge.ensure_rule(pool, &slugs).await?;
        }

        tenant_amqp_url(&self.amqp.url, pool)
    }
}
