use std::sync::Arc;

use anyhow::Result;
use broker_admin::{BridgeAdmin, HttpBridgeAdmin, HttpBrokerAdmin};
use clap::Args;
use tenant_provisioner::{InMemoryTenantDirectory, TenantProvisioner};
use tenantbus_bootstrap::AppConfig;

/// Known tenant placements. The bridge rule of a pool is rebuilt from
/// these, so pass every tenant already hosted by the affected pool.
#[derive(Args)]
pub struct Assignments {
    /// Existing tenant placement as SLUG=POOL (repeatable)
    #[arg(long = "assignment", value_name = "SLUG=POOL", value_parser = parse_assignment)]
    pub assignments: Vec<(String, String)>,
}

impl Assignments {
    fn directory(&self) -> Arc<InMemoryTenantDirectory> {
        let directory = InMemoryTenantDirectory::new();
        for (slug, pool) in &self.assignments {
            directory.assign(slug, pool);
        }
        Arc::new(directory)
    }
}

#[derive(Args)]
pub struct ProvisionArgs {
    /// Organization id recorded with the tenant
    #[arg(long)]
    pub org_id: String,
    /// Tenant slug
    #[arg(long)]
    pub slug: String,
    #[command(flatten)]
    pub assignments: Assignments,
}

impl ProvisionArgs {
    pub async fn run(&self, config: &AppConfig) -> Result<()> {
        let provisioner = provisioner(config, self.assignments.directory())?;

        let provisioned = provisioner
            .provision_tenant(&self.org_id, &self.slug)
            .await?;
        println!("{}", serde_json::to_string_pretty(&provisioned)?);
        Ok(())
    }
}

#[derive(Args)]
pub struct TeardownArgs {
    /// Pool the tenant lives in
    #[arg(long)]
    pub pool: String,
    /// Tenant slug
    #[arg(long)]
    pub slug: String,
    #[command(flatten)]
    pub assignments: Assignments,
}

impl TeardownArgs {
    pub async fn run(&self, config: &AppConfig) -> Result<()> {
        let directory = self.assignments.directory();
        directory.remove(&self.slug);
        let provisioner = provisioner(config, directory)?;

        provisioner.delete_tenant(&self.pool, &self.slug).await?;
        println!("Tenant '{}' removed from pool '{}'", self.slug, self.pool);
        Ok(())
    }
}

fn provisioner(
    config: &AppConfig,
    directory: Arc<InMemoryTenantDirectory>,
) -> Result<TenantProvisioner> {
    let broker = Arc::new(HttpBrokerAdmin::new(&config.amqp)?);
    let bridge: Option<Arc<dyn BridgeAdmin>> = if config.bridge.enabled {
        Some(Arc::new(HttpBridgeAdmin::new(&config.bridge)?))
    } else {
        tracing::debug!("MQTT bridge disabled");
        None
    };
    Ok(TenantProvisioner::new(
        broker,
        bridge,
        directory,
        config.amqp.clone(),
        config.provisioner.clone(),
    ))
}

fn parse_assignment(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((slug, pool)) if !slug.is_empty() && !pool.is_empty() => {
            Ok((slug.to_owned(), pool.to_owned()))
        }
        _ => Err(format!("expected SLUG=POOL, got '{raw}'")),
    }
}
