mod provision;
mod worker;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tenant_tasks::{RoutingTable, RoutingTableBuilder};
use tenantbus_bootstrap::{AppConfig, init_logging};

/// tenantbus - per-tenant messaging fabric
#[derive(Parser)]
#[command(name = "tenantbus")]
#[command(about = "tenantbus - tenant provisioning, event routing and task workers")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision broker resources for a new tenant
    Provision(provision::ProvisionArgs),
    /// Remove a tenant's broker resources from its pool
    Teardown(provision::TeardownArgs),
    /// Print the routing table this service consumes
    Routes,
    /// Consume the service queue and run tenant tasks
    Worker,
    /// Validate configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(&config.logging, cli.verbose)?;
    config.validate()?;
    tracing::debug!(service = %config.service.name, "configuration valid");

    match cli.command {
        Commands::Provision(args) => args.run(&config).await,
        Commands::Teardown(args) => args.run(&config).await,
        Commands::Routes => print_routes(&config),
        Commands::Worker => worker::run(&config).await,
        Commands::Check => {
            println!("Configuration is valid");
            Ok(())
        }
    }
}

/// Routing table for the tasks this binary registers: the organization
/// lifecycle plus every configured replicated model.
fn routing_table(config: &AppConfig) -> Result<RoutingTable> {
    let table = RoutingTableBuilder::new(&config.service.name, &config.tasks)
        .organization_lifecycle()
        .replicated_models(&config.replication.models)
        .build()?;
    Ok(table)
}

fn print_routes(config: &AppConfig) -> Result<()> {
    let table = routing_table(config)?;
    let queue = table.queue();
    println!(
        "queue {} bound to {} with '{}'",
        queue.name,
        table.exchange(),
        queue.binding_key
    );
    for route in table.routes() {
        println!("{:<48} {}", route.task, route.routing_key);
    }
    Ok(())
}
