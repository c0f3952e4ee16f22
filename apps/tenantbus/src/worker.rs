use std::sync::Arc;

use anyhow::Result;
use lapin::{Connection, ConnectionProperties};
use replication::{MemoryTenantStore, ReplicaRegistry, install_lifecycle};
use tenant_tasks::{AmqpPublisher, Dispatcher, TaskRegistry, Worker};
use tenantbus_bootstrap::{AppConfig, wait_for_shutdown};
use tokio_util::sync::CancellationToken;

/// Runs the worker until a shutdown signal arrives.
///
/// Tenants and replicas live in process memory; they are rebuilt from
/// `new_organization` and replication events after a restart.
pub async fn run(config: &AppConfig) -> Result<()> {
    let store = Arc::new(MemoryTenantStore::new());
    let mut tasks = TaskRegistry::new(&config.tasks.namespace, store.clone(), store);
    install_lifecycle(&mut tasks, &config.service.default_tenant_host);
    ReplicaRegistry::new()
        .schemaless(&config.replication.models)
        .install(&mut tasks);
    let table = crate::routing_table(config)?;

    let publisher = Arc::new(AmqpPublisher::connect(&config.amqp.url).await?);
    let dispatcher = Dispatcher::new(&config.tasks, publisher);

    let connection = Connection::connect(&config.amqp.url, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(err) = wait_for_shutdown().await {
            tracing::error!(error = %err, "signal handler failed");
        }
        signal.cancel();
    });

    tracing::info!(
        service = %config.service.name,
        tasks = tasks.len(),
        routes = table.len(),
        "worker starting"
    );
    let worker = Worker::new(Arc::new(tasks), dispatcher, table, &config.tasks);
    let result = worker.run(&channel, cancel).await;

    if let Err(err) = connection.close(200, "worker stopped").await {
        tracing::debug!(error = %err, "connection already closed");
    }
    result?;
    tracing::info!("worker stopped");
    Ok(())
}
