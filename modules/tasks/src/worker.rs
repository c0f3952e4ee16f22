use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::Channel;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::TasksConfig;
use crate::dispatcher::Dispatcher;
use crate::envelope::TaskEnvelope;
use crate::error::WorkerError;
use crate::registry::TaskRegistry;
use crate::routing::RoutingTable;
use crate::task::{TaskOutcome, TenantResolver, TransactionManager};

/// What to tell the broker about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    /// Drop, letting the broker dead-letter it
    Reject,
}

/// Consumes the service queue and runs registered tasks.
///
/// Failed attempts are acked at once and republished to the service's own
/// queue by a background timer, so one retrying event never holds up the
/// queue. Timers still pending at shutdown republish immediately.
pub struct Worker<R, M>
where
    R: TenantResolver,
    M: TransactionManager<Tenant = R::Tenant>,
{
    registry: Arc<TaskRegistry<R, M>>,
    dispatcher: Dispatcher,
    table: RoutingTable,
    prefetch: u16,
    retries: TaskTracker,
}

impl<R, M> Worker<R, M>
where
    R: TenantResolver + 'static,
    M: TransactionManager<Tenant = R::Tenant> + 'static,
{
    #[must_use]
    pub fn new(
        registry: Arc<TaskRegistry<R, M>>,
        dispatcher: Dispatcher,
        table: RoutingTable,
        config: &TasksConfig,
    ) -> Self {
        let prefetch = registry.prefetch().unwrap_or(config.prefetch).max(1);
        Self {
            registry,
            dispatcher,
            table,
            prefetch,
            retries: TaskTracker::new(),
        }
    }

    /// Declares the topology and consumes until `cancel` fires.
    ///
    /// # Errors
    /// Returns [`WorkerError`] on channel failures or when the broker closes
    /// the consumer.
    pub async fn run(&self, channel: &Channel, cancel: CancellationToken) -> Result<(), WorkerError> {
        crate::topology::AmqpTopology::declare(channel, &self.table).await?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;

        let queue = self.table.queue().name.clone();
        let tag = format!("{queue}-{}", Uuid::now_v7().simple());
        let mut consumer = channel
            .basic_consume(
                &queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        tracing::info!(queue = %queue, consumer = %tag, prefetch = self.prefetch, "worker consuming");

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!(
                        queue = %queue,
                        pending_retries = self.retries.len(),
                        "worker stopping"
                    );
                    self.drain_retries().await;
                    return Ok(());
                }
                next = consumer.next() => next,
            };
            let Some(delivery) = next else {
                self.drain_retries().await;
                return Err(WorkerError::ConsumerClosed { queue });
            };
            self.settle(delivery?, &cancel).await?;
        }
    }

    async fn settle(&self, delivery: Delivery, cancel: &CancellationToken) -> Result<(), WorkerError> {
        let envelope = match TaskEnvelope::from_bytes(&delivery.data) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(
                    delivery_tag = delivery.delivery_tag,
                    error = %err,
                    "undecodable delivery rejected"
                );
                delivery.nack(reject()).await?;
                return Ok(());
            }
        };

        let ack_late = self
            .registry
            .options(&envelope.task)
            .is_none_or(|o| o.ack_late);
        if !ack_late {
            delivery.ack(BasicAckOptions::default()).await?;
        }

        let settlement = self.process(envelope, cancel).await;
        if !ack_late {
            return Ok(());
        }
        match settlement {
            Settlement::Ack => delivery.ack(BasicAckOptions::default()).await?,
            Settlement::Reject => delivery.nack(reject()).await?,
        }
        Ok(())
    }

    /// Executes one envelope and decides its settlement. A scheduled retry
    /// is handed to a background timer and the delivery is acked.
    pub async fn process(&self, envelope: TaskEnvelope, cancel: &CancellationToken) -> Settlement {
        let report = self.registry.execute(&envelope).await;
        match report.outcome {
            TaskOutcome::Committed => Settlement::Ack,
            TaskOutcome::Dead { reason } => {
                tracing::error!(
                    task = %envelope.task,
                    tenant = %envelope.tenant_slug,
                    id = %envelope.id,
                    reason = %reason,
                    "task dead-lettered"
                );
                Settlement::Reject
            }
            TaskOutcome::RetryScheduled { delay, .. } => {
                self.schedule_retry(envelope.next_attempt(), delay, cancel.clone());
                Settlement::Ack
            }
        }
    }

    /// Number of retries waiting for their delay to pass.
    #[must_use]
    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    /// Waits until every scheduled retry has been republished.
    pub async fn drain_retries(&self) {
        self.retries.close();
        self.retries.wait().await;
        self.retries.reopen();
    }

    fn schedule_retry(
        &self,
        envelope: TaskEnvelope,
        delay: Duration,
        cancel: CancellationToken,
    ) {
        let dispatcher = self.dispatcher.clone();
        let queue = self.table.queue().name.clone();
        self.retries.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!(id = %envelope.id, "shutting down, republishing retry early");
                }
                () = tokio::time::sleep(delay) => {}
            }
            let id = envelope.id;
            let task = envelope.task.clone();
            if let Err(err) = dispatcher.redeliver(envelope, &queue).await {
                tracing::error!(
                    task = %task,
                    id = %id,
                    queue = %queue,
                    error = %err,
                    "retry republish failed, event lost"
                );
            }
        });
    }
}

fn reject() -> BasicNackOptions {
    BasicNackOptions {
        requeue: false,
        ..BasicNackOptions::default()
    }
}
