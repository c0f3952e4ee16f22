//! Broker-side declarations for the service queue.
//!
//! Every instance declares on startup; declarations are idempotent so
//! concurrent starts are safe.

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};

use crate::routing::{RoutingTable, ServiceQueue};

pub const SINGLE_ACTIVE_CONSUMER: &str = "x-single-active-consumer";
pub const DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";

pub struct AmqpTopology;

impl AmqpTopology {
    /// Declares the shared topic exchange, the service queue and its
    /// wildcard binding.
    ///
    /// # Errors
    /// Returns the broker error of the first failed declaration.
    pub async fn declare(channel: &Channel, table: &RoutingTable) -> Result<(), lapin::Error> {
        let queue = table.queue();
        channel
            .exchange_declare(
                table.exchange(),
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(queue),
            )
            .await?;
        channel
            .queue_bind(
                &queue.name,
                table.exchange(),
                &queue.binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        tracing::info!(
            exchange = table.exchange(),
            queue = %queue.name,
            binding = %queue.binding_key,
            "task topology declared"
        );
        Ok(())
    }
}

#[must_use]
pub fn queue_arguments(queue: &ServiceQueue) -> FieldTable {
    let mut args = FieldTable::default();
    if queue.single_active_consumer {
        args.insert(SINGLE_ACTIVE_CONSUMER.into(), AMQPValue::Boolean(true));
    }
    if let Some(dlx) = &queue.dead_letter_exchange {
        args.insert(
            DEAD_LETTER_EXCHANGE.into(),
            AMQPValue::LongString(dlx.as_str().into()),
        );
    }
    args
}
