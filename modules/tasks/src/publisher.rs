//! Event transport.
//!
//! A [`Publisher`] performs one publish attempt. [`PublishRetryLayer`]
//! wraps it with the fixed transport retry schedule so callers never retry
//! themselves.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use parking_lot::Mutex;
use tower::{Layer, Service, ServiceExt};

use crate::config::PublishRetryConfig;
use crate::envelope::TaskEnvelope;
use crate::error::{DispatchError, PublishError};

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;
const CONTENT_TYPE_JSON: &str = "application/json";
/// The nameless exchange every queue is bound to by its own name.
pub const DEFAULT_EXCHANGE: &str = "";

/// One message bound for an exchange.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: Arc<TaskEnvelope>,
}

impl PublishRequest {
    #[must_use]
    pub fn new(exchange: &str, envelope: TaskEnvelope) -> Self {
        Self {
            exchange: exchange.to_owned(),
            routing_key: envelope.routing_key(),
            envelope: Arc::new(envelope),
        }
    }

    /// Straight to `queue` through the broker's default exchange, bypassing
    /// topic routing.
    #[must_use]
    pub fn direct(queue: &str, envelope: TaskEnvelope) -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_owned(),
            routing_key: queue.to_owned(),
            envelope: Arc::new(envelope),
        }
    }
}

/// A single publish attempt against the message broker.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, request: &PublishRequest) -> Result<(), PublishError>;
}

// ============================================================================
// Tower adapters
// ============================================================================

/// Exposes a [`Publisher`] as a tower service.
#[derive(Clone)]
pub struct PublisherService {
    publisher: Arc<dyn Publisher>,
}

impl PublisherService {
    #[must_use]
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }
}

impl Service<PublishRequest> for PublisherService {
    type Response = ();
    type Error = PublishError;
    type Future = Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: PublishRequest) -> Self::Future {
        let publisher = Arc::clone(&self.publisher);
        Box::pin(async move { publisher.publish(&req).await })
    }
}

/// Applies the publish retry schedule from [`PublishRetryConfig`].
#[derive(Clone)]
pub struct PublishRetryLayer {
    config: PublishRetryConfig,
}

impl PublishRetryLayer {
    #[must_use]
    pub fn new(config: PublishRetryConfig) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for PublishRetryLayer {
    type Service = PublishRetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PublishRetryService {
            inner,
            config: self.config.clone(),
        }
    }
}

/// Retries failed publishes, then reports [`DispatchError::DeliveryFailure`]
/// carrying the last transport error.
#[derive(Clone)]
pub struct PublishRetryService<S> {
    inner: S,
    config: PublishRetryConfig,
}

impl<S> Service<PublishRequest> for PublishRetryService<S>
where
    S: Service<PublishRequest, Response = (), Error = PublishError> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = ();
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: PublishRequest) -> Self::Future {
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let config = self.config.clone();

        Box::pin(async move {
            let mut retry = 0u32;
            loop {
                let result = inner.clone().oneshot(req.clone()).await;
                let err = match result {
                    Ok(()) => {
                        if retry > 0 {
                            tracing::info!(
                                routing_key = %req.routing_key,
                                retries = retry,
                                "publish succeeded after retry"
                            );
                        }
                        return Ok(());
                    }
                    Err(err) => err,
                };

                if retry >= config.max_retries {
                    tracing::error!(
                        routing_key = %req.routing_key,
                        attempts = retry + 1,
                        error = %err,
                        "publish retries exhausted"
                    );
                    return Err(DispatchError::DeliveryFailure {
                        routing_key: req.routing_key.clone(),
                        attempts: retry + 1,
                        source: err,
                    });
                }

                retry += 1;
                let delay = config.delay(retry);
                tracing::warn!(
                    routing_key = %req.routing_key,
                    retry,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "publish failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        })
    }
}

// ============================================================================
// AMQP
// ============================================================================

/// Publishes over one confirm-mode channel.
pub struct AmqpPublisher {
    // Keeps the connection open for the channel's lifetime
    _connection: Connection,
    channel: Channel,
}

impl AmqpPublisher {
    /// # Errors
    /// Returns [`PublishError::Amqp`] if the connection or channel cannot be
    /// opened.
    pub async fn connect(url: &str) -> Result<Self, PublishError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        tracing::info!(channel = channel.id(), "AMQP publisher connected");
        Ok(Self {
            _connection: connection,
            channel,
        })
    }

    /// Publisher over an already configured channel.
    ///
    /// # Errors
    /// Returns [`PublishError::Amqp`] if confirm mode cannot be enabled.
    pub async fn on_channel(connection: Connection, channel: Channel) -> Result<Self, PublishError> {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(Self {
            _connection: connection,
            channel,
        })
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<(), PublishError> {
        let body = request.envelope.to_bytes()?;
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type(CONTENT_TYPE_JSON.into())
            .with_message_id(request.envelope.id.to_string().into());

        let confirmation = self
            .channel
            .basic_publish(
                &request.exchange,
                &request.routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(PublishError::Nacked {
                routing_key: request.routing_key.clone(),
            });
        }
        tracing::debug!(
            exchange = %request.exchange,
            routing_key = %request.routing_key,
            task = %request.envelope.task,
            "event published"
        );
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Records published envelopes instead of sending them.
#[derive(Default)]
pub struct MemoryPublisher {
    published: Mutex<Vec<PublishRequest>>,
    failures: AtomicU32,
    attempts: AtomicU32,
}

impl MemoryPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publish attempts.
    #[must_use]
    pub fn failing(n: u32) -> Self {
        let publisher = Self::default();
        publisher.failures.store(n, Ordering::SeqCst);
        publisher
    }

    /// Publish attempts so far, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn published(&self) -> Vec<PublishRequest> {
        self.published.lock().clone()
    }

    /// Drains recorded messages.
    #[must_use]
    pub fn take(&self) -> Vec<PublishRequest> {
        std::mem::take(&mut *self.published.lock())
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<(), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PublishError::Unavailable("simulated broker outage".to_owned()));
        }
        self.published.lock().push(request.clone());
        Ok(())
    }
}
