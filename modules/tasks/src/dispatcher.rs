use std::sync::Arc;

use serde_json::Value;
use tower::{Layer, ServiceExt};

use crate::config::TasksConfig;
use crate::envelope::TaskEnvelope;
use crate::error::DispatchError;
use crate::event::{EventName, check_tenant_slug};
use crate::publisher::{
    PublishRequest, PublishRetryLayer, PublishRetryService, Publisher, PublisherService,
};

/// Publishes tenant events to the shared topic exchange.
///
/// Transport retries happen inside; a returned error means the event was not
/// delivered and the caller's local change is not compensated.
#[derive(Clone)]
pub struct Dispatcher {
    namespace: String,
    exchange: String,
    service: PublishRetryService<PublisherService>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(config: &TasksConfig, publisher: Arc<dyn Publisher>) -> Self {
        let service = PublishRetryLayer::new(config.publish_retry.clone())
            .layer(PublisherService::new(publisher));
        Self {
            namespace: config.namespace.clone(),
            exchange: config.exchange.clone(),
            service,
        }
    }

    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publishes `event_name` for `tenant_slug` and returns the envelope sent.
    ///
    /// # Errors
    /// - [`DispatchError::UnroutableEvent`] if the name has no routing convention
    /// - [`DispatchError::InvalidTenant`] if the slug is not a routing-key word
    /// - [`DispatchError::DeliveryFailure`] once publish retries are exhausted
    pub async fn dispatch(
        &self,
        event_name: &str,
        tenant_slug: &str,
        payload: Value,
    ) -> Result<TaskEnvelope, DispatchError> {
        let event = EventName::parse(event_name)?;
        check_tenant_slug(tenant_slug)?;
        let envelope = TaskEnvelope::new(&self.namespace, &event, tenant_slug, payload);

        tracing::debug!(
            event = %event,
            tenant = tenant_slug,
            routing_key = %envelope.routing_key(),
            id = %envelope.id,
            "dispatching event"
        );
        self.send(envelope.clone()).await?;
        Ok(envelope)
    }

    /// Publishes an existing envelope again, straight to `queue` only.
    ///
    /// Used for scheduled retries: other services bound to the topic
    /// exchange already handled the event and must not see it twice.
    ///
    /// # Errors
    /// Returns [`DispatchError::DeliveryFailure`] once publish retries are
    /// exhausted.
    pub async fn redeliver(
        &self,
        envelope: TaskEnvelope,
        queue: &str,
    ) -> Result<(), DispatchError> {
        tracing::debug!(
            queue,
            id = %envelope.id,
            retries = envelope.retries,
            "redelivering to service queue"
        );
        self.service
            .clone()
            .oneshot(PublishRequest::direct(queue, envelope))
            .await
    }

    async fn send(&self, envelope: TaskEnvelope) -> Result<(), DispatchError> {
        let request = PublishRequest::new(&self.exchange, envelope);
        self.service.clone().oneshot(request).await
    }
}
