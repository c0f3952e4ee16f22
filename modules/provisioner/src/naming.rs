//! Names of the per-tenant broker resources.
//!
//! Every resource name embeds the tenant slug, so two tenants sharing a pool
//! never collide.

use broker_admin::{Binding, ProvisioningError, http::encode_segment};
use url::Url;
use uuid::Uuid;

/// The broker's built-in topic exchange the MQTT plugin publishes into.
pub const MQTT_INGRESS_EXCHANGE: &str = "amq.topic";

/// The default vhost, never used as a tenant pool.
pub const DEFAULT_VHOST: &str = "/";

/// Exchange, queues and routing keys owned by one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantResources {
    pub slug: String,
    pub exchange: String,
    pub transformer_queue: String,
    pub transformed_queue: String,
}

impl TenantResources {
    #[must_use]
    pub fn for_slug(slug: &str) -> Self {
        Self {
            slug: slug.to_owned(),
            exchange: format!("{slug}.exchange"),
            transformer_queue: format!("{slug}.transformer.queue"),
            transformed_queue: format!("{slug}.transformed.data.queue"),
        }
    }

    /// Raw device data published over MQTT on `tenant/<slug>/device/data`.
    #[must_use]
    pub fn device_data_key(&self) -> String {
        format!("tenant.{}.device.data", self.slug)
    }

    #[must_use]
    pub fn transformed_location_key(&self) -> String {
        format!("tenant.{}.transformed.device.location", self.slug)
    }

    #[must_use]
    pub fn entity_telemetry_key(&self) -> String {
        format!("tenant.{}.space.*.entity.*.telemetry", self.slug)
    }

    /// The ingress binding from the MQTT exchange, then the tenant exchange's
    /// three queue bindings.
    #[must_use]
    pub fn bindings(&self) -> Vec<Binding> {
        vec![
            Binding::to_exchange(MQTT_INGRESS_EXCHANGE, &self.exchange, self.device_data_key()),
            Binding::to_queue(&self.exchange, &self.transformer_queue, self.device_data_key()),
            Binding::to_queue(
                &self.exchange,
                &self.transformed_queue,
                self.transformed_location_key(),
            ),
            Binding::to_queue(
                &self.exchange,
                &self.transformed_queue,
                self.entity_telemetry_key(),
            ),
        ]
    }

    #[must_use]
    pub fn queues(&self) -> [&str; 2] {
        [&self.transformer_queue, &self.transformed_queue]
    }
}

/// Slugs end up in resource names, routing keys and rule SQL, so only
/// lowercase ASCII alphanumerics, `-` and `_` are accepted.
///
/// # Errors
/// Returns [`ProvisioningError::Invalid`] for an empty or malformed slug.
pub fn validate_slug(operation: &str, slug: &str) -> Result<(), ProvisioningError> {
    if slug.is_empty() {
        return Err(ProvisioningError::invalid(operation, "tenant slug is empty"));
    }
    if let Some(bad) = slug
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_'))
    {
        return Err(ProvisioningError::invalid(
            operation,
            format!("tenant slug '{slug}' contains invalid character '{bad}'"),
        ));
    }
    Ok(())
}

/// Fresh pool name: `<prefix>pool-<uuid v7>`.
#[must_use]
pub fn new_pool_name(prefix: &str) -> String {
    format!("{prefix}pool-{}", Uuid::now_v7().simple())
}

/// Whether a vhost is a tenant pool.
#[must_use]
pub fn is_pool(vhost: &str, prefix: &str) -> bool {
    vhost != DEFAULT_VHOST && vhost.starts_with(prefix)
}

/// `base` with its path replaced by the percent-encoded pool name.
///
/// # Errors
/// Returns [`ProvisioningError::Invalid`] if `base` is not a valid URL.
pub fn tenant_amqp_url(base: &str, pool: &str) -> Result<String, ProvisioningError> {
    let mut url = Url::parse(base).map_err(|e| {
        ProvisioningError::invalid("build_amqp_url", format!("invalid AMQP URL: {e}"))
    })?;
    if pool.is_empty() {
        url.set_path("/");
    } else {
        url.set_path(&format!("/{}", encode_segment(pool)));
    }
    Ok(url.into())
}
