use broker_admin::QueueSpec;
use serde::Deserialize;

/// Pool sizing and tenant queue limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisionerConfig {
    /// A pool with this many queues no longer accepts tenants.
    pub max_queues_per_pool: u64,
    /// Only vhosts starting with this prefix are treated as pools; new pools get it too.
    pub pool_prefix: String,
    pub queue_max_length: u64,
    pub queue_message_ttl_ms: u64,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            max_queues_per_pool: 100,
            pool_prefix: String::new(),
            queue_max_length: 100_000,
            queue_message_ttl_ms: 86_400_000,
        }
    }
}

impl ProvisionerConfig {
    /// Durable tenant queue bounded by the configured length and TTL.
    #[must_use]
    pub fn queue_spec(&self, name: &str) -> QueueSpec {
        QueueSpec::durable(name).bounded(self.queue_max_length, self.queue_message_ttl_ms)
    }
}
