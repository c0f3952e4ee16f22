use std::time::Duration;

use serde::Deserialize;

/// Task transport settings shared by publishers and workers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TasksConfig {
    /// Task names are `<namespace>.tasks.<event>`.
    pub namespace: String,
    /// Shared topic exchange every service publishes events to.
    pub exchange: String,
    /// Handler retries before an event is dead-lettered.
    pub max_retries: u32,
    pub prefetch: u16,
    /// Set as `x-dead-letter-exchange` on the service queue.
    pub dead_letter_exchange: Option<String>,
    pub publish_retry: PublishRetryConfig,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            namespace: "tenantbus".to_owned(),
            exchange: "app.events".to_owned(),
            max_retries: 3,
            prefetch: 1,
            dead_letter_exchange: None,
            publish_retry: PublishRetryConfig::default(),
        }
    }
}

/// Publish retry schedule: `interval_start`, then `+interval_step` per retry,
/// capped at `interval_max`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublishRetryConfig {
    pub max_retries: u32,
    pub interval_start_ms: u64,
    pub interval_step_ms: u64,
    pub interval_max_ms: u64,
}

impl Default for PublishRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            interval_start_ms: 3_000,
            interval_step_ms: 1_000,
            interval_max_ms: 6_000,
        }
    }
}

impl PublishRetryConfig {
    /// Delay before retry `retry` (1-based).
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let steps = u64::from(retry.saturating_sub(1));
        let ms = self
            .interval_start_ms
            .saturating_add(self.interval_step_ms.saturating_mul(steps))
            .min(self.interval_max_ms);
        Duration::from_millis(ms)
    }
}
