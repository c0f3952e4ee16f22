use thiserror::Error;

/// Failure of a single publish attempt.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PublishError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// The broker negatively acknowledged the message
    #[error("broker rejected message for routing key '{routing_key}'")]
    Nacked { routing_key: String },

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    /// Transport not available (test doubles, closed channels)
    #[error("publisher unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced to the caller of `dispatch`.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DispatchError {
    /// Event name does not follow `<verb>_<subject>`
    #[error("event '{name}' has no routing convention")]
    UnroutableEvent { name: String },

    #[error("invalid tenant slug '{slug}': {reason}")]
    InvalidTenant { slug: String, reason: String },

    /// Publishing failed after every transport retry
    #[error("delivery to '{routing_key}' failed after {attempts} attempt(s): {source}")]
    DeliveryFailure {
        routing_key: String,
        attempts: u32,
        #[source]
        source: PublishError,
    },
}

/// Errors that stop a consuming worker.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WorkerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("consumer for queue '{queue}' closed")]
    ConsumerClosed { queue: String },
}

/// Errors raised while executing a task.
///
/// Fatal errors dead-letter the event immediately; the rest are retried.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TaskError {
    /// The envelope names a tenant this service does not know
    #[error("unknown tenant '{slug}'")]
    UnknownTenant { slug: String },

    #[error("no handler registered for task '{name}'")]
    UnknownTask { name: String },

    #[error("invalid payload for '{task}': {reason}")]
    InvalidPayload { task: String, reason: String },

    #[error("transaction {operation} failed: {reason}")]
    Transaction {
        operation: &'static str,
        reason: String,
    },

    /// Any other handler failure
    #[error("handler failed: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl TaskError {
    #[must_use]
    pub fn handler(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Handler(err.into())
    }

    #[must_use]
    pub fn invalid_payload(task: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            task: task.into(),
            reason: reason.into(),
        }
    }

    /// Fatal errors are never retried.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnknownTenant { .. } | Self::UnknownTask { .. } | Self::InvalidPayload { .. }
        )
    }
}
