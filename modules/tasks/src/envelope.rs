use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event::{Action, EventName, routing_key};

/// The message published for every event.
///
/// Immutable apart from `retries`, which the worker bumps when it
/// republishes a failed delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: Uuid,
    /// Fully qualified task name, `<namespace>.tasks.<event>`
    pub task: String,
    pub tenant_slug: String,
    pub subject: String,
    pub action: Action,
    pub payload: Value,
    /// Handler retries already spent on this event
    #[serde(default)]
    pub retries: u32,
    pub published_at: DateTime<Utc>,
}

impl TaskEnvelope {
    #[must_use]
    pub fn new(namespace: &str, event: &EventName, tenant_slug: &str, payload: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            task: event.task_name(namespace),
            tenant_slug: tenant_slug.to_owned(),
            subject: event.subject().to_owned(),
            action: event.action(),
            payload,
            retries: 0,
            published_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn routing_key(&self) -> String {
        routing_key(&self.tenant_slug, &self.subject, self.action)
    }

    /// Copy of this envelope for redelivery after a failed attempt.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            retries: self.retries.saturating_add(1),
            ..self.clone()
        }
    }

    /// # Errors
    /// Returns an error if the payload cannot be serialized.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// # Errors
    /// Returns an error if `bytes` is not a JSON envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
