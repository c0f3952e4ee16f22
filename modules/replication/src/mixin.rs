//! Publishing side: turns local mutations of enrolled models into events.

use std::collections::BTreeSet;
use std::future::Future;

use serde_json::{Value, json};
use tenant_tasks::{Dispatcher, TaskEnvelope};

use crate::config::ReplicationConfig;
use crate::error::ReplicationError;
use crate::model::{ReplicatedModel, sync_fields};

type LocalError = Box<dyn std::error::Error + Send + Sync>;

/// Wraps local saves and deletes of replicated models.
///
/// The local write always happens first; events are dispatched only once it
/// succeeded. A failed dispatch does not undo the local write.
#[derive(Clone)]
pub struct Replicator {
    dispatcher: Dispatcher,
    enrolled: BTreeSet<String>,
}

impl Replicator {
    #[must_use]
    pub fn new(dispatcher: Dispatcher, config: &ReplicationConfig) -> Self {
        Self {
            dispatcher,
            enrolled: config.models.iter().cloned().collect(),
        }
    }

    #[must_use]
    pub fn is_enrolled(&self, subject: &str) -> bool {
        self.enrolled.contains(subject)
    }

    /// Awaits `persist`, then dispatches `update_<subject>` with the model's
    /// synchronous fields under `data`.
    ///
    /// Returns the dispatched envelope, or `None` for models not enrolled.
    ///
    /// # Errors
    /// - [`ReplicationError::Local`] if `persist` fails (nothing dispatched)
    /// - [`ReplicationError::Encode`] / [`ReplicationError::MissingPrimaryKey`]
    ///   if the model cannot be turned into a payload
    /// - [`ReplicationError::Dispatch`] if the event could not be delivered
    pub async fn save<M, F, E>(
        &self,
        tenant_slug: &str,
        model: &M,
        persist: F,
    ) -> Result<Option<TaskEnvelope>, ReplicationError>
    where
        M: ReplicatedModel,
        F: Future<Output = Result<(), E>> + Send,
        E: Into<LocalError>,
    {
        persist.await.map_err(|e| ReplicationError::Local {
            operation: "save",
            subject: M::SUBJECT,
            source: e.into(),
        })?;
        if !self.is_enrolled(M::SUBJECT) {
            return Ok(None);
        }

        let data = sync_fields(model)?;
        let envelope = self
            .dispatcher
            .dispatch(
                &format!("update_{}", M::SUBJECT),
                tenant_slug,
                json!({ "data": data }),
            )
            .await
            .inspect_err(|err| {
                tracing::error!(
                    subject = M::SUBJECT,
                    tenant = tenant_slug,
                    error = %err,
                    "saved locally but replication event was not delivered"
                );
            })?;
        Ok(Some(envelope))
    }

    /// Awaits `remove`, then dispatches `delete_<subject>` carrying only the
    /// primary key.
    ///
    /// # Errors
    /// - [`ReplicationError::Local`] if `remove` fails (nothing dispatched)
    /// - [`ReplicationError::Dispatch`] if the event could not be delivered
    pub async fn delete<M, F, E>(
        &self,
        tenant_slug: &str,
        pk: &Value,
        remove: F,
    ) -> Result<Option<TaskEnvelope>, ReplicationError>
    where
        M: ReplicatedModel,
        F: Future<Output = Result<(), E>> + Send,
        E: Into<LocalError>,
    {
        remove.await.map_err(|e| ReplicationError::Local {
            operation: "delete",
            subject: M::SUBJECT,
            source: e.into(),
        })?;
        if !self.is_enrolled(M::SUBJECT) {
            return Ok(None);
        }

        let envelope = self
            .dispatcher
            .dispatch(
                &format!("delete_{}", M::SUBJECT),
                tenant_slug,
                json!({ "pk": pk }),
            )
            .await
            .inspect_err(|err| {
                tracing::error!(
                    subject = M::SUBJECT,
                    tenant = tenant_slug,
                    error = %err,
                    "deleted locally but replication event was not delivered"
                );
            })?;
        Ok(Some(envelope))
    }
}
