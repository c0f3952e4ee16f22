//! Consuming side: applies upsert and delete events to local replicas.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tenant_tasks::{
    TaskContext, TaskError, TaskHandler, TaskOptions, TaskRegistry, TenantResolver,
    TransactionManager,
};

use crate::model::{ReplicatedModel, record_key};

pub type Record = Map<String, Value>;

/// Replica storage visible inside a task transaction.
#[async_trait]
pub trait ReplicaStore: Send {
    async fn get(&mut self, subject: &str, key: &str) -> Result<Option<Record>, TaskError>;
    async fn put(&mut self, subject: &str, key: &str, record: Record) -> Result<(), TaskError>;
    /// Returns whether a record was removed.
    async fn remove(&mut self, subject: &str, key: &str) -> Result<bool, TaskError>;
}

/// Applies replication events for one subject.
#[async_trait]
pub trait ReplicaHandler<Tx: Send>: Send + Sync {
    fn subject(&self) -> &str;

    /// Merges `data` into the record with the same key, creating it if
    /// absent.
    async fn apply_upsert(&self, tx: &mut Tx, data: &Record) -> Result<(), TaskError>;

    /// Deletes the record; a missing record is not an error.
    async fn apply_delete(&self, tx: &mut Tx, pk: &Value) -> Result<(), TaskError>;
}

/// Generated replica handler for a [`ReplicatedModel`].
pub struct ModelReplica<M> {
    _model: PhantomData<fn() -> M>,
}

impl<M> Default for ModelReplica<M> {
    fn default() -> Self {
        Self {
            _model: PhantomData,
        }
    }
}

impl<M: ReplicatedModel> ModelReplica<M> {
    fn key(task: &str, pk: Option<&Value>) -> Result<String, TaskError> {
        pk.and_then(record_key).ok_or_else(|| {
            TaskError::invalid_payload(task, format!("missing or invalid '{}'", M::PRIMARY_KEY))
        })
    }
}

#[async_trait]
impl<M, Tx> ReplicaHandler<Tx> for ModelReplica<M>
where
    M: ReplicatedModel,
    Tx: ReplicaStore + 'static,
{
    fn subject(&self) -> &str {
        M::SUBJECT
    }

    async fn apply_upsert(&self, tx: &mut Tx, data: &Record) -> Result<(), TaskError> {
        let task = format!("update_{}", M::SUBJECT);
        let key = Self::key(&task, data.get(M::PRIMARY_KEY))?;

        let existing = tx.get(M::SUBJECT, &key).await?;
        let created = existing.is_none();
        let mut record = existing.unwrap_or_default();
        for (field, value) in data {
            record.insert(field.clone(), value.clone());
        }
        serde_json::from_value::<M>(Value::Object(record.clone()))
            .map_err(|e| TaskError::invalid_payload(&task, e.to_string()))?;

        tx.put(M::SUBJECT, &key, record).await?;
        tracing::debug!(subject = M::SUBJECT, key = %key, created, "replica upserted");
        Ok(())
    }

    async fn apply_delete(&self, tx: &mut Tx, pk: &Value) -> Result<(), TaskError> {
        let task = format!("delete_{}", M::SUBJECT);
        let key = Self::key(&task, Some(pk))?;
        if tx.remove(M::SUBJECT, &key).await? {
            tracing::debug!(subject = M::SUBJECT, key = %key, "replica deleted");
        } else {
            tracing::debug!(subject = M::SUBJECT, key = %key, "replica already absent");
        }
        Ok(())
    }
}

/// Replica handler for a subject without a local model type. Records are
/// stored as received, keyed by `id`.
pub struct SchemalessReplica {
    subject: String,
}

impl SchemalessReplica {
    pub const PRIMARY_KEY: &'static str = "id";

    #[must_use]
    pub fn new(subject: &str) -> Self {
        Self {
            subject: subject.to_owned(),
        }
    }
}

#[async_trait]
impl<Tx: ReplicaStore + 'static> ReplicaHandler<Tx> for SchemalessReplica {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn apply_upsert(&self, tx: &mut Tx, data: &Record) -> Result<(), TaskError> {
        let key = data
            .get(Self::PRIMARY_KEY)
            .and_then(record_key)
            .ok_or_else(|| {
                TaskError::invalid_payload(
                    format!("update_{}", self.subject),
                    "missing or invalid 'id'",
                )
            })?;
        let mut record = tx.get(&self.subject, &key).await?.unwrap_or_default();
        record.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
        tx.put(&self.subject, &key, record).await
    }

    async fn apply_delete(&self, tx: &mut Tx, pk: &Value) -> Result<(), TaskError> {
        let key = record_key(pk).ok_or_else(|| {
            TaskError::invalid_payload(format!("delete_{}", self.subject), "invalid 'pk'")
        })?;
        tx.remove(&self.subject, &key).await?;
        Ok(())
    }
}

// ============================================================================
// Task adapters
// ============================================================================

struct UpsertTask<Tx: Send> {
    replica: Arc<dyn ReplicaHandler<Tx>>,
}

#[async_trait]
impl<Tx: Send + 'static> TaskHandler<Tx> for UpsertTask<Tx> {
    async fn handle(
        &self,
        tx: &mut Tx,
        payload: &Value,
        _ctx: Option<&TaskContext>,
    ) -> Result<(), TaskError> {
        let data = payload
            .get("data")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                TaskError::invalid_payload(
                    format!("update_{}", self.replica.subject()),
                    "expected an object under 'data'",
                )
            })?;
        self.replica.apply_upsert(tx, data).await
    }
}

struct DeleteTask<Tx: Send> {
    replica: Arc<dyn ReplicaHandler<Tx>>,
}

#[async_trait]
impl<Tx: Send + 'static> TaskHandler<Tx> for DeleteTask<Tx> {
    async fn handle(
        &self,
        tx: &mut Tx,
        payload: &Value,
        _ctx: Option<&TaskContext>,
    ) -> Result<(), TaskError> {
        let pk = payload.get("pk").ok_or_else(|| {
            TaskError::invalid_payload(format!("delete_{}", self.replica.subject()), "missing 'pk'")
        })?;
        self.replica.apply_delete(tx, pk).await
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Replica handlers by subject, installed as `update_<s>`/`delete_<s>` tasks.
pub struct ReplicaRegistry<Tx: Send> {
    handlers: BTreeMap<String, Arc<dyn ReplicaHandler<Tx>>>,
}

impl<Tx: Send> Default for ReplicaRegistry<Tx> {
    fn default() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }
}

impl<Tx: ReplicaStore + 'static> ReplicaRegistry<Tx> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the generated handler for `M`.
    #[must_use]
    pub fn register<M: ReplicatedModel>(self) -> Self {
        self.with_handler(Arc::new(ModelReplica::<M>::default()))
    }

    /// Adds a hand-written handler, replacing any for the same subject.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn ReplicaHandler<Tx>>) -> Self {
        self.handlers.insert(handler.subject().to_owned(), handler);
        self
    }

    /// Adds a [`SchemalessReplica`] for each subject.
    #[must_use]
    pub fn schemaless<I, S>(self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        subjects.into_iter().fold(self, |registry, subject| {
            registry.with_handler(Arc::new(SchemalessReplica::new(subject.as_ref())))
        })
    }

    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    #[must_use]
    pub fn get(&self, subject: &str) -> Option<&Arc<dyn ReplicaHandler<Tx>>> {
        self.handlers.get(subject)
    }

    /// Registers both tasks of every subject with `tasks`.
    pub fn install<R, TM>(&self, tasks: &mut TaskRegistry<R, TM>)
    where
        R: TenantResolver + 'static,
        TM: TransactionManager<Tenant = R::Tenant, Tx = Tx> + 'static,
    {
        for (subject, replica) in &self.handlers {
            tasks.register(
                TaskOptions::tenant(&format!("update_{subject}")),
                Arc::new(UpsertTask {
                    replica: Arc::clone(replica),
                }),
            );
            tasks.register(
                TaskOptions::tenant(&format!("delete_{subject}")),
                Arc::new(DeleteTask {
                    replica: Arc::clone(replica),
                }),
            );
        }
    }
}
