//! Tenant-aware task execution.
//!
//! Every delivered envelope runs through the same stage pipeline:
//! `RestoreTenant -> BeginTransaction -> Invoke -> CommitOrRetry`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::Instrument;
use uuid::Uuid;

use crate::envelope::TaskEnvelope;
use crate::error::TaskError;

/// Base of the exponential handler retry backoff, in seconds.
pub const RETRY_BACKOFF_BASE: u64 = 3;

/// Delay before handler retry `attempt` (1-based): `3^attempt` seconds.
#[must_use]
pub fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_secs(RETRY_BACKOFF_BASE.saturating_pow(attempt))
}

// ============================================================================
// Collaborators
// ============================================================================

/// Looks tenants up by slug.
#[async_trait]
pub trait TenantResolver: Send + Sync {
    type Tenant: Clone + Send + Sync + 'static;

    async fn resolve(&self, slug: &str) -> Result<Option<Self::Tenant>, TaskError>;
}

/// Where a task body runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionScope<T> {
    /// Inside the tenant named by the envelope
    Tenant(T),
    /// Outside any tenant (tenant lifecycle tasks)
    Shared,
}

impl<T> ExecutionScope<T> {
    #[must_use]
    pub fn tenant(&self) -> Option<&T> {
        match self {
            Self::Tenant(t) => Some(t),
            Self::Shared => None,
        }
    }
}

#[async_trait]
pub trait TransactionManager: Send + Sync {
    type Tenant: Clone + Send + Sync + 'static;
    type Tx: Send + 'static;

    async fn begin(&self, scope: &ExecutionScope<Self::Tenant>) -> Result<Self::Tx, TaskError>;
    async fn commit(&self, tx: Self::Tx) -> Result<(), TaskError>;
    async fn rollback(&self, tx: Self::Tx) -> Result<(), TaskError>;
}

/// Delivery metadata handed to handlers registered with `bind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub task_name: String,
    pub tenant_slug: String,
    /// 1 for the first delivery
    pub attempt: u32,
}

/// The body of a task.
#[async_trait]
pub trait TaskHandler<Tx: Send>: Send + Sync {
    async fn handle(
        &self,
        tx: &mut Tx,
        payload: &Value,
        ctx: Option<&TaskContext>,
    ) -> Result<(), TaskError>;
}

// ============================================================================
// Options and outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskScope {
    Tenant,
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    /// Event name, `<verb>_<subject>`
    pub name: String,
    pub max_retries: u32,
    /// Pass a [`TaskContext`] to the handler
    pub bind: bool,
    /// Acknowledge after execution instead of on receipt
    pub ack_late: bool,
    pub prefetch: u16,
    pub scope: TaskScope,
}

impl TaskOptions {
    #[must_use]
    pub fn tenant(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            max_retries: 3,
            bind: false,
            ack_late: true,
            prefetch: 1,
            scope: TaskScope::Tenant,
        }
    }

    #[must_use]
    pub fn shared(name: &str) -> Self {
        Self {
            scope: TaskScope::Shared,
            ..Self::tenant(name)
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn bind(mut self) -> Self {
        self.bind = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Received,
    ContextRestored,
    Executing,
    Committed,
    RetryScheduled,
    Dead,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::ContextRestored => "context_restored",
            Self::Executing => "executing",
            Self::Committed => "committed",
            Self::RetryScheduled => "retry_scheduled",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Committed,
    /// Redeliver as retry `attempt` after `delay`
    RetryScheduled { attempt: u32, delay: Duration },
    Dead { reason: String },
}

impl TaskOutcome {
    fn state(&self) -> TaskState {
        match self {
            Self::Committed => TaskState::Committed,
            Self::RetryScheduled { .. } => TaskState::RetryScheduled,
            Self::Dead { .. } => TaskState::Dead,
        }
    }
}

/// Outcome of one delivery plus the states it went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub outcome: TaskOutcome,
    pub states: Vec<TaskState>,
}

impl TaskReport {
    pub(crate) fn dead(reason: String) -> Self {
        Self {
            outcome: TaskOutcome::Dead { reason },
            states: vec![TaskState::Received, TaskState::Dead],
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Mutable state threaded through the stages of one delivery.
pub struct Execution<'a, T, Tx> {
    pub envelope: &'a TaskEnvelope,
    pub options: &'a TaskOptions,
    pub scope: Option<ExecutionScope<T>>,
    pub tx: Option<Tx>,
    pub failure: Option<TaskError>,
    pub outcome: Option<TaskOutcome>,
    pub states: Vec<TaskState>,
}

/// One step of the pipeline.
///
/// Once a stage fails, only stages that settle the delivery still run.
#[async_trait]
pub trait Stage<T: Send + Sync + 'static, Tx: Send + 'static>: Send + Sync {
    fn name(&self) -> &'static str;

    fn settles(&self) -> bool {
        false
    }

    async fn run(&self, exec: &mut Execution<'_, T, Tx>) -> Result<(), TaskError>;
}

pub struct RestoreTenant<R> {
    resolver: Arc<R>,
}

#[async_trait]
impl<R, Tx> Stage<R::Tenant, Tx> for RestoreTenant<R>
where
    R: TenantResolver,
    Tx: Send + 'static,
{
    fn name(&self) -> &'static str {
        "restore_tenant"
    }

    async fn run(&self, exec: &mut Execution<'_, R::Tenant, Tx>) -> Result<(), TaskError> {
        let scope = match exec.options.scope {
            TaskScope::Shared => ExecutionScope::Shared,
            TaskScope::Tenant => {
                let slug = &exec.envelope.tenant_slug;
                let tenant = self
                    .resolver
                    .resolve(slug)
                    .await?
                    .ok_or_else(|| TaskError::UnknownTenant { slug: slug.clone() })?;
                ExecutionScope::Tenant(tenant)
            }
        };
        exec.scope = Some(scope);
        exec.states.push(TaskState::ContextRestored);
        Ok(())
    }
}

pub struct BeginTransaction<M> {
    manager: Arc<M>,
}

#[async_trait]
impl<M> Stage<M::Tenant, M::Tx> for BeginTransaction<M>
where
    M: TransactionManager,
{
    fn name(&self) -> &'static str {
        "begin_transaction"
    }

    async fn run(&self, exec: &mut Execution<'_, M::Tenant, M::Tx>) -> Result<(), TaskError> {
        let scope = exec
            .scope
            .as_ref()
            .ok_or_else(|| TaskError::Transaction {
                operation: "begin",
                reason: "no execution scope".to_owned(),
            })?;
        exec.tx = Some(self.manager.begin(scope).await?);
        Ok(())
    }
}

pub struct Invoke<Tx: Send + 'static> {
    handler: Arc<dyn TaskHandler<Tx>>,
}

#[async_trait]
impl<T, Tx> Stage<T, Tx> for Invoke<Tx>
where
    T: Send + Sync + 'static,
    Tx: Send + 'static,
{
    fn name(&self) -> &'static str {
        "invoke"
    }

    async fn run(&self, exec: &mut Execution<'_, T, Tx>) -> Result<(), TaskError> {
        exec.states.push(TaskState::Executing);
        let envelope = exec.envelope;
        let ctx = exec.options.bind.then(|| TaskContext {
            task_id: envelope.id,
            task_name: envelope.task.clone(),
            tenant_slug: envelope.tenant_slug.clone(),
            attempt: envelope.retries + 1,
        });
        let tx = exec.tx.as_mut().ok_or_else(|| TaskError::Transaction {
            operation: "begin",
            reason: "no open transaction".to_owned(),
        })?;
        self.handler.handle(tx, &envelope.payload, ctx.as_ref()).await
    }
}

pub struct CommitOrRetry<M> {
    manager: Arc<M>,
}

impl<M: TransactionManager> CommitOrRetry<M> {
    async fn discard(&self, tx: Option<M::Tx>, task: &str) {
        if let Some(tx) = tx
            && let Err(err) = self.manager.rollback(tx).await
        {
            tracing::warn!(task, error = %err, "rollback failed");
        }
    }
}

#[async_trait]
impl<M> Stage<M::Tenant, M::Tx> for CommitOrRetry<M>
where
    M: TransactionManager,
{
    fn name(&self) -> &'static str {
        "commit_or_retry"
    }

    fn settles(&self) -> bool {
        true
    }

    async fn run(&self, exec: &mut Execution<'_, M::Tenant, M::Tx>) -> Result<(), TaskError> {
        let envelope = exec.envelope;
        let task = envelope.task.as_str();
        let failure = match exec.failure.take() {
            None => match exec.tx.take() {
                Some(tx) => self.manager.commit(tx).await.err(),
                None => Some(TaskError::Transaction {
                    operation: "commit",
                    reason: "no open transaction".to_owned(),
                }),
            },
            Some(err) => {
                self.discard(exec.tx.take(), task).await;
                Some(err)
            }
        };

        let outcome = match failure {
            None => TaskOutcome::Committed,
            Some(err) if err.is_fatal() => {
                tracing::error!(task, error = %err, "task failed permanently");
                TaskOutcome::Dead {
                    reason: err.to_string(),
                }
            }
            Some(err) if envelope.retries >= exec.options.max_retries => {
                tracing::error!(
                    task,
                    retries = envelope.retries,
                    error = %err,
                    "task retries exhausted"
                );
                TaskOutcome::Dead {
                    reason: format!(
                        "retries exhausted after {} attempt(s): {err}",
                        envelope.retries + 1
                    ),
                }
            }
            Some(err) => {
                let attempt = envelope.retries + 1;
                let delay = retry_backoff(attempt);
                tracing::warn!(
                    task,
                    attempt,
                    delay_s = delay.as_secs(),
                    error = %err,
                    "task failed, retry scheduled"
                );
                TaskOutcome::RetryScheduled { attempt, delay }
            }
        };
        exec.states.push(outcome.state());
        exec.outcome = Some(outcome);
        Ok(())
    }
}

/// A handler wrapped in the tenant pipeline.
pub struct TenantTask<T: Send + Sync + 'static, Tx: Send + 'static> {
    options: TaskOptions,
    stages: Vec<Box<dyn Stage<T, Tx>>>,
}

impl<T, Tx> TenantTask<T, Tx>
where
    T: Clone + Send + Sync + 'static,
    Tx: Send + 'static,
{
    #[must_use]
    pub fn new<R, M>(
        options: TaskOptions,
        resolver: Arc<R>,
        manager: Arc<M>,
        handler: Arc<dyn TaskHandler<Tx>>,
    ) -> Self
    where
        R: TenantResolver<Tenant = T> + 'static,
        M: TransactionManager<Tenant = T, Tx = Tx> + 'static,
    {
        let stages: Vec<Box<dyn Stage<T, Tx>>> = vec![
            Box::new(RestoreTenant { resolver }),
            Box::new(BeginTransaction {
                manager: Arc::clone(&manager),
            }),
            Box::new(Invoke { handler }),
            Box::new(CommitOrRetry { manager }),
        ];
        Self { options, stages }
    }

    #[must_use]
    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    pub async fn execute(&self, envelope: &TaskEnvelope) -> TaskReport {
        let span = tracing::info_span!(
            "task",
            task = %envelope.task,
            tenant = %envelope.tenant_slug,
            id = %envelope.id,
            attempt = envelope.retries + 1,
        );
        self.run_stages(envelope).instrument(span).await
    }

    async fn run_stages(&self, envelope: &TaskEnvelope) -> TaskReport {
        let mut exec = Execution {
            envelope,
            options: &self.options,
            scope: None,
            tx: None,
            failure: None,
            outcome: None,
            states: vec![TaskState::Received],
        };

        for stage in &self.stages {
            if exec.failure.is_some() && !stage.settles() {
                continue;
            }
            if let Err(err) = stage.run(&mut exec).await {
                tracing::debug!(stage = stage.name(), error = %err, "stage failed");
                exec.failure = Some(err);
            }
        }

        let outcome = exec.outcome.unwrap_or_else(|| TaskOutcome::Dead {
            reason: exec
                .failure
                .map_or_else(|| "pipeline did not settle".to_owned(), |e| e.to_string()),
        });
        if matches!(outcome, TaskOutcome::Committed) {
            tracing::debug!("task committed");
        }
        TaskReport {
            outcome,
            states: exec.states,
        }
    }
}
