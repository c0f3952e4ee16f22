use std::collections::BTreeMap;
use std::sync::Arc;

use crate::envelope::TaskEnvelope;
use crate::event::task_name;
use crate::task::{
    TaskHandler, TaskOptions, TaskOutcome, TaskReport, TenantResolver, TenantTask,
    TransactionManager,
};

/// Task name to pipeline mapping, populated at startup.
pub struct TaskRegistry<R, M>
where
    R: TenantResolver,
    M: TransactionManager<Tenant = R::Tenant>,
{
    namespace: String,
    resolver: Arc<R>,
    manager: Arc<M>,
    tasks: BTreeMap<String, TenantTask<R::Tenant, M::Tx>>,
}

impl<R, M> TaskRegistry<R, M>
where
    R: TenantResolver + 'static,
    M: TransactionManager<Tenant = R::Tenant> + 'static,
{
    #[must_use]
    pub fn new(namespace: &str, resolver: Arc<R>, manager: Arc<M>) -> Self {
        Self {
            namespace: namespace.to_owned(),
            resolver,
            manager,
            tasks: BTreeMap::new(),
        }
    }

    /// Registers `handler` under `<namespace>.tasks.<options.name>`,
    /// replacing any earlier registration.
    pub fn register(&mut self, options: TaskOptions, handler: Arc<dyn TaskHandler<M::Tx>>) {
        let name = task_name(&self.namespace, &options.name);
        tracing::debug!(task = %name, scope = ?options.scope, "task registered");
        let task = TenantTask::new(
            options,
            Arc::clone(&self.resolver),
            Arc::clone(&self.manager),
            handler,
        );
        if self.tasks.insert(name.clone(), task).is_some() {
            tracing::warn!(task = %name, "task registration replaced");
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Fully qualified names of every registered task.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    /// Event names of every registered task, for building routes.
    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.values().map(|t| t.options().name.as_str())
    }

    #[must_use]
    pub fn options(&self, task: &str) -> Option<&TaskOptions> {
        self.tasks.get(task).map(TenantTask::options)
    }

    /// Smallest prefetch requested by any task.
    #[must_use]
    pub fn prefetch(&self) -> Option<u16> {
        self.tasks.values().map(|t| t.options().prefetch).min()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Runs one delivery. Envelopes naming no registered task are dead.
    pub async fn execute(&self, envelope: &TaskEnvelope) -> TaskReport {
        match self.tasks.get(&envelope.task) {
            Some(task) => task.execute(envelope).await,
            None => {
                tracing::error!(task = %envelope.task, id = %envelope.id, "no handler registered");
                TaskReport::dead(format!("no handler registered for task '{}'", envelope.task))
            }
        }
    }

    /// Runs an envelope in-process until it commits or dies, sleeping
    /// through each scheduled retry.
    pub async fn execute_until_settled(&self, envelope: TaskEnvelope) -> Vec<TaskReport> {
        let mut reports = Vec::new();
        let mut current = envelope;
        loop {
            let report = self.execute(&current).await;
            let retry = match &report.outcome {
                TaskOutcome::RetryScheduled { delay, .. } => Some(*delay),
                TaskOutcome::Committed | TaskOutcome::Dead { .. } => None,
            };
            reports.push(report);
            match retry {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    current = current.next_attempt();
                }
                None => return reports,
            }
        }
    }
}
