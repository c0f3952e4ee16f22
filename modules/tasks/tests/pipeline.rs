#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tenant_tasks::{
    DEFAULT_EXCHANGE, Dispatcher, EventName, ExecutionScope, MemoryPublisher, RoutingTableBuilder,
    Settlement, TaskContext, TaskEnvelope, TaskError, TaskHandler, TaskOptions, TaskOutcome,
    TaskRegistry, TaskState, TasksConfig, TenantResolver, TransactionManager, Worker,
};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test doubles
// ============================================================================

#[derive(Default)]
struct Tenants {
    known: Vec<String>,
    lookups: AtomicU32,
}

#[async_trait]
impl TenantResolver for Tenants {
    type Tenant = String;

    async fn resolve(&self, slug: &str) -> Result<Option<String>, TaskError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.known.iter().find(|s| *s == slug).cloned())
    }
}

/// Transactions are write logs applied on commit.
#[derive(Default)]
struct Journal {
    committed: Mutex<Vec<String>>,
    rollbacks: AtomicU32,
    scopes: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl TransactionManager for Journal {
    type Tenant = String;
    type Tx = Vec<String>;

    async fn begin(&self, scope: &ExecutionScope<String>) -> Result<Vec<String>, TaskError> {
        self.scopes.lock().push(scope.tenant().cloned());
        Ok(Vec::new())
    }

    async fn commit(&self, tx: Vec<String>) -> Result<(), TaskError> {
        self.committed.lock().extend(tx);
        Ok(())
    }

    async fn rollback(&self, _tx: Vec<String>) -> Result<(), TaskError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Writes a line, then fails while `failures` remain.
struct Recorder {
    calls: AtomicU32,
    failures: AtomicU32,
    fatal: bool,
    contexts: Mutex<Vec<TaskContext>>,
}

impl Recorder {
    fn new(failures: u32, fatal: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failures: AtomicU32::new(failures),
            fatal,
            contexts: Mutex::new(Vec::new()),
        })
    }

    fn failing(failures: u32) -> Arc<Self> {
        Self::new(failures, false)
    }

    fn ok() -> Arc<Self> {
        Self::new(0, false)
    }

    fn rejecting() -> Arc<Self> {
        Self::new(0, true)
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler<Vec<String>> for Recorder {
    async fn handle(
        &self,
        tx: &mut Vec<String>,
        payload: &Value,
        ctx: Option<&TaskContext>,
    ) -> Result<(), TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ctx) = ctx {
            self.contexts.lock().push(ctx.clone());
        }
        if self.fatal {
            return Err(TaskError::invalid_payload("space", "missing data"));
        }
        tx.push(payload.to_string());
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TaskError::handler("database is locked"));
        }
        Ok(())
    }
}

struct Harness {
    tenants: Arc<Tenants>,
    journal: Arc<Journal>,
    registry: TaskRegistry<Tenants, Journal>,
}

fn harness() -> Harness {
    let tenants = Arc::new(Tenants {
        known: vec!["acme".to_owned()],
        ..Tenants::default()
    });
    let journal = Arc::new(Journal::default());
    let registry = TaskRegistry::new("tenantbus", tenants.clone(), journal.clone());
    Harness {
        tenants,
        journal,
        registry,
    }
}

fn envelope(event: &str, tenant: &str, payload: Value) -> TaskEnvelope {
    TaskEnvelope::new("tenantbus", &EventName::parse(event).unwrap(), tenant, payload)
}

// ============================================================================
// Pipeline
// ============================================================================

#[tokio::test]
async fn successful_task_commits_in_tenant() {
    let mut h = harness();
    let handler = Recorder::ok();
    h.registry
        .register(TaskOptions::tenant("update_space"), handler.clone());

    let report = h
        .registry
        .execute(&envelope("update_space", "acme", json!({ "id": 1 })))
        .await;

    assert_eq!(report.outcome, TaskOutcome::Committed);
    assert_eq!(
        report.states,
        [
            TaskState::Received,
            TaskState::ContextRestored,
            TaskState::Executing,
            TaskState::Committed
        ]
    );
    assert_eq!(*h.journal.committed.lock(), [r#"{"id":1}"#]);
    assert_eq!(*h.journal.scopes.lock(), [Some("acme".to_owned())]);
    assert_eq!(handler.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn always_failing_handler_is_retried_then_dead() {
    let mut h = harness();
    let handler = Recorder::failing(u32::MAX);
    h.registry
        .register(TaskOptions::tenant("update_space"), handler.clone());
    let start = tokio::time::Instant::now();

    let reports = h
        .registry
        .execute_until_settled(envelope("update_space", "acme", json!({})))
        .await;

    let delays: Vec<Duration> = reports
        .iter()
        .filter_map(|r| match r.outcome {
            TaskOutcome::RetryScheduled { delay, .. } => Some(delay),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        [
            Duration::from_secs(3),
            Duration::from_secs(9),
            Duration::from_secs(27)
        ]
    );
    assert_eq!(handler.calls(), 4);
    assert!(matches!(
        reports.last().unwrap().outcome,
        TaskOutcome::Dead { .. }
    ));
    assert_eq!(start.elapsed(), Duration::from_secs(39));
    assert!(h.journal.committed.lock().is_empty());
    assert_eq!(h.journal.rollbacks.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_recovers_on_retry() {
    let mut h = harness();
    let handler = Recorder::failing(1);
    h.registry
        .register(TaskOptions::tenant("update_space").bind(), handler.clone());

    let reports = h
        .registry
        .execute_until_settled(envelope("update_space", "acme", json!({ "id": 2 })))
        .await;

    assert_eq!(reports.len(), 2);
    assert_eq!(
        reports[0].outcome,
        TaskOutcome::RetryScheduled {
            attempt: 1,
            delay: Duration::from_secs(3)
        }
    );
    assert_eq!(reports[1].outcome, TaskOutcome::Committed);
    // the failed attempt's write was rolled back
    assert_eq!(h.journal.committed.lock().len(), 1);
    let attempts: Vec<u32> = handler.contexts.lock().iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, [1, 2]);
}

#[tokio::test]
async fn unknown_tenant_is_dead_without_invoking_handler() {
    let mut h = harness();
    let handler = Recorder::ok();
    h.registry
        .register(TaskOptions::tenant("update_space"), handler.clone());

    let report = h
        .registry
        .execute(&envelope("update_space", "ghost", json!({})))
        .await;

    match &report.outcome {
        TaskOutcome::Dead { reason } => assert!(reason.contains("ghost")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(report.states, [TaskState::Received, TaskState::Dead]);
    assert_eq!(handler.calls(), 0);
    assert!(h.journal.scopes.lock().is_empty());
}

#[tokio::test]
async fn invalid_payload_is_never_retried() {
    let mut h = harness();
    let handler = Recorder::rejecting();
    h.registry
        .register(TaskOptions::tenant("update_space"), handler.clone());

    let reports = h
        .registry
        .execute_until_settled(envelope("update_space", "acme", json!({})))
        .await;

    assert_eq!(reports.len(), 1);
    assert!(matches!(reports[0].outcome, TaskOutcome::Dead { .. }));
    assert_eq!(h.journal.rollbacks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shared_tasks_skip_tenant_lookup() {
    let mut h = harness();
    h.registry
        .register(TaskOptions::shared("new_organization"), Recorder::ok());

    let report = h
        .registry
        .execute(&envelope("new_organization", "globex", json!({})))
        .await;

    assert_eq!(report.outcome, TaskOutcome::Committed);
    assert_eq!(h.tenants.lookups.load(Ordering::SeqCst), 0);
    assert_eq!(*h.journal.scopes.lock(), [None]);
}

#[tokio::test]
async fn unregistered_task_is_dead() {
    let h = harness();
    let report = h
        .registry
        .execute(&envelope("delete_space", "acme", json!({ "pk": 1 })))
        .await;
    assert!(matches!(report.outcome, TaskOutcome::Dead { .. }));
}

#[tokio::test]
async fn custom_retry_budget() {
    let mut h = harness();
    let handler = Recorder::failing(u32::MAX);
    h.registry.register(
        TaskOptions::tenant("update_space").with_max_retries(0),
        handler.clone(),
    );

    let reports = h
        .registry
        .execute_until_settled(envelope("update_space", "acme", json!({})))
        .await;

    assert_eq!(reports.len(), 1);
    assert_eq!(handler.calls(), 1);
}

// ============================================================================
// Routing and worker settlement
// ============================================================================

#[test]
fn routes_follow_registered_tasks() {
    let mut h = harness();
    h.registry
        .register(TaskOptions::shared("new_organization"), Recorder::ok());
    h.registry
        .register(TaskOptions::tenant("update_space"), Recorder::ok());

    let table = RoutingTableBuilder::new("billing", &TasksConfig::default())
        .events(h.registry.event_names())
        .build()
        .unwrap();

    let names: Vec<&str> = h.registry.names().collect();
    assert_eq!(
        names,
        ["tenantbus.tasks.new_organization", "tenantbus.tasks.update_space"]
    );
    assert_eq!(
        table
            .route("tenantbus.tasks.update_space")
            .unwrap()
            .routing_key,
        "*.space.updated"
    );
    assert_eq!(
        table
            .route("tenantbus.tasks.new_organization")
            .unwrap()
            .routing_key,
        "*.org.created"
    );
}

fn worker(h: Harness, publisher: Arc<MemoryPublisher>) -> Worker<Tenants, Journal> {
    let config = TasksConfig::default();
    let table = RoutingTableBuilder::new("billing", &config)
        .replicated_model("space")
        .build()
        .unwrap();
    Worker::new(
        Arc::new(h.registry),
        Dispatcher::new(&config, publisher),
        table,
        &config,
    )
}

#[tokio::test(start_paused = true)]
async fn worker_republishes_retry_to_its_own_queue() {
    let mut h = harness();
    h.registry
        .register(TaskOptions::tenant("update_space"), Recorder::failing(1));
    let publisher = Arc::new(MemoryPublisher::new());
    let worker = worker(h, publisher.clone());
    let original = envelope("update_space", "acme", json!({}));

    let settlement = worker
        .process(original.clone(), &CancellationToken::new())
        .await;
    assert_eq!(settlement, Settlement::Ack);
    assert_eq!(worker.pending_retries(), 1);

    let started = tokio::time::Instant::now();
    worker.drain_retries().await;
    assert_eq!(started.elapsed(), Duration::from_secs(3));

    let sent = publisher.published();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].envelope.id, original.id);
    assert_eq!(sent[0].envelope.retries, 1);
    assert_eq!(sent[0].exchange, DEFAULT_EXCHANGE);
    assert_eq!(sent[0].routing_key, "billing-service");
}

#[tokio::test(start_paused = true)]
async fn retry_delay_does_not_block_the_queue() {
    let mut h = harness();
    let failing = Recorder::failing(u32::MAX);
    let healthy = Recorder::ok();
    h.registry
        .register(TaskOptions::tenant("update_space"), failing.clone());
    h.registry
        .register(TaskOptions::tenant("delete_space"), healthy.clone());
    let publisher = Arc::new(MemoryPublisher::new());
    let worker = worker(h, publisher.clone());
    let cancel = CancellationToken::new();
    let started = tokio::time::Instant::now();

    let first = worker
        .process(envelope("update_space", "acme", json!({})), &cancel)
        .await;
    let second = worker
        .process(envelope("delete_space", "acme", json!({ "pk": 1 })), &cancel)
        .await;

    assert_eq!((first, second), (Settlement::Ack, Settlement::Ack));
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(healthy.calls(), 1);
    assert_eq!(worker.pending_retries(), 1);
    assert!(publisher.published().is_empty());

    worker.drain_retries().await;
    assert_eq!(publisher.published().len(), 1);
}

#[tokio::test]
async fn worker_settlements() {
    let mut h = harness();
    h.registry
        .register(TaskOptions::tenant("update_space"), Recorder::ok());
    let worker = worker(h, Arc::new(MemoryPublisher::new()));
    let cancel = CancellationToken::new();

    let ok = worker
        .process(envelope("update_space", "acme", json!({})), &cancel)
        .await;
    assert_eq!(ok, Settlement::Ack);

    let dead = worker
        .process(envelope("update_space", "ghost", json!({})), &cancel)
        .await;
    assert_eq!(dead, Settlement::Reject);
}

#[tokio::test(start_paused = true)]
async fn shutdown_republishes_pending_retries_early() {
    let mut h = harness();
    h.registry
        .register(TaskOptions::tenant("update_space"), Recorder::failing(1));
    let publisher = Arc::new(MemoryPublisher::new());
    let worker = worker(h, publisher.clone());
    let cancel = CancellationToken::new();

    let settlement = worker
        .process(envelope("update_space", "acme", json!({})), &cancel)
        .await;
    assert_eq!(settlement, Settlement::Ack);

    let started = tokio::time::Instant::now();
    cancel.cancel();
    worker.drain_retries().await;

    assert!(started.elapsed() < Duration::from_secs(3));
    let sent = publisher.published();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].routing_key, "billing-service");
}
