//! Tenant event transport.
//!
//! Events are published to one shared topic exchange with routing keys
//! `<tenant>.<subject>.<action>`. Each consuming service binds a single
//! queue with `*.*.*` and runs registered handlers inside the tenant named
//! by the envelope, retrying with `3^n` second backoff before dead-lettering.

pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod event;
pub mod publisher;
pub mod registry;
pub mod routing;
pub mod task;
pub mod topology;
pub mod worker;

pub use config::{PublishRetryConfig, TasksConfig};
pub use dispatcher::Dispatcher;
pub use envelope::TaskEnvelope;
pub use error::{DispatchError, PublishError, TaskError, WorkerError};
pub use event::{Action, EventName};
pub use publisher::{
    AmqpPublisher, DEFAULT_EXCHANGE, MemoryPublisher, PublishRequest, PublishRetryLayer, Publisher,
    PublisherService,
};
pub use registry::TaskRegistry;
pub use routing::{Route, RoutingTable, RoutingTableBuilder, ServiceQueue};
pub use task::{
    ExecutionScope, Stage, TaskContext, TaskHandler, TaskOptions, TaskOutcome, TaskReport,
    TaskScope, TaskState, TenantResolver, TenantTask, TransactionManager, retry_backoff,
};
pub use topology::AmqpTopology;
pub use worker::{Settlement, Worker};
