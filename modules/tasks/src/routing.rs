//! Static routing table built once at startup.

use std::collections::BTreeMap;

use crate::config::TasksConfig;
use crate::event::{EventName, task_name};

/// Pattern binding the service queue to every tenant event.
pub const WILDCARD_BINDING: &str = "*.*.*";

/// The single queue a service consumes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceQueue {
    pub name: String,
    pub binding_key: String,
    pub single_active_consumer: bool,
    pub dead_letter_exchange: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub task: String,
    pub queue: String,
    pub exchange: String,
    /// Topic pattern, `*.<subject>.<action>`
    pub routing_key: String,
}

/// Immutable mapping from task names to their route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    exchange: String,
    queue: ServiceQueue,
    routes: BTreeMap<String, Route>,
}

impl RoutingTable {
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    #[must_use]
    pub fn queue(&self) -> &ServiceQueue {
        &self.queue
    }

    #[must_use]
    pub fn route(&self, task: &str) -> Option<&Route> {
        self.routes.get(task)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

pub struct RoutingTableBuilder {
    namespace: String,
    exchange: String,
    queue: ServiceQueue,
    events: Vec<String>,
}

impl RoutingTableBuilder {
    #[must_use]
    pub fn new(service_name: &str, config: &TasksConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            exchange: config.exchange.clone(),
            queue: ServiceQueue {
                name: format!("{service_name}-service"),
                binding_key: WILDCARD_BINDING.to_owned(),
                single_active_consumer: true,
                dead_letter_exchange: config.dead_letter_exchange.clone(),
            },
            events: Vec::new(),
        }
    }

    /// Routes for tenant creation and deletion.
    #[must_use]
    pub fn organization_lifecycle(self) -> Self {
        self.event("new_organization").event("delete_organization")
    }

    /// Routes for the upsert and delete events of a replicated model.
    #[must_use]
    pub fn replicated_model(self, subject: &str) -> Self {
        self.event(&format!("update_{subject}"))
            .event(&format!("delete_{subject}"))
    }

    #[must_use]
    pub fn replicated_models<I, S>(self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        subjects
            .into_iter()
            .fold(self, |b, s| b.replicated_model(s.as_ref()))
    }

    #[must_use]
    pub fn event(mut self, name: &str) -> Self {
        self.events.push(name.to_owned());
        self
    }

    #[must_use]
    pub fn events<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.events
            .extend(names.into_iter().map(|n| n.as_ref().to_owned()));
        self
    }

    /// # Errors
    /// Returns [`crate::DispatchError::UnroutableEvent`] if a registered
    /// event name has no routing convention.
    pub fn build(self) -> Result<RoutingTable, crate::DispatchError> {
        let mut routes = BTreeMap::new();
        for name in &self.events {
            let event = EventName::parse(name)?;
            let task = task_name(&self.namespace, event.as_str());
            routes.insert(
                task.clone(),
                Route {
                    task,
                    queue: self.queue.name.clone(),
                    exchange: self.exchange.clone(),
                    routing_key: event.binding_pattern(),
                },
            );
        }
        tracing::debug!(
            queue = %self.queue.name,
            exchange = %self.exchange,
            routes = routes.len(),
            "routing table built"
        );
        Ok(RoutingTable {
            exchange: self.exchange,
            queue: self.queue,
            routes,
        })
    }
}
