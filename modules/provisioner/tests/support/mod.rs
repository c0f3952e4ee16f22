//! In-memory broker and bridge used by the provisioning scenarios.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use broker_admin::{
    BridgeAdmin, BrokerAdmin, ConnectorTarget, ExchangeSpec, Permissions, ProvisioningError,
    QueueSpec, SecretString, VHostLoad,
};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Dest {
    Queue(String),
    Exchange(String),
}

#[derive(Debug, Default, Clone)]
pub struct VHost {
    /// queue name -> message count
    pub queues: BTreeMap<String, u64>,
    pub queue_specs: BTreeMap<String, QueueSpec>,
    pub exchanges: BTreeSet<String>,
    pub bindings: BTreeSet<(String, Dest, String)>,
    pub permissions: BTreeSet<String>,
}

#[derive(Default)]
pub struct FakeBroker {
    pub vhosts: Mutex<BTreeMap<String, VHost>>,
    fail_on: Mutex<Option<&'static str>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        let broker = Self::default();
        broker.vhosts.lock().insert("/".to_owned(), VHost::default());
        broker
    }

    /// Add a pool holding `queues` placeholder queues with `messages` messages in total.
    pub fn with_pool(self, name: &str, queues: u64, messages: u64) -> Self {
        let mut vhost = VHost::default();
        for i in 0..queues {
            let count = if i == 0 { messages } else { 0 };
            vhost.queues.insert(format!("existing.{i}.queue"), count);
        }
        self.vhosts.lock().insert(name.to_owned(), vhost);
        self
    }

    /// Make every call of `operation` fail with HTTP 500.
    pub fn fail_on(&self, operation: &'static str) {
        *self.fail_on.lock() = Some(operation);
    }

    pub fn vhost(&self, name: &str) -> Option<VHost> {
        self.vhosts.lock().get(name).cloned()
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.vhosts
            .lock()
            .keys()
            .filter(|k| k.as_str() != "/")
            .cloned()
            .collect()
    }

    fn enter(&self, operation: &'static str) -> Result<(), ProvisioningError> {
        self.calls.lock().push(operation.to_owned());
        if *self.fail_on.lock() == Some(operation) {
            return Err(ProvisioningError::Api {
                operation: operation.to_owned(),
                status: 500,
                body: "{\"error\":\"internal_error\"}".to_owned(),
            });
        }
        Ok(())
    }

    fn with_vhost<T>(
        &self,
        operation: &str,
        vhost: &str,
        f: impl FnOnce(&mut VHost) -> Result<T, ProvisioningError>,
    ) -> Result<T, ProvisioningError> {
        let mut vhosts = self.vhosts.lock();
        match vhosts.get_mut(vhost) {
            Some(v) => f(v),
            None => Err(not_found(operation)),
        }
    }
}

fn not_found(operation: &str) -> ProvisioningError {
    ProvisioningError::Api {
        operation: operation.to_owned(),
        status: 404,
        body: "{\"error\":\"Object Not Found\",\"reason\":\"Not Found\"}".to_owned(),
    }
}

fn exchange_exists(v: &VHost, name: &str) -> bool {
    name.starts_with("amq.") || v.exchanges.contains(name)
}

#[async_trait]
impl BrokerAdmin for FakeBroker {
    async fn list_vhosts(&self) -> Result<Vec<String>, ProvisioningError> {
        self.enter("list_vhosts")?;
        Ok(self.vhosts.lock().keys().cloned().collect())
    }

    async fn vhost_load(&self, vhost: &str) -> Result<VHostLoad, ProvisioningError> {
        self.enter("vhost_load")?;
        self.with_vhost("vhost_load", vhost, |v| {
            Ok(VHostLoad {
                queue_count: v.queues.len() as u64,
                message_count: v.queues.values().sum(),
            })
        })
    }

    async fn create_vhost(&self, vhost: &str) -> Result<(), ProvisioningError> {
        self.enter("create_vhost")?;
        self.vhosts.lock().entry(vhost.to_owned()).or_default();
        Ok(())
    }

    async fn delete_vhost(&self, vhost: &str) -> Result<(), ProvisioningError> {
        self.enter("delete_vhost")?;
        self.vhosts.lock().remove(vhost);
        Ok(())
    }

    async fn create_user(
        &self,
        _username: &str,
        _password: &SecretString,
        _tags: &str,
    ) -> Result<(), ProvisioningError> {
        self.enter("create_user")
    }

    async fn delete_user(&self, _username: &str) -> Result<(), ProvisioningError> {
        self.enter("delete_user")
    }

    async fn set_permissions(
        &self,
        vhost: &str,
        username: &str,
        _permissions: &Permissions,
    ) -> Result<(), ProvisioningError> {
        self.enter("set_permissions")?;
        self.with_vhost("set_permissions", vhost, |v| {
            v.permissions.insert(username.to_owned());
            Ok(())
        })
    }

    async fn create_exchange(
        &self,
        vhost: &str,
        exchange: &ExchangeSpec,
    ) -> Result<(), ProvisioningError> {
        self.enter("create_exchange")?;
        self.with_vhost("create_exchange", vhost, |v| {
            v.exchanges.insert(exchange.name.clone());
            Ok(())
        })
    }

    async fn delete_exchange(&self, vhost: &str, name: &str) -> Result<(), ProvisioningError> {
        self.enter("delete_exchange")?;
        self.with_vhost("delete_exchange", vhost, |v| {
            v.exchanges.remove(name);
            v.bindings
                .retain(|(src, dest, _)| src != name && *dest != Dest::Exchange(name.to_owned()));
            Ok(())
        })
    }

    async fn create_queue(&self, vhost: &str, queue: &QueueSpec) -> Result<(), ProvisioningError> {
        self.enter("create_queue")?;
        self.with_vhost("create_queue", vhost, |v| {
            v.queues.entry(queue.name.clone()).or_insert(0);
            v.queue_specs.insert(queue.name.clone(), queue.clone());
            Ok(())
        })
    }

    async fn delete_queue(&self, vhost: &str, name: &str) -> Result<(), ProvisioningError> {
        self.enter("delete_queue")?;
        self.with_vhost("delete_queue", vhost, |v| {
            v.queues.remove(name);
            v.queue_specs.remove(name);
            v.bindings
                .retain(|(_, dest, _)| *dest != Dest::Queue(name.to_owned()));
            Ok(())
        })
    }

    async fn create_binding(
        &self,
        vhost: &str,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Result<(), ProvisioningError> {
        self.enter("create_binding")?;
        self.with_vhost("create_binding", vhost, |v| {
            if !exchange_exists(v, exchange) || !v.queues.contains_key(queue) {
                return Err(not_found("create_binding"));
            }
            v.bindings.insert((
                exchange.to_owned(),
                Dest::Queue(queue.to_owned()),
                routing_key.to_owned(),
            ));
            Ok(())
        })
    }

    async fn create_exchange_binding(
        &self,
        vhost: &str,
        source: &str,
        destination: &str,
        routing_key: &str,
    ) -> Result<(), ProvisioningError> {
        self.enter("create_exchange_binding")?;
        self.with_vhost("create_exchange_binding", vhost, |v| {
            if !exchange_exists(v, source) || !exchange_exists(v, destination) {
                return Err(not_found("create_exchange_binding"));
            }
            v.bindings.insert((
                source.to_owned(),
                Dest::Exchange(destination.to_owned()),
                routing_key.to_owned(),
            ));
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct FakeBridge {
    pub connectors: Mutex<BTreeMap<String, String>>,
    pub actions: Mutex<BTreeSet<String>>,
    /// pool -> slugs of its rule
    pub rules: Mutex<BTreeMap<String, Vec<String>>>,
    fail_on: Mutex<Option<&'static str>>,
}

impl FakeBridge {
    pub fn fail_on(&self, operation: &'static str) {
        *self.fail_on.lock() = Some(operation);
    }

    pub fn rule(&self, pool: &str) -> Option<Vec<String>> {
        self.rules.lock().get(pool).cloned()
    }

    fn enter(&self, operation: &'static str) -> Result<(), ProvisioningError> {
        if *self.fail_on.lock() == Some(operation) {
            return Err(ProvisioningError::invalid(operation, "bridge unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl BridgeAdmin for FakeBridge {
    async fn ensure_connector(
        &self,
        pool: &str,
        target: &ConnectorTarget,
    ) -> Result<String, ProvisioningError> {
        self.enter("ensure_connector")?;
        let name = broker_admin::bridge::connector_name(pool);
        self.connectors
            .lock()
            .insert(pool.to_owned(), target.username.clone());
        Ok(name)
    }

    async fn ensure_action(&self, pool: &str, _connector: &str) -> Result<String, ProvisioningError> {
        self.enter("ensure_action")?;
        self.actions.lock().insert(pool.to_owned());
        Ok(broker_admin::bridge::action_name(pool))
    }

    async fn ensure_rule(&self, pool: &str, slugs: &[String]) -> Result<(), ProvisioningError> {
        self.enter("ensure_rule")?;
        let sql = broker_admin::build_rule_sql("SELECT * FROM \"t\"", slugs)?;
        assert!(!sql.is_empty());
        let mut sorted: Vec<String> = slugs.to_vec();
        sorted.sort();
        sorted.dedup();
        self.rules.lock().insert(pool.to_owned(), sorted);
        Ok(())
    }

    async fn delete_rule(&self, pool: &str) -> Result<(), ProvisioningError> {
        self.enter("delete_rule")?;
        self.rules.lock().remove(pool);
        Ok(())
    }

    async fn delete_action(&self, pool: &str) -> Result<(), ProvisioningError> {
        self.enter("delete_action")?;
        self.actions.lock().remove(pool);
        Ok(())
    }

    async fn delete_connector(&self, pool: &str) -> Result<(), ProvisioningError> {
        self.enter("delete_connector")?;
        self.connectors.lock().remove(pool);
        Ok(())
    }

    async fn disconnect_client(&self, _client_id: &str) -> Result<(), ProvisioningError> {
        self.enter("disconnect_client")
    }
}
