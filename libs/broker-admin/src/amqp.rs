//! AMQP broker management API client (virtual hosts, users, permissions,
//! exchanges, queues, bindings).

use async_trait::async_trait;
use http::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::AmqpConfig;
use crate::error::{HttpError, ProvisioningError};
use crate::http::{AdminResponse, Credentials, Disposition, HttpTransport, classify, encode_segment};
use crate::secret::SecretString;

// ============================================================================
// Models
// ============================================================================

/// Queue and message counters for one virtual host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VHostLoad {
    pub queue_count: u64,
    pub message_count: u64,
}

impl VHostLoad {
    /// Load score used for pool balancing: `10 * queues + messages`.
    ///
    /// Connection count is deliberately not part of the score.
    #[must_use]
    pub fn score(&self) -> u64 {
        self.queue_count
            .saturating_mul(10)
            .saturating_add(self.message_count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
    Headers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    /// Durable, non-internal topic exchange.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }
}

/// Behaviour once a queue reaches `max_length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Overflow {
    DropHead,
    RejectPublish,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub max_length: Option<u64>,
    pub message_ttl_ms: Option<u64>,
    pub overflow: Option<Overflow>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            max_length: None,
            message_ttl_ms: None,
            overflow: None,
        }
    }

    #[must_use]
    pub fn bounded(mut self, max_length: u64, message_ttl_ms: u64) -> Self {
        self.max_length = Some(max_length);
        self.message_ttl_ms = Some(message_ttl_ms);
        self.overflow = Some(Overflow::RejectPublish);
        self
    }

    fn arguments(&self) -> Value {
        let mut args = serde_json::Map::new();
        if let Some(max_length) = self.max_length {
            args.insert("x-max-length".to_owned(), json!(max_length));
        }
        if let Some(ttl) = self.message_ttl_ms {
            args.insert("x-message-ttl".to_owned(), json!(ttl));
        }
        if let Some(overflow) = self.overflow {
            args.insert("x-overflow".to_owned(), json!(overflow));
        }
        Value::Object(args)
    }
}

/// Permission regexes granted to a user on a vhost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Permissions {
    pub configure: String,
    pub write: String,
    pub read: String,
}

impl Permissions {
    #[must_use]
    pub fn full() -> Self {
        Self {
            configure: ".*".to_owned(),
            write: ".*".to_owned(),
            read: ".*".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingDestination {
    Queue(String),
    Exchange(String),
}

/// Binding from an exchange to a queue or to another exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub source: String,
    pub destination: BindingDestination,
    pub routing_key: String,
}

impl Binding {
    pub fn to_queue(
        source: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: BindingDestination::Queue(queue.into()),
            routing_key: routing_key.into(),
        }
    }

    pub fn to_exchange(
        source: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: BindingDestination::Exchange(exchange.into()),
            routing_key: routing_key.into(),
        }
    }
}

// ============================================================================
// Client contract
// ============================================================================

/// Broker management operations used by the provisioner.
///
/// Creates are idempotent (an existing resource is success) and deletes
/// treat a missing resource as success. Everything else is a
/// [`ProvisioningError`].
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    /// Names of all virtual hosts.
    async fn list_vhosts(&self) -> Result<Vec<String>, ProvisioningError>;

    async fn vhost_load(&self, vhost: &str) -> Result<VHostLoad, ProvisioningError>;

    async fn create_vhost(&self, vhost: &str) -> Result<(), ProvisioningError>;

    async fn delete_vhost(&self, vhost: &str) -> Result<(), ProvisioningError>;

    async fn create_user(
        &self,
        username: &str,
        password: &SecretString,
        tags: &str,
    ) -> Result<(), ProvisioningError>;

    async fn delete_user(&self, username: &str) -> Result<(), ProvisioningError>;

    async fn set_permissions(
        &self,
        vhost: &str,
        username: &str,
        permissions: &Permissions,
    ) -> Result<(), ProvisioningError>;

    async fn create_exchange(
        &self,
        vhost: &str,
        exchange: &ExchangeSpec,
    ) -> Result<(), ProvisioningError>;

    async fn delete_exchange(&self, vhost: &str, name: &str) -> Result<(), ProvisioningError>;

    async fn create_queue(&self, vhost: &str, queue: &QueueSpec) -> Result<(), ProvisioningError>;

    async fn delete_queue(&self, vhost: &str, name: &str) -> Result<(), ProvisioningError>;

    /// Bind `exchange` to `queue`.
    async fn create_binding(
        &self,
        vhost: &str,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Result<(), ProvisioningError>;

    /// Bind `source` exchange to `destination` exchange.
    async fn create_exchange_binding(
        &self,
        vhost: &str,
        source: &str,
        destination: &str,
        routing_key: &str,
    ) -> Result<(), ProvisioningError>;

    /// Create either kind of binding.
    async fn bind(&self, vhost: &str, binding: &Binding) -> Result<(), ProvisioningError> {
        match &binding.destination {
            BindingDestination::Queue(queue) => {
                self.create_binding(vhost, &binding.source, queue, &binding.routing_key)
                    .await
            }
            BindingDestination::Exchange(exchange) => {
                self.create_exchange_binding(vhost, &binding.source, exchange, &binding.routing_key)
                    .await
            }
        }
    }
}

// ============================================================================
// HTTP implementation
// ============================================================================

#[derive(Deserialize)]
struct VHostEntry {
    name: String,
}

#[derive(Deserialize)]
struct QueueEntry {
    #[serde(default)]
    messages: u64,
}

/// [`BrokerAdmin`] over the broker's HTTP management API (basic auth).
#[derive(Clone)]
pub struct HttpBrokerAdmin {
    http: HttpTransport,
    api_url: String,
    credentials: Credentials,
}

impl HttpBrokerAdmin {
    /// # Errors
    /// Returns an error if the HTTP transport cannot be initialised.
    pub fn new(config: &AmqpConfig) -> Result<Self, HttpError> {
        let http = HttpTransport::new(config.request_timeout())?;
        Ok(Self::with_transport(http, config))
    }

    #[must_use]
    pub fn with_transport(http: HttpTransport, config: &AmqpConfig) -> Self {
        Self {
            http,
            api_url: format!("{}/api", config.management_url.trim_end_matches('/')),
            credentials: Credentials::Basic {
                username: config.username.clone(),
                password: config.password.clone(),
            },
        }
    }

    async fn call(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<AdminResponse, ProvisioningError> {
        let url = format!("{}{path}", self.api_url);
        self.http
            .send(method, &url, Some(&self.credentials), body)
            .await
            .map_err(|e| {
                tracing::error!(operation, error = %e, "broker management call failed");
                ProvisioningError::transport(operation, e)
            })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
    ) -> Result<T, ProvisioningError> {
        let resp = self.call(operation, Method::GET, path, None).await?;
        if classify(&resp) != Disposition::Success {
            return Err(failure(operation, &resp));
        }
        resp.json()
            .map_err(|e| ProvisioningError::invalid_response(operation, e.to_string()))
    }

    async fn create(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: &Value,
    ) -> Result<(), ProvisioningError> {
        let resp = self.call(operation, method, path, Some(body)).await?;
        match classify(&resp) {
            Disposition::Success => Ok(()),
            Disposition::Duplicate => {
                tracing::debug!(operation, path, "resource already exists");
                Ok(())
            }
            Disposition::NotFound | Disposition::Failure => Err(failure(operation, &resp)),
        }
    }

    async fn delete(&self, operation: &str, path: &str) -> Result<(), ProvisioningError> {
        let resp = self.call(operation, Method::DELETE, path, None).await?;
        match classify(&resp) {
            Disposition::Success => Ok(()),
            Disposition::NotFound => {
                tracing::debug!(operation, path, "resource already gone");
                Ok(())
            }
            Disposition::Duplicate | Disposition::Failure => Err(failure(operation, &resp)),
        }
    }
}

fn failure(operation: &str, resp: &AdminResponse) -> ProvisioningError {
    let err = ProvisioningError::api(operation, resp);
    tracing::error!(operation, status = resp.status().as_u16(), body = %resp.text(), "broker rejected request");
    err
}

#[async_trait]
impl BrokerAdmin for HttpBrokerAdmin {
    async fn list_vhosts(&self) -> Result<Vec<String>, ProvisioningError> {
        let entries: Vec<VHostEntry> = self.get_json("list_vhosts", "/vhosts").await?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }

    async fn vhost_load(&self, vhost: &str) -> Result<VHostLoad, ProvisioningError> {
        let path = format!("/queues/{}", encode_segment(vhost));
        let queues: Vec<QueueEntry> = self.get_json("vhost_load", &path).await?;
        Ok(VHostLoad {
            queue_count: queues.len() as u64,
            message_count: queues.iter().map(|q| q.messages).sum(),
        })
    }

    async fn create_vhost(&self, vhost: &str) -> Result<(), ProvisioningError> {
        let path = format!("/vhosts/{}", encode_segment(vhost));
        let body = json!({ "description": format!("Vhost for {vhost}"), "tracing": false });
        self.create("create_vhost", Method::PUT, &path, &body).await?;
        tracing::info!(vhost, "created vhost");
        Ok(())
    }

    async fn delete_vhost(&self, vhost: &str) -> Result<(), ProvisioningError> {
        let path = format!("/vhosts/{}", encode_segment(vhost));
        self.delete("delete_vhost", &path).await
    }

    async fn create_user(
        &self,
        username: &str,
        password: &SecretString,
        tags: &str,
    ) -> Result<(), ProvisioningError> {
        let path = format!("/users/{}", encode_segment(username));
        let body = json!({ "password": password.expose(), "tags": tags });
        self.create("create_user", Method::PUT, &path, &body).await?;
        tracing::info!(username, "created user");
        Ok(())
    }

    async fn delete_user(&self, username: &str) -> Result<(), ProvisioningError> {
        let path = format!("/users/{}", encode_segment(username));
        self.delete("delete_user", &path).await
    }

    async fn set_permissions(
        &self,
        vhost: &str,
        username: &str,
        permissions: &Permissions,
    ) -> Result<(), ProvisioningError> {
        let path = format!(
            "/permissions/{}/{}",
            encode_segment(vhost),
            encode_segment(username)
        );
        let body = serde_json::to_value(permissions)
            .map_err(|e| ProvisioningError::invalid("set_permissions", e.to_string()))?;
        self.create("set_permissions", Method::PUT, &path, &body).await?;
        tracing::debug!(vhost, username, "set permissions");
        Ok(())
    }

    async fn create_exchange(
        &self,
        vhost: &str,
        exchange: &ExchangeSpec,
    ) -> Result<(), ProvisioningError> {
        let path = format!(
            "/exchanges/{}/{}",
            encode_segment(vhost),
            encode_segment(&exchange.name)
        );
        let body = json!({
            "type": exchange.kind,
            "durable": exchange.durable,
            "auto_delete": false,
            "internal": false,
            "arguments": {},
        });
        self.create("create_exchange", Method::PUT, &path, &body).await?;
        tracing::info!(vhost, exchange = %exchange.name, "created exchange");
        Ok(())
    }

    async fn delete_exchange(&self, vhost: &str, name: &str) -> Result<(), ProvisioningError> {
        let path = format!("/exchanges/{}/{}", encode_segment(vhost), encode_segment(name));
        self.delete("delete_exchange", &path).await
    }

    async fn create_queue(&self, vhost: &str, queue: &QueueSpec) -> Result<(), ProvisioningError> {
        let path = format!("/queues/{}/{}", encode_segment(vhost), encode_segment(&queue.name));
        let body = json!({
            "durable": queue.durable,
            "auto_delete": false,
            "arguments": queue.arguments(),
        });
        self.create("create_queue", Method::PUT, &path, &body).await?;
        tracing::info!(vhost, queue = %queue.name, "created queue");
        Ok(())
    }

    async fn delete_queue(&self, vhost: &str, name: &str) -> Result<(), ProvisioningError> {
        let path = format!("/queues/{}/{}", encode_segment(vhost), encode_segment(name));
        self.delete("delete_queue", &path).await
    }

    async fn create_binding(
        &self,
        vhost: &str,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Result<(), ProvisioningError> {
        let path = format!(
            "/bindings/{}/e/{}/q/{}",
            encode_segment(vhost),
            encode_segment(exchange),
            encode_segment(queue)
        );
        let body = json!({ "routing_key": routing_key, "arguments": {} });
        self.create("create_binding", Method::POST, &path, &body).await?;
        tracing::info!(vhost, exchange, queue, routing_key, "created binding");
        Ok(())
    }

    async fn create_exchange_binding(
        &self,
        vhost: &str,
        source: &str,
        destination: &str,
        routing_key: &str,
    ) -> Result<(), ProvisioningError> {
        let path = format!(
            "/bindings/{}/e/{}/e/{}",
            encode_segment(vhost),
            encode_segment(source),
            encode_segment(destination)
        );
        let body = json!({ "routing_key": routing_key, "arguments": {} });
        self.create("create_exchange_binding", Method::POST, &path, &body)
            .await?;
        tracing::info!(vhost, source, destination, routing_key, "created exchange binding");
        Ok(())
    }
}
