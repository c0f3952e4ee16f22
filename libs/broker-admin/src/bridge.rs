//! MQTT bridge broker REST client: one connector, action and rule per pool.
//!
//! The connector logs into the primary broker's MQTT listener as
//! `<pool>:<user>`, which the broker's MQTT plugin maps to the pool's
//! virtual host. The rule forwards `tenant/<slug>/device/data` traffic for
//! exactly the slugs hosted in that pool.

use std::collections::BTreeSet;

use async_trait::async_trait;
use http::{Method, StatusCode};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::{AmqpConfig, BridgeConfig};
use crate::error::{HttpError, ProvisioningError};
use crate::http::{AdminResponse, Credentials, Disposition, HttpTransport, classify, encode_segment};
use crate::secret::SecretString;

// ============================================================================
// Naming
// ============================================================================

/// Replace every character that is not alphanumeric or `_` with `_`.
#[must_use]
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[must_use]
pub fn connector_name(pool: &str) -> String {
    format!("mqtt_{}", sanitize(pool))
}

#[must_use]
pub fn action_name(pool: &str) -> String {
    format!("device_messages_{}", sanitize(pool))
}

#[must_use]
pub fn rule_id(prefix: &str, pool: &str) -> String {
    format!("{prefix}_{}", sanitize(pool))
}

/// Resource id of an MQTT connector or action (`mqtt:<name>`).
#[must_use]
pub fn mqtt_id(name: &str) -> String {
    format!("mqtt:{name}")
}

/// Append the tenant filter to the rule SQL template.
///
/// Slugs are deduplicated and sorted so the same set always yields the same
/// SQL. When the template already filters (`WHERE`), the slug clause is
/// `AND`-ed to it.
///
/// # Errors
/// Returns [`ProvisioningError::Invalid`] when no non-empty slug is given.
pub fn build_rule_sql<S: AsRef<str>>(template: &str, slugs: &[S]) -> Result<String, ProvisioningError> {
    let unique: BTreeSet<&str> = slugs
        .iter()
        .map(AsRef::as_ref)
        .filter(|s| !s.is_empty())
        .collect();
    if unique.is_empty() {
        return Err(ProvisioningError::invalid(
            "build_rule_sql",
            "at least one tenant slug is required",
        ));
    }

    let list = unique
        .iter()
        .map(|s| format!("'{}'", s.replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(", ");
    let clause = format!("topic(2) IN ({list})");
    let base = template.trim();

    if base.to_lowercase().contains(" where ") {
        Ok(format!("{base} AND ({clause})"))
    } else {
        Ok(format!("{base} WHERE {clause}"))
    }
}

/// Where a pool's connector delivers: the primary broker's MQTT listener.
#[derive(Debug, Clone)]
pub struct ConnectorTarget {
    /// `host:port`
    pub server: String,
    /// `<pool>:<broker user>`
    pub username: String,
    pub password: SecretString,
    pub pool_size: u32,
}

impl ConnectorTarget {
    #[must_use]
    pub fn for_pool(amqp: &AmqpConfig, pool: &str) -> Self {
        Self {
            server: amqp.mqtt_server(),
            username: format!("{pool}:{}", amqp.username),
            password: amqp.password.clone(),
            pool_size: 1,
        }
    }
}

// ============================================================================
// Client contract
// ============================================================================

#[async_trait]
pub trait BridgeAdmin: Send + Sync {
    /// Create or update the pool's connector. Returns the connector name.
    async fn ensure_connector(
        &self,
        pool: &str,
        target: &ConnectorTarget,
    ) -> Result<String, ProvisioningError>;

    /// Create or update the pool's action over `connector`. Returns the action name.
    async fn ensure_action(&self, pool: &str, connector: &str) -> Result<String, ProvisioningError>;

    /// Upsert the pool's rule so it matches exactly `slugs`.
    async fn ensure_rule(&self, pool: &str, slugs: &[String]) -> Result<(), ProvisioningError>;

    async fn delete_rule(&self, pool: &str) -> Result<(), ProvisioningError>;

    async fn delete_action(&self, pool: &str) -> Result<(), ProvisioningError>;

    async fn delete_connector(&self, pool: &str) -> Result<(), ProvisioningError>;

    /// Force-disconnect an MQTT client. Unknown clients are not an error.
    async fn disconnect_client(&self, client_id: &str) -> Result<(), ProvisioningError>;

    /// Recompute the pool's rule over `remaining` slugs, or remove the rule,
    /// action and connector when no slug is left.
    async fn teardown_pool(&self, pool: &str, remaining: &[String]) -> Result<(), ProvisioningError> {
        if remaining.iter().any(|s| !s.is_empty()) {
            return self.ensure_rule(pool, remaining).await;
        }
        self.delete_rule(pool).await?;
        self.delete_action(pool).await?;
        self.delete_connector(pool).await
    }
}

// ============================================================================
// HTTP implementation
// ============================================================================

#[derive(Deserialize)]
struct LoginResponse {
    token: Option<String>,
}

/// [`BridgeAdmin`] over the bridge broker's REST API.
///
/// A bearer token is obtained from `POST /login` on first use and cached.
/// A 401 drops the cached token and the request is replayed once with a
/// fresh one.
pub struct HttpBridgeAdmin {
    http: HttpTransport,
    base_url: String,
    username: String,
    password: SecretString,
    rule_prefix: String,
    rule_sql: String,
    token: Mutex<Option<SecretString>>,
}

impl HttpBridgeAdmin {
    /// # Errors
    /// Returns an error if the HTTP transport cannot be initialised.
    pub fn new(config: &BridgeConfig) -> Result<Self, HttpError> {
        let http = HttpTransport::new(config.request_timeout())?;
        Ok(Self::with_transport(http, config))
    }

    #[must_use]
    pub fn with_transport(http: HttpTransport, config: &BridgeConfig) -> Self {
        Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_owned(),
            username: config.username.clone(),
            password: config.password.clone(),
            rule_prefix: config.rule_prefix.clone(),
            rule_sql: config.rule_sql.clone(),
            token: Mutex::new(None),
        }
    }

    async fn login(&self) -> Result<Option<SecretString>, ProvisioningError> {
        if self.username.is_empty() || self.password.is_empty() {
            tracing::warn!("bridge API credentials not configured; sending unauthenticated requests");
            return Ok(None);
        }

        let url = format!("{}/login", self.base_url);
        let body = json!({ "username": self.username, "password": self.password.expose() });
        let resp = self
            .http
            .send(Method::POST, &url, None, Some(&body))
            .await
            .map_err(|e| ProvisioningError::transport("login", e))?;
        if !resp.status().is_success() {
            tracing::error!(status = resp.status().as_u16(), "bridge login failed");
            return Err(ProvisioningError::api("login", &resp));
        }

        let token = resp
            .json::<LoginResponse>()
            .ok()
            .and_then(|r| r.token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProvisioningError::invalid_response("login", "no token in login response"))?;
        tracing::debug!("obtained bridge API token");
        Ok(Some(SecretString::new(token)))
    }

    async fn credentials(&self, refresh: bool) -> Result<Option<Credentials>, ProvisioningError> {
        let cached = if refresh { None } else { self.token.lock().clone() };
        if let Some(token) = cached {
            return Ok(Some(Credentials::Bearer(token)));
        }
        let token = self.login().await?;
        *self.token.lock() = token.clone();
        Ok(token.map(Credentials::Bearer))
    }

    async fn call(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<AdminResponse, ProvisioningError> {
        let url = format!("{}{path}", self.base_url);
        let mut refresh = false;
        loop {
            let credentials = self.credentials(refresh).await?;
            let resp = self
                .http
                .send(method.clone(), &url, credentials.as_ref(), body)
                .await
                .map_err(|e| ProvisioningError::transport(operation, e))?;

            if resp.status() == StatusCode::UNAUTHORIZED && credentials.is_some() && !refresh {
                tracing::debug!(operation, "bridge token rejected; logging in again");
                refresh = true;
                continue;
            }
            return Ok(resp);
        }
    }

    async fn expect_success(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(), ProvisioningError> {
        let resp = self.call(operation, method, path, body).await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(failure(operation, &resp))
        }
    }

    /// `POST` a new resource; on duplicate, converge it with `PUT` on `update_path`.
    async fn create_or_update(
        &self,
        operation: &str,
        create_path: &str,
        create_body: &Value,
        update_path: &str,
        update_body: &Value,
    ) -> Result<bool, ProvisioningError> {
        let resp = self
            .call(operation, Method::POST, create_path, Some(create_body))
            .await?;
        match classify(&resp) {
            Disposition::Success => Ok(true),
            Disposition::Duplicate => {
                tracing::debug!(operation, path = update_path, "already exists; updating");
                self.expect_success(operation, Method::PUT, update_path, Some(update_body))
                    .await?;
                Ok(false)
            }
            Disposition::NotFound | Disposition::Failure => Err(failure(operation, &resp)),
        }
    }

    async fn delete(&self, operation: &str, path: &str) -> Result<(), ProvisioningError> {
        let resp = self.call(operation, Method::DELETE, path, None).await?;
        match classify(&resp) {
            Disposition::Success | Disposition::NotFound => Ok(()),
            Disposition::Duplicate | Disposition::Failure => Err(failure(operation, &resp)),
        }
    }
}

fn failure(operation: &str, resp: &AdminResponse) -> ProvisioningError {
    tracing::error!(operation, status = resp.status().as_u16(), body = %resp.text(), "bridge API call failed");
    ProvisioningError::api(operation, resp)
}

#[async_trait]
impl BridgeAdmin for HttpBridgeAdmin {
    async fn ensure_connector(
        &self,
        pool: &str,
        target: &ConnectorTarget,
    ) -> Result<String, ProvisioningError> {
        let name = connector_name(pool);
        let create = json!({
            "type": "mqtt",
            "name": name,
            "enable": true,
            "server": target.server,
            "username": target.username,
            "password": target.password.expose(),
            "pool_size": target.pool_size,
        });
        let update = json!({
            "server": target.server,
            "username": target.username,
            "password": target.password.expose(),
            "pool_size": target.pool_size,
        });
        let update_path = format!("/connectors/{}", encode_segment(&mqtt_id(&name)));

        if self
            .create_or_update("ensure_connector", "/connectors", &create, &update_path, &update)
            .await?
        {
            tracing::info!(pool, connector = %name, "created bridge connector");
        }
        Ok(name)
    }

    async fn ensure_action(&self, pool: &str, connector: &str) -> Result<String, ProvisioningError> {
        let name = action_name(pool);
        let parameters = json!({ "topic": "${topic}", "qos": 1, "retain": false });
        let create = json!({
            "type": "mqtt",
            "name": name,
            "enable": true,
            "connector": connector,
            "parameters": parameters,
        });
        let update = json!({
            "connector": connector,
            "parameters": parameters,
            "enable": true,
        });
        let update_path = format!("/actions/{}", encode_segment(&mqtt_id(&name)));

        if self
            .create_or_update("ensure_action", "/actions", &create, &update_path, &update)
            .await?
        {
            tracing::info!(pool, action = %name, connector, "created bridge action");
        }
        Ok(name)
    }

    async fn ensure_rule(&self, pool: &str, slugs: &[String]) -> Result<(), ProvisioningError> {
        let id = rule_id(&self.rule_prefix, pool);
        let sql = build_rule_sql(&self.rule_sql, slugs)?;
        let actions = [mqtt_id(&action_name(pool))];
        let rule_path = format!("/rules/{}", encode_segment(&id));

        let existing = self.call("ensure_rule", Method::GET, &rule_path, None).await?;
        match existing.status() {
            StatusCode::OK => {
                let body = json!({ "sql": sql, "actions": actions, "enable": true });
                self.expect_success("ensure_rule", Method::PUT, &rule_path, Some(&body))
                    .await?;
                tracing::info!(pool, rule = %id, tenants = slugs.len(), "updated bridge rule");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                let body = json!({
                    "id": id,
                    "name": id,
                    "description": format!("Forward tenant MQTT traffic for vhost {pool}"),
                    "sql": sql,
                    "actions": actions,
                    "enable": true,
                });
                self.expect_success("ensure_rule", Method::POST, "/rules", Some(&body))
                    .await?;
                tracing::info!(pool, rule = %id, tenants = slugs.len(), "created bridge rule");
                Ok(())
            }
            _ => Err(failure("ensure_rule", &existing)),
        }
    }

    async fn delete_rule(&self, pool: &str) -> Result<(), ProvisioningError> {
        let id = rule_id(&self.rule_prefix, pool);
        self.delete("delete_rule", &format!("/rules/{}", encode_segment(&id)))
            .await?;
        tracing::info!(pool, rule = %id, "deleted bridge rule");
        Ok(())
    }

    async fn delete_action(&self, pool: &str) -> Result<(), ProvisioningError> {
        let id = mqtt_id(&action_name(pool));
        self.delete("delete_action", &format!("/actions/{}", encode_segment(&id)))
            .await
    }

    async fn delete_connector(&self, pool: &str) -> Result<(), ProvisioningError> {
        let id = mqtt_id(&connector_name(pool));
        self.delete("delete_connector", &format!("/connectors/{}", encode_segment(&id)))
            .await
    }

    async fn disconnect_client(&self, client_id: &str) -> Result<(), ProvisioningError> {
        self.delete(
            "disconnect_client",
            &format!("/clients/{}", encode_segment(client_id)),
        )
        .await
    }
}
