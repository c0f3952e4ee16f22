//! Minimal JSON-over-HTTP transport shared by the broker and bridge clients.
//!
//! Built on a pooled hyper-util client (HTTP and HTTPS via rustls) with a
//! tower `TimeoutLayer` carrying the fixed per-request timeout. There is no
//! retry here: every management call is idempotent at the caller level and
//! failures are surfaced immediately.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tower::timeout::{Timeout, TimeoutLayer};
use tower::{Layer, ServiceExt};

use crate::error::HttpError;
use crate::secret::SecretString;

/// Management API responses are small JSON documents; anything bigger is refused.
pub const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Error code the bridge API uses for duplicate resources.
pub const ALREADY_EXISTS_CODE: &str = "ALREADY_EXISTS";

type HyperClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Credentials attached to a management request.
#[derive(Clone, Debug)]
pub enum Credentials {
    Basic {
        username: String,
        password: SecretString,
    },
    Bearer(SecretString),
}

impl Credentials {
    fn header_value(&self) -> Result<HeaderValue, HttpError> {
        let raw = match self {
            Self::Basic { username, password } => {
                let pair = format!("{username}:{}", password.expose());
                format!(
                    "Basic {}",
                    base64::engine::general_purpose::STANDARD.encode(pair)
                )
            }
            Self::Bearer(token) => format!("Bearer {}", token.expose()),
        };
        let mut value = HeaderValue::try_from(raw)?;
        value.set_sensitive(true);
        Ok(value)
    }
}

/// Fully buffered management API response.
#[derive(Debug, Clone)]
pub struct AdminResponse {
    status: StatusCode,
    body: Bytes,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: Option<String>,
}

impl AdminResponse {
    #[must_use]
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Body as text, lossily decoded.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decode the body as JSON.
    ///
    /// # Errors
    /// Returns an error if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Structured `code` field of a JSON error body.
    ///
    /// `None` when the body is not JSON or carries no code.
    #[must_use]
    pub fn error_code(&self) -> Option<String> {
        self.json::<ErrorBody>().ok().and_then(|b| b.code)
    }
}

/// How a management response should be treated by an idempotent caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    /// 409, or 400 carrying the `ALREADY_EXISTS` code
    Duplicate,
    NotFound,
    Failure,
}

/// Classify a response using status codes and the structured error code only.
///
/// A 400 whose body cannot be parsed is a failure; message text is never
/// inspected.
#[must_use]
pub fn classify(response: &AdminResponse) -> Disposition {
    let status = response.status();
    if status.is_success() {
        return Disposition::Success;
    }
    match status {
        StatusCode::NOT_FOUND => Disposition::NotFound,
        StatusCode::CONFLICT => Disposition::Duplicate,
        StatusCode::BAD_REQUEST
            if response.error_code().as_deref() == Some(ALREADY_EXISTS_CODE) =>
        {
            Disposition::Duplicate
        }
        _ => Disposition::Failure,
    }
}

/// Percent-encode a resource name for use as a single URL path segment.
///
/// Nothing is left unescaped except RFC 3986 unreserved characters, so the
/// default vhost `/` becomes `%2F`.
#[must_use]
pub fn encode_segment(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Pooled HTTP client with a fixed per-request timeout.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Clone)]
pub struct HttpTransport {
    service: Timeout<HyperClient>,
    timeout: Duration,
}

impl HttpTransport {
    /// # Errors
    /// Returns [`HttpError::Tls`] if the rustls configuration cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config()?)
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build::<_, Full<Bytes>>(https);

        Ok(Self {
            service: TimeoutLayer::new(timeout).layer(client),
            timeout,
        })
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send one request and buffer the response.
    ///
    /// Returns `Ok` for every HTTP status; only transport failures are errors.
    ///
    /// # Errors
    /// Returns an error on invalid URLs, timeouts, connection failures, or an
    /// oversized response body.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        credentials: Option<&Credentials>,
        body: Option<&serde_json::Value>,
    ) -> Result<AdminResponse, HttpError> {
        let uri: http::Uri = url.parse().map_err(|e: http::uri::InvalidUri| {
            HttpError::InvalidUrl {
                url: url.to_owned(),
                reason: e.to_string(),
            }
        })?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(HttpError::InvalidUrl {
                url: url.to_owned(),
                reason: "absolute http(s) URL required".to_owned(),
            });
        }

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header(ACCEPT, "application/json");
        if let Some(credentials) = credentials {
            builder = builder.header(AUTHORIZATION, credentials.header_value()?);
        }
        let payload = match body {
            Some(value) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Bytes::from(serde_json::to_vec(value)?)
            }
            None => Bytes::new(),
        };
        let request = builder.body(Full::new(payload))?;

        tracing::trace!(method = %method, url, "management request");
        let response = self
            .service
            .clone()
            .oneshot(request)
            .await
            .map_err(|e| map_tower_error(e, self.timeout))?;

        let status = response.status();
        let body = Limited::new(response.into_body(), MAX_RESPONSE_BYTES)
            .collect()
            .await
            .map_err(HttpError::Body)?
            .to_bytes();

        tracing::trace!(method = %method, url, status = status.as_u16(), "management response");
        Ok(AdminResponse { status, body })
    }
}

fn map_tower_error(err: tower::BoxError, timeout: Duration) -> HttpError {
    if err.is::<tower::timeout::error::Elapsed>() {
        HttpError::Timeout(timeout)
    } else {
        HttpError::Transport(err)
    }
}

/// rustls client config over the OS trust store.
///
/// An empty trust store only produces a warning: management endpoints are
/// commonly plain HTTP inside the cluster, and HTTPS calls will then fail at
/// handshake time with a descriptive error.
fn tls_config() -> Result<rustls::ClientConfig, HttpError> {
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        tracing::warn!(error = %err, "error loading native root certificate");
    }

    let mut roots = rustls::RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    if added == 0 {
        tracing::warn!(ignored, "no usable native root CA certificates; HTTPS will fail");
    } else {
        tracing::debug!(added, ignored, "loaded native root certificates");
    }

    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

    Ok(rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| HttpError::Tls(format!("failed to set TLS protocol versions: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth())
}
