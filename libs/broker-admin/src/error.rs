use std::time::Duration;

use thiserror::Error;

use crate::http::AdminResponse;

/// Transport-level failure talking to a management API.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// URL could not be parsed into an absolute URI
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Credential could not be encoded as a header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Request body could not be serialized
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Single request attempt timed out
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Connection refused, reset, DNS failure and friends
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Response body could not be read or exceeded the size cap
    #[error("Failed to read response body: {0}")]
    Body(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// TLS configuration could not be built
    #[error("TLS error: {0}")]
    Tls(String),
}

/// The single error type for broker and bridge provisioning failures.
///
/// Every variant names the operation that failed. Duplicates ("already
/// exists") never surface as errors; they are absorbed by the clients.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProvisioningError {
    /// The management API answered with a non-success status.
    #[error("{operation} failed with HTTP {status}: {body}")]
    Api {
        operation: String,
        status: u16,
        /// Raw response body as returned by the broker
        body: String,
    },

    /// The request never produced a response.
    #[error("{operation} failed: {source}")]
    Transport {
        operation: String,
        #[source]
        source: HttpError,
    },

    /// The response was successful but its body was not what the API documents.
    #[error("{operation} returned an unexpected response: {reason}")]
    InvalidResponse { operation: String, reason: String },

    /// The request was rejected locally before reaching the broker.
    #[error("{operation} rejected: {reason}")]
    Invalid { operation: String, reason: String },

    /// Teardown ran every step but some of them failed.
    #[error("teardown of tenant '{slug}' incomplete: {} step(s) failed", .failures.len())]
    Teardown {
        slug: String,
        failures: Vec<ProvisioningError>,
    },
}

impl ProvisioningError {
    pub(crate) fn api(operation: &str, response: &AdminResponse) -> Self {
        Self::Api {
            operation: operation.to_owned(),
            status: response.status().as_u16(),
            body: response.text(),
        }
    }

    pub(crate) fn transport(operation: &str, source: HttpError) -> Self {
        Self::Transport {
            operation: operation.to_owned(),
            source,
        }
    }

    pub fn invalid(operation: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            operation: operation.to_owned(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_response(operation: &str, reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            operation: operation.to_owned(),
            reason: reason.into(),
        }
    }

    /// Name of the failed operation (`"teardown"` for aggregate failures).
    #[must_use]
    pub fn operation(&self) -> &str {
        match self {
            Self::Api { operation, .. }
            | Self::Transport { operation, .. }
            | Self::InvalidResponse { operation, .. }
            | Self::Invalid { operation, .. } => operation,
            Self::Teardown { .. } => "teardown",
        }
    }

    /// Raw broker error body, when the broker produced one.
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Api { body, .. } => Some(body),
            _ => None,
        }
    }
}
