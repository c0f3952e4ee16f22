use tenant_tasks::DispatchError;
use thiserror::Error;

/// Failures of the publishing side of replication.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ReplicationError {
    /// The local write failed; nothing was dispatched
    #[error("local {operation} of '{subject}' failed: {source}")]
    Local {
        operation: &'static str,
        subject: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to serialize '{subject}': {source}")]
    Encode {
        subject: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Serialized model is not an object carrying its primary key
    #[error("'{subject}' has no usable primary key field '{field}'")]
    MissingPrimaryKey {
        subject: &'static str,
        field: &'static str,
    },

    /// The local write succeeded but the event was not delivered
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}
