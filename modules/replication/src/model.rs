use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::ReplicationError;

/// A model owned by one service and replicated into others.
///
/// The serialized form is the wire form: upserts carry the synchronous
/// fields of the serialized model and replicas deserialize into the same
/// type.
pub trait ReplicatedModel: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Event subject, `update_<SUBJECT>` / `delete_<SUBJECT>`
    const SUBJECT: &'static str;

    const PRIMARY_KEY: &'static str = "id";

    /// Fields sent on upsert; empty means every field.
    const SYNC_FIELDS: &'static [&'static str] = &[];
}

/// Storage key of a primary key value. Only strings and numbers qualify.
#[must_use]
pub fn record_key(pk: &Value) -> Option<String> {
    match pk {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Serializes `model` down to its synchronous fields, always keeping the
/// primary key.
///
/// # Errors
/// Returns [`ReplicationError::Encode`] if serialization fails and
/// [`ReplicationError::MissingPrimaryKey`] if the result is not an object
/// with a usable primary key.
pub fn sync_fields<M: ReplicatedModel>(model: &M) -> Result<Map<String, Value>, ReplicationError> {
    let value = serde_json::to_value(model).map_err(|source| ReplicationError::Encode {
        subject: M::SUBJECT,
        source,
    })?;
    let missing = || ReplicationError::MissingPrimaryKey {
        subject: M::SUBJECT,
        field: M::PRIMARY_KEY,
    };
    let Value::Object(mut fields) = value else {
        return Err(missing());
    };
    if fields.get(M::PRIMARY_KEY).and_then(record_key).is_none() {
        return Err(missing());
    }
    if !M::SYNC_FIELDS.is_empty() {
        fields.retain(|name, _| name == M::PRIMARY_KEY || M::SYNC_FIELDS.contains(&name.as_str()));
    }
    Ok(fields)
}
