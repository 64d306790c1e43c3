//! Change events delivered over subscription channels.
//!
//! Provider callbacks of every shape are normalized into [`ChangeEvent`]
//! before they reach a reconciler, so merge logic never sees transport
//! details. Events are ephemeral: they are applied and dropped, never
//! stored.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::CoreError;
use crate::scope::Table;
use crate::time::Timestamp;

/// A raw provider row: column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

/// The operation a change event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    /// A row was created.
    Insert,
    /// A row was modified.
    Update,
    /// A row was removed.
    Delete,
}

impl ChangeOp {
    /// Stable string form for log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change delivered on a subscription.
///
/// `payload` carries the new row for inserts and the changed columns for
/// updates; deletes are identified by `entity_id` alone and may carry an
/// empty payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Table the change belongs to.
    pub table: Table,
    /// Operation.
    pub op: ChangeOp,
    /// Id of the affected row.
    pub entity_id: Uuid,
    /// New row or changed columns; may be empty for deletes.
    #[serde(default)]
    pub payload: Row,
    /// Server-side emission time.
    pub server_ts: Timestamp,
}

impl ChangeEvent {
    /// Build an event.
    pub fn new(
        table: Table,
        op: ChangeOp,
        entity_id: Uuid,
        payload: Row,
        server_ts: Timestamp,
    ) -> Self {
        Self {
            table,
            op,
            entity_id,
            payload,
            server_ts,
        }
    }

    /// A payload column as a string, if present.
    pub fn payload_str(&self, column: &str) -> Option<&str> {
        self.payload.get(column).and_then(Value::as_str)
    }

    /// A payload column parsed as a UUID, if present and well formed.
    pub fn payload_uuid(&self, column: &str) -> Option<Uuid> {
        self.payload_str(column).and_then(|s| Uuid::parse_str(s).ok())
    }
}

/// Decode a raw row into a typed record.
pub fn decode_row<T: DeserializeOwned>(row: &Row) -> Result<T, CoreError> {
    serde_json::from_value(Value::Object(row.clone())).map_err(CoreError::from)
}

/// Serialize a record back into a raw row.
///
/// Fails only if the record does not serialize to a JSON object, which
/// would be a programming error in the record type itself.
pub fn encode_row<T: Serialize>(record: &T) -> Result<Row, CoreError> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        other => Err(CoreError::decode(format!(
            "record serialized to {} instead of an object",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
