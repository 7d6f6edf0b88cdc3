//! Records as the archiver sees them: an opaque JSON document plus the
//! identifier it is ordered and deleted by.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Unique, totally ordered record identifier.
///
/// Integers order before text, matching how SQLite compares mixed values.
/// Extended-JSON object ids (`{"$oid": "..."}`) decode to their hex text,
/// which sorts in generation order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Text(String),
}

impl RecordId {
    pub fn from_json(value: &Value) -> Result<Self, RecordShapeError> {
        match value {
            Value::Number(n) => n.as_i64().map(RecordId::Int).ok_or_else(|| {
                RecordShapeError::UnsupportedIdentifier {
                    kind: "non-integer number",
                }
            }),
            Value::String(s) => Ok(RecordId::Text(s.clone())),
            Value::Object(map) if map.len() == 1 => {
                if let Some(Value::String(oid)) = map.get("$oid") {
                    return Ok(RecordId::Text(oid.clone()));
                }
                if let Some(Value::String(long)) = map.get("$numberLong") {
                    return long.parse().map(RecordId::Int).map_err(|_| {
                        RecordShapeError::UnsupportedIdentifier {
                            kind: "malformed $numberLong",
                        }
                    });
                }
                Err(RecordShapeError::UnsupportedIdentifier { kind: "object" })
            }
            Value::Object(_) => Err(RecordShapeError::UnsupportedIdentifier { kind: "object" }),
            Value::Null => Err(RecordShapeError::UnsupportedIdentifier { kind: "null" }),
            Value::Bool(_) => Err(RecordShapeError::UnsupportedIdentifier { kind: "bool" }),
            Value::Array(_) => Err(RecordShapeError::UnsupportedIdentifier { kind: "array" }),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            RecordId::Int(i) => Value::from(*i),
            RecordId::Text(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(i) => write!(f, "{i}"),
            RecordId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        RecordId::Int(value)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        RecordId::Text(value.to_string())
    }
}

/// A document whose shape prevents archiving it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordShapeError {
    #[error("document has no '{0}' field")]
    MissingField(String),

    #[error("unsupported identifier type: {kind}")]
    UnsupportedIdentifier { kind: &'static str },

    #[error("field '{0}' is not a timestamp")]
    InvalidTimestamp(String),
}

/// Look up a possibly dotted field path (`meta.createdAt`) in a document.
pub fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |value, segment| value.get(segment))
}

/// Decode a timestamp: RFC 3339 text, epoch milliseconds, or extended JSON
/// (`{"$date": ...}`, `{"$numberLong": "..."}`).
pub fn timestamp_from_json(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Object(map) => {
            if let Some(inner) = map.get("$date") {
                return timestamp_from_json(inner);
            }
            map.get("$numberLong")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<i64>().ok())
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        }
        _ => None,
    }
}

/// One source document together with its decoded identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub document: Value,
}

impl Record {
    /// Decode the identifier stored under `id_field`.
    pub fn from_document(document: Value, id_field: &str) -> Result<Self, RecordShapeError> {
        let raw = lookup(&document, id_field)
            .ok_or_else(|| RecordShapeError::MissingField(id_field.to_string()))?;
        let id = RecordId::from_json(raw)?;
        Ok(Self { id, document })
    }

    /// Value of the age field.
    pub fn age(&self, age_field: &str) -> Result<DateTime<Utc>, RecordShapeError> {
        let raw = lookup(&self.document, age_field)
            .ok_or_else(|| RecordShapeError::MissingField(age_field.to_string()))?;
        timestamp_from_json(raw).ok_or_else(|| RecordShapeError::InvalidTimestamp(age_field.to_string()))
    }
}
