use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

use super::envelope::EventEnvelope;
use crate::error::{EventBusError, Result};

/// Source name stamped on envelopes built from change events
pub const CDC_SOURCE: &str = "debezium";

/// CDC topic for a table: `cdc.<table>`
pub fn cdc_topic(table: &str) -> String {
    format!("cdc.{}", table)
}

/// CDC operation types from Debezium
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CdcOperation {
    /// c = create
    #[serde(rename = "c")]
    Create,
    /// u = update
    #[serde(rename = "u")]
    Update,
    /// d = delete
    #[serde(rename = "d")]
    Delete,
    /// r = read, initial snapshot
    #[serde(rename = "r")]
    Read,
}

impl CdcOperation {
    /// Check if operation modifies data (excludes Read)
    pub fn is_mutating(&self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Delete)
    }

    /// Long name used in event types: `cdc.<table>.<name>`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Read => "read",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "create" | "c" => Some(Self::Create),
            "update" | "u" => Some(Self::Update),
            "delete" | "d" => Some(Self::Delete),
            "read" | "r" => Some(Self::Read),
            _ => None,
        }
    }
}

/// CDC message structure from Debezium
///
/// When `value.converter.schemas.enable = false`, Debezium sends the payload directly
/// without a wrapper object. This enum handles both formats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CdcMessage {
    /// Format with schema wrapper (value.converter.schemas.enable = true)
    WithSchema {
        #[serde(default)]
        schema: Option<Value>,
        payload: CdcPayload,
    },
    /// Format without schema wrapper (value.converter.schemas.enable = false)
    WithoutSchema(CdcPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CdcPayload {
    /// State before the change (null for create, populated for update/delete)
    #[serde(default)]
    pub before: Option<Value>,

    /// State after the change (populated for create/update, null for delete)
    #[serde(default)]
    pub after: Option<Value>,

    /// Source metadata (database, table, log position, etc.)
    pub source: CdcSource,

    /// Operation type (c/u/d/r)
    pub op: CdcOperation,

    /// Transaction timestamp in milliseconds since epoch
    #[serde(default)]
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CdcSource {
    #[serde(default)]
    pub version: String,

    /// Connector type (e.g., "postgresql")
    #[serde(default)]
    pub connector: String,

    /// Logical name of the database server
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub ts_ms: i64,

    #[serde(default)]
    pub db: String,

    /// Schema name (for PostgreSQL)
    #[serde(default)]
    pub schema: Option<String>,

    pub table: String,

    /// Replication log position
    #[serde(default)]
    pub lsn: Option<i64>,

    #[serde(default, rename = "txId")]
    pub tx_id: Option<i64>,
}

impl CdcMessage {
    /// Decode and validate a Debezium record value
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let msg: CdcMessage = serde_json::from_slice(bytes).map_err(|e| {
            EventBusError::InvalidEvent(format!("Invalid CDC message format: {}", e))
        })?;
        msg.validate()?;
        Ok(msg)
    }

    /// Get the payload regardless of message format
    pub fn payload(&self) -> &CdcPayload {
        match self {
            CdcMessage::WithSchema { payload, .. } => payload,
            CdcMessage::WithoutSchema(payload) => payload,
        }
    }

    /// Row schema, when the converter ships it
    pub fn schema(&self) -> Option<&Value> {
        match self {
            CdcMessage::WithSchema { schema, .. } => schema.as_ref(),
            CdcMessage::WithoutSchema(_) => None,
        }
    }

    /// Validate the CDC message structure
    pub fn validate(&self) -> Result<()> {
        self.payload().validate()
    }

    pub fn table(&self) -> &str {
        &self.payload().source.table
    }

    pub fn operation(&self) -> CdcOperation {
        self.payload().op
    }

    /// Get the timestamp as DateTime
    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.payload().ts_ms).unwrap_or_else(Utc::now)
    }

    /// Extract a field from the 'after' or 'before' payload
    pub fn get_field(&self, field_name: &str) -> Option<&Value> {
        let payload = self.payload();
        payload
            .after
            .as_ref()
            .or(payload.before.as_ref())
            .and_then(|v| v.get(field_name))
    }

    /// Extract a field as a specific type
    pub fn get_field_as<T>(&self, field_name: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.get_field(field_name)
            .ok_or_else(|| EventBusError::InvalidEvent(format!("Field '{}' not found", field_name)))
            .and_then(|v| {
                serde_json::from_value(v.clone()).map_err(|e| {
                    EventBusError::InvalidEvent(format!(
                        "Failed to deserialize field '{}': {}",
                        field_name, e
                    ))
                })
            })
    }

    /// Build the pipeline envelope for this change
    ///
    /// The id is derived from the log position so a redelivered record maps
    /// to the same envelope id. Without an LSN the broker coordinates are used.
    pub fn to_envelope(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        record_key: Option<&str>,
    ) -> Result<EventEnvelope> {
        let payload = self.payload();
        let table = self.table();
        let op = payload.op;
        let entity_key = record_key
            .map(normalize_record_key)
            .filter(|k| !k.is_empty())
            .or_else(|| payload.row_id());

        let id = match (payload.source.lsn, entity_key.as_deref()) {
            (Some(lsn), Some(key)) => format!("cdc:{}:{}:{}:{}", table, lsn, op.as_str(), key),
            _ => format!("{}:{}:{}", topic, partition, offset),
        };

        let mut data = Map::new();
        data.insert("table".into(), Value::String(table.to_string()));
        data.insert("operation".into(), Value::String(op.as_str().to_string()));
        data.insert("before".into(), payload.before.clone().unwrap_or(Value::Null));
        data.insert("after".into(), payload.after.clone().unwrap_or(Value::Null));
        data.insert("ts_ms".into(), json!(payload.ts_ms));
        if let Some(schema) = &payload.source.schema {
            data.insert("schema".into(), Value::String(schema.clone()));
        }
        if let Some(lsn) = payload.source.lsn {
            data.insert("lsn".into(), json!(lsn));
        }
        if let Some(tx_id) = payload.source.tx_id {
            data.insert("tx_id".into(), json!(tx_id));
        }

        EventEnvelope::builder(format!("cdc.{}.{}", table, op.as_str()), CDC_SOURCE)
            .id(id)
            .topic(topic)
            .maybe_key(entity_key)
            .data(data)
            .timestamp(self.timestamp())
            .build()
    }
}

impl CdcPayload {
    /// Check `before`/`after` presence for the operation
    pub fn validate(&self) -> Result<()> {
        let has_before = self.before.as_ref().is_some_and(|v| !v.is_null());
        let has_after = self.after.as_ref().is_some_and(|v| !v.is_null());

        match self.op {
            CdcOperation::Create | CdcOperation::Read if !has_after => {
                Err(EventBusError::InvalidEvent(format!(
                    "CDC {} operation requires 'after' field",
                    self.op.as_str()
                )))
            }
            CdcOperation::Update if !has_before || !has_after => Err(EventBusError::InvalidEvent(
                "CDC update operation requires both 'before' and 'after' fields".to_string(),
            )),
            CdcOperation::Delete if !has_before => Err(EventBusError::InvalidEvent(
                "CDC delete operation requires 'before' field".to_string(),
            )),
            CdcOperation::Delete if has_after => Err(EventBusError::InvalidEvent(
                "CDC delete operation must not carry an 'after' field".to_string(),
            )),
            _ if self.source.table.is_empty() => Err(EventBusError::InvalidEvent(
                "CDC source table is empty".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Row image that describes the entity: `before` for deletes, `after` otherwise
    pub fn row(&self) -> Option<&Value> {
        match self.op {
            CdcOperation::Delete => self.before.as_ref(),
            _ => self.after.as_ref(),
        }
    }

    /// Primary key of the row, from its `id` column
    pub fn row_id(&self) -> Option<String> {
        self.row().and_then(|row| row.get("id")).and_then(value_to_key)
    }

    /// Fields whose value differs between `before` and `after`
    pub fn changed_fields(&self) -> Vec<String> {
        diff_fields(self.before.as_ref(), self.after.as_ref())
    }
}

/// View of a CDC envelope's data, as produced by [`CdcMessage::to_envelope`]
#[derive(Debug, Clone, PartialEq)]
pub struct CdcChange {
    pub table: String,
    pub operation: CdcOperation,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub lsn: Option<i64>,
    pub ts_ms: i64,
}

impl CdcChange {
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self> {
        let table = envelope
            .data_str("table")
            .ok_or_else(|| EventBusError::InvalidEvent("CDC envelope missing table".into()))?
            .to_string();
        let operation = envelope
            .data_str("operation")
            .and_then(CdcOperation::parse)
            .ok_or_else(|| EventBusError::InvalidEvent("CDC envelope missing operation".into()))?;
        let non_null = |field: &str| envelope.data.get(field).filter(|v| !v.is_null()).cloned();

        Ok(Self {
            table,
            operation,
            before: non_null("before"),
            after: non_null("after"),
            lsn: envelope.data.get("lsn").and_then(Value::as_i64),
            ts_ms: envelope.data.get("ts_ms").and_then(Value::as_i64).unwrap_or_default(),
        })
    }

    /// `before` for deletes, `after` otherwise
    pub fn row(&self) -> Option<&Value> {
        match self.operation {
            CdcOperation::Delete => self.before.as_ref(),
            _ => self.after.as_ref(),
        }
    }

    pub fn row_field(&self, field: &str) -> Option<String> {
        self.row().and_then(|row| row.get(field)).and_then(value_to_key)
    }

    pub fn changed_fields(&self) -> Vec<String> {
        diff_fields(self.before.as_ref(), self.after.as_ref())
    }
}

fn diff_fields(before: Option<&Value>, after: Option<&Value>) -> Vec<String> {
    let (Some(Value::Object(before)), Some(Value::Object(after))) = (before, after) else {
        return Vec::new();
    };

    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    keys.into_iter()
        .filter(|k| before.get(*k) != after.get(*k))
        .cloned()
        .collect()
}

/// Scalar JSON value as a key string
pub fn value_to_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Debezium record keys are JSON objects such as `{"id": 42}`
///
/// Object keys collapse to their values joined by `:`; anything else is used as-is.
pub fn normalize_record_key(raw: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(raw).ok();
    let object = match parsed {
        Some(Value::Object(map)) => map,
        Some(Value::String(s)) => return s,
        _ => return raw.to_string(),
    };

    // Schema-wrapped keys carry the fields under "payload"
    let fields = match object.get("payload") {
        Some(Value::Object(inner)) => inner.clone(),
        _ => object,
    };

    let parts: Vec<String> = fields.values().filter_map(value_to_key).collect();
    if parts.is_empty() {
        raw.to_string()
    } else {
        parts.join(":")
    }
}
