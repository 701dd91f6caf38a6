use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{EventBusError, Result};
use crate::kafka::message::OutboundRecord;

/// Kafka header names written on every produced envelope
pub mod headers {
    pub const EVENT_ID: &str = "event-id";
    pub const EVENT_TYPE: &str = "event-type";
    pub const SOURCE: &str = "source";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const SCHEMA_VERSION: &str = "schema-version";
    pub const CORRELATION_ID: &str = "correlation-id";
}

pub const ENVELOPE_VERSION: &str = "1.0";
pub const SCHEMA_VERSION: &str = "1";
pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const ENCODING_UTF8: &str = "utf-8";

/// Prefix of application topics: `app.<event_type>`
pub const APP_TOPIC_PREFIX: &str = "app.";

const MAX_TOPIC_LEN: usize = 249;

/// Envelope metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventMetadata {
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_topic: Option<String>,
}

fn default_version() -> String {
    ENVELOPE_VERSION.to_string()
}

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

fn default_content_type() -> String {
    CONTENT_TYPE_JSON.to_string()
}

fn default_encoding() -> String {
    ENCODING_UTF8.to_string()
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            version: default_version(),
            schema_version: default_schema_version(),
            content_type: default_content_type(),
            encoding: default_encoding(),
            retry_count: None,
            original_topic: None,
        }
    }
}

/// The unit moved through the broker
///
/// `id` is fixed when the envelope is built; a retried publish of the same
/// envelope reuses it so consumers can deduplicate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub event_type: String,
    pub source: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub metadata: EventMetadata,
}

impl EventEnvelope {
    pub fn builder(event_type: impl Into<String>, source: impl Into<String>) -> EnvelopeBuilder {
        EnvelopeBuilder::new(event_type, source)
    }

    /// Application event with a fresh id and the default topic
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: Map<String, Value>,
    ) -> Result<Self> {
        Self::builder(event_type, source).data(data).build()
    }

    /// Default application topic for an event type
    pub fn default_topic(event_type: &str) -> String {
        format!("{}{}", APP_TOPIC_PREFIX, event_type)
    }

    /// Follow-up event caused by this one; carries its correlation id
    ///
    /// The id is a name-based UUID of this event's id, the deriving source
    /// and the derived event type, so handling a redelivered event derives
    /// the same id again.
    pub fn derive(
        &self,
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: Map<String, Value>,
    ) -> EnvelopeBuilder {
        let event_type = event_type.into();
        let source = source.into();
        let correlation = self
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.id.clone());
        let id = derived_id(&self.id, &source, &event_type);
        Self::builder(event_type, source)
            .id(id)
            .data(data)
            .correlation_id(correlation)
            .header("causation-id", self.id.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(EventBusError::InvalidEvent("event id is empty".into()));
        }
        if self.event_type.trim().is_empty() {
            return Err(EventBusError::InvalidEvent("event_type is empty".into()));
        }
        if self.source.trim().is_empty() {
            return Err(EventBusError::InvalidEvent("source is empty".into()));
        }
        validate_topic_name(&self.topic).map_err(EventBusError::InvalidEvent)
    }

    /// Decode an envelope from its JSON wire form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: EventEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| EventBusError::InvalidEvent(format!("Invalid envelope format: {}", e)))?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Kafka record for this envelope, with the standard headers
    pub fn to_record(&self) -> Result<OutboundRecord> {
        let mut record = OutboundRecord::new(self.topic.clone(), self.to_bytes()?);
        record.key = self.key.clone().filter(|k| !k.is_empty());

        for (k, v) in &self.headers {
            record.headers.insert(k.clone(), v.clone());
        }
        record.headers.insert(headers::EVENT_ID.into(), self.id.clone());
        record
            .headers
            .insert(headers::EVENT_TYPE.into(), self.event_type.clone());
        record.headers.insert(headers::SOURCE.into(), self.source.clone());
        record
            .headers
            .insert(headers::CONTENT_TYPE.into(), self.metadata.content_type.clone());
        record
            .headers
            .insert(headers::SCHEMA_VERSION.into(), self.metadata.schema_version.clone());
        if let Some(correlation_id) = &self.correlation_id {
            record
                .headers
                .insert(headers::CORRELATION_ID.into(), correlation_id.clone());
        }

        Ok(record)
    }

    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str).filter(|s| !s.is_empty())
    }
}

fn derived_id(origin_id: &str, source: &str, event_type: &str) -> String {
    let name = format!("{}:{}:{}", origin_id, source, event_type);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Kafka topic names: 1..=249 chars of `[a-zA-Z0-9._-]`
pub fn validate_topic_name(topic: &str) -> std::result::Result<(), String> {
    if topic.is_empty() {
        return Err("topic is empty".into());
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(format!("topic '{}' exceeds {} characters", topic, MAX_TOPIC_LEN));
    }
    if topic == "." || topic == ".." {
        return Err(format!("topic '{}' is reserved", topic));
    }
    if let Some(c) = topic
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(format!("topic '{}' contains invalid character '{}'", topic, c));
    }
    Ok(())
}

/// Builder for [`EventEnvelope`]
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    id: Option<String>,
    correlation_id: Option<String>,
    event_type: String,
    source: String,
    data: Map<String, Value>,
    topic: Option<String>,
    key: Option<String>,
    headers: BTreeMap<String, String>,
    timestamp: Option<DateTime<Utc>>,
}

impl EnvelopeBuilder {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: None,
            correlation_id: None,
            event_type: event_type.into(),
            source: source.into(),
            data: Map::new(),
            topic: None,
            key: None,
            headers: BTreeMap::new(),
            timestamp: None,
        }
    }

    /// Fixed id, for envelopes whose identity is derived from their origin
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn maybe_topic(mut self, topic: Option<String>) -> Self {
        self.topic = topic.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn maybe_key(mut self, key: Option<String>) -> Self {
        self.key = key.filter(|k| !k.is_empty());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn build(self) -> Result<EventEnvelope> {
        if self.event_type.trim().is_empty() {
            return Err(EventBusError::Validation("event_type is required".into()));
        }
        if self.source.trim().is_empty() {
            return Err(EventBusError::Validation("source is required".into()));
        }

        let topic = self
            .topic
            .unwrap_or_else(|| EventEnvelope::default_topic(&self.event_type));
        validate_topic_name(&topic).map_err(EventBusError::Validation)?;

        let correlation_id = self
            .correlation_id
            .or_else(|| self.headers.get(headers::CORRELATION_ID).cloned());

        Ok(EventEnvelope {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            correlation_id,
            event_type: self.event_type,
            source: self.source,
            data: self.data,
            topic,
            key: self.key,
            headers: self.headers,
            metadata: EventMetadata {
                timestamp: self.timestamp.unwrap_or_else(Utc::now),
                ..EventMetadata::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_default_topic_from_event_type() {
        let env = EventEnvelope::new("form.created", "form-service", data(json!({"form_id": "f1"})))
            .unwrap();

        assert_eq!(env.topic, "app.form.created");
        assert!(!env.id.is_empty());
        assert_eq!(env.metadata.version, "1.0");
        assert_eq!(env.metadata.content_type, "application/json");
    }

    #[test]
    fn test_missing_event_type_rejected() {
        let err = EventEnvelope::builder("", "form-service").build().unwrap_err();
        assert!(matches!(err, EventBusError::Validation(_)));
    }

    #[test]
    fn test_invalid_topic_rejected() {
        let err = EventEnvelope::builder("form.created", "svc")
            .topic("bad topic!")
            .build()
            .unwrap_err();
        assert!(matches!(err, EventBusError::Validation(_)));
    }

    #[test]
    fn test_record_headers() {
        let env = EventEnvelope::builder("form.created", "form-service")
            .key("f1")
            .correlation_id("req-9")
            .header("tenant", "acme")
            .build()
            .unwrap();
        let record = env.to_record().unwrap();

        assert_eq!(record.topic, "app.form.created");
        assert_eq!(record.key.as_deref(), Some("f1"));
        assert_eq!(record.headers.get("event-id"), Some(&env.id));
        assert_eq!(record.headers["event-type"], "form.created");
        assert_eq!(record.headers["source"], "form-service");
        assert_eq!(record.headers["content-type"], "application/json");
        assert_eq!(record.headers["schema-version"], "1");
        assert_eq!(record.headers["correlation-id"], "req-9");
        assert_eq!(record.headers["tenant"], "acme");
    }

    #[test]
    fn test_wire_format_is_snake_case() {
        let env = EventEnvelope::builder("user.registered", "auth").build().unwrap();
        let value: Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();

        assert!(value.get("event_type").is_some());
        assert!(value["metadata"].get("schema_version").is_some());
        assert!(value.get("correlation_id").is_none());

        let decoded = EventEnvelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_derived_event_keeps_correlation() {
        let origin = EventEnvelope::builder("cdc.forms.create", "debezium").build().unwrap();
        let derived = origin.derive("form.created", "form-processor", Map::new()).build().unwrap();

        assert_eq!(derived.correlation_id.as_deref(), Some(origin.id.as_str()));
        assert_eq!(derived.headers["causation-id"], origin.id);
        assert_ne!(derived.id, origin.id);
    }

    #[test]
    fn test_derived_id_is_stable_across_redelivery() {
        let origin = EventEnvelope::builder("cdc.forms.create", "debezium")
            .id("cdc:forms:0/16B3748:c:7")
            .build()
            .unwrap();

        let first = origin.derive("form.created", "form-processor", Map::new()).build().unwrap();
        let again = origin.derive("form.created", "form-processor", Map::new()).build().unwrap();
        assert_eq!(first.id, again.id);

        let other_type = origin.derive("form.updated", "form-processor", Map::new()).build().unwrap();
        let other_source = origin.derive("form.created", "analytics", Map::new()).build().unwrap();
        assert_ne!(first.id, other_type.id);
        assert_ne!(first.id, other_source.id);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = EventEnvelope::from_bytes(b"not json").unwrap_err();
        assert!(matches!(err, EventBusError::InvalidEvent(_)));
    }
}
