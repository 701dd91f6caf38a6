use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::kafka::message::OutboundRecord;

pub const DLQ_SUFFIX: &str = ".dlq";

pub fn dlq_topic(topic: &str) -> String {
    format!("{}{}", topic, DLQ_SUFFIX)
}

/// Payload written to `<original_topic>.dlq`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqRecord {
    pub original_topic: String,
    pub error: String,
    /// Processor invocations made; 0 when the message never reached one
    pub attempt_count: u32,
    pub envelope: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor: Option<String>,
    pub error_kind: String,
    pub partition: i32,
    pub offset: i64,
    pub failed_at: DateTime<Utc>,
}

impl DlqRecord {
    pub fn topic(&self) -> String {
        dlq_topic(&self.original_topic)
    }

    /// Record keyed like the original so a partition's failures stay together
    pub fn to_record(&self, key: Option<&str>) -> Result<OutboundRecord> {
        let mut record = OutboundRecord::new(self.topic(), serde_json::to_vec(self)?)
            .with_header("original-topic", self.original_topic.clone())
            .with_header("error-kind", self.error_kind.clone())
            .with_header("attempt-count", self.attempt_count.to_string());
        if let Some(processor) = &self.processor {
            record = record.with_header("processor", processor.clone());
        }
        record.key = key.filter(|k| !k.is_empty()).map(str::to_string);
        Ok(record)
    }
}

/// JSON view of an undecodable payload: parsed when possible, otherwise a string
pub fn raw_payload_value(payload: &[u8]) -> Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}
