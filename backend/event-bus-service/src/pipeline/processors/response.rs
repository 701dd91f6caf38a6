use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::events::cdc::{CdcChange, CdcOperation};
use crate::events::EventEnvelope;
use crate::pipeline::processor::{Processor, ProcessorError, ProcessorResult};
use crate::pipeline::processors::is_cdc;

pub const NAME: &str = "response";
const SOURCE: &str = "response-processor";
const RESPONSES_TABLE: &str = "responses";

/// Turns `responses` row changes into `response.*` events keyed by form
#[derive(Default)]
pub struct ResponseProcessor;

impl ResponseProcessor {
    pub fn new() -> Self {
        Self
    }

    fn event_type(op: CdcOperation) -> &'static str {
        match op {
            CdcOperation::Create | CdcOperation::Read => "response.submitted",
            CdcOperation::Update => "response.updated",
            CdcOperation::Delete => "response.deleted",
        }
    }

    fn from_change(&self, envelope: &EventEnvelope, change: &CdcChange) -> ProcessorResult {
        if change.table != RESPONSES_TABLE {
            return Ok(Vec::new());
        }

        let response_id = change
            .row_field("id")
            .ok_or_else(|| ProcessorError::InvalidEvent("responses row without id".into()))?;
        let form_id = change.row_field("form_id");

        let mut data = Map::new();
        data.insert("response_id".into(), json!(response_id));
        data.insert("form_id".into(), form_id.clone().map_or(Value::Null, Value::String));
        data.insert("operation".into(), json!(change.operation.as_str()));
        data.insert("response".into(), change.row().cloned().unwrap_or(Value::Null));

        // Keyed by form so all responses of a form share a partition
        let derived = envelope
            .derive(Self::event_type(change.operation), SOURCE, data)
            .key(form_id.unwrap_or(response_id))
            .build()?;
        debug!(event_type = %derived.event_type, key = ?derived.key, "Derived response event");
        Ok(vec![derived])
    }
}

#[async_trait]
impl Processor for ResponseProcessor {
    fn name(&self) -> &str {
        NAME
    }

    async fn process(&self, envelope: &EventEnvelope) -> ProcessorResult {
        if is_cdc(envelope) {
            let change = CdcChange::from_envelope(envelope)?;
            return self.from_change(envelope, &change);
        }

        let response_id = envelope.data_str("response_id").ok_or_else(|| {
            ProcessorError::InvalidEvent(format!("{} without response_id", envelope.event_type))
        })?;
        info!(
            event_type = %envelope.event_type,
            response_id = %response_id,
            form_id = ?envelope.data_str("form_id"),
            "Response event processed"
        );
        Ok(Vec::new())
    }
}
