use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::events::cdc::{CdcChange, CdcOperation};
use crate::events::EventEnvelope;
use crate::pipeline::processor::{Processor, ProcessorError, ProcessorResult};
use crate::pipeline::processors::is_cdc;

pub const NAME: &str = "form";
const SOURCE: &str = "form-processor";
const FORMS_TABLE: &str = "forms";

/// Turns `forms` row changes into `form.*` application events
///
/// Application `form.*` events are validated (they must carry `form_id`)
/// and not republished.
#[derive(Default)]
pub struct FormProcessor;

impl FormProcessor {
    pub fn new() -> Self {
        Self
    }

    fn event_type(op: CdcOperation) -> &'static str {
        match op {
            CdcOperation::Create | CdcOperation::Read => "form.created",
            CdcOperation::Update => "form.updated",
            CdcOperation::Delete => "form.deleted",
        }
    }

    fn from_change(&self, envelope: &EventEnvelope, change: &CdcChange) -> ProcessorResult {
        if change.table != FORMS_TABLE {
            return Ok(Vec::new());
        }

        let form_id = change
            .row_field("id")
            .ok_or_else(|| ProcessorError::InvalidEvent("forms row without id".into()))?;

        let mut data = Map::new();
        data.insert("form_id".into(), json!(form_id));
        data.insert("operation".into(), json!(change.operation.as_str()));
        match change.operation {
            // Deletes only have the before image
            CdcOperation::Delete => {
                data.insert("form".into(), change.before.clone().unwrap_or(Value::Null));
            }
            CdcOperation::Update => {
                data.insert("form".into(), change.after.clone().unwrap_or(Value::Null));
                data.insert("changed_fields".into(), json!(change.changed_fields()));
            }
            CdcOperation::Create | CdcOperation::Read => {
                data.insert("form".into(), change.after.clone().unwrap_or(Value::Null));
            }
        }

        let derived = envelope
            .derive(Self::event_type(change.operation), SOURCE, data)
            .key(form_id)
            .build()?;
        debug!(event_type = %derived.event_type, topic = %derived.topic, "Derived form event");
        Ok(vec![derived])
    }
}

#[async_trait]
impl Processor for FormProcessor {
    fn name(&self) -> &str {
        NAME
    }

    async fn process(&self, envelope: &EventEnvelope) -> ProcessorResult {
        if is_cdc(envelope) {
            let change = CdcChange::from_envelope(envelope)?;
            return self.from_change(envelope, &change);
        }

        let form_id = envelope.data_str("form_id").ok_or_else(|| {
            ProcessorError::InvalidEvent(format!("{} without form_id", envelope.event_type))
        })?;
        info!(event_type = %envelope.event_type, form_id = %form_id, "Form event processed");
        Ok(Vec::new())
    }
}
