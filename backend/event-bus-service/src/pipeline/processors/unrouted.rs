use async_trait::async_trait;
use tracing::warn;

use crate::events::EventEnvelope;
use crate::pipeline::processor::{Processor, ProcessorResult};

pub const NAME: &str = "unrouted";

/// Sink for events no route matches: parks them on a dedicated topic
pub struct UnroutedSink {
    topic: String,
}

impl UnroutedSink {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl Processor for UnroutedSink {
    fn name(&self) -> &str {
        NAME
    }

    async fn process(&self, envelope: &EventEnvelope) -> ProcessorResult {
        warn!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            topic = %envelope.topic,
            "No route for event, forwarding to {}",
            self.topic
        );

        // Same id so consumers of the sink can dedupe redeliveries
        let mut parked = envelope.clone();
        parked.metadata.original_topic = Some(envelope.topic.clone());
        parked.topic = self.topic.clone();
        Ok(vec![parked])
    }
}
