use async_trait::async_trait;
use thiserror::Error;

use crate::error::EventBusError;
use crate::events::EventEnvelope;

/// Processor failure, classified for the retry loop
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// Retried with backoff up to the attempt cap, then dead-lettered
    #[error("transient: {0}")]
    Transient(String),

    /// Dead-lettered without retrying
    #[error("permanent: {0}")]
    Permanent(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),
}

impl ProcessorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProcessorError::Transient(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProcessorError::Transient(_) => "processor_transient",
            ProcessorError::Permanent(_) => "processor_permanent",
            ProcessorError::InvalidEvent(_) => "invalid_event",
        }
    }
}

impl From<EventBusError> for ProcessorError {
    fn from(err: EventBusError) -> Self {
        match err {
            EventBusError::InvalidEvent(msg) => ProcessorError::InvalidEvent(msg),
            e if e.is_transient() => ProcessorError::Transient(e.to_string()),
            e => ProcessorError::Permanent(e.to_string()),
        }
    }
}

pub type ProcessorResult = std::result::Result<Vec<EventEnvelope>, ProcessorError>;

/// A typed consumer of envelopes
///
/// Returns the derived events to publish before the source offset is committed.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Registration name; also the idempotency scope
    fn name(&self) -> &str;

    async fn process(&self, envelope: &EventEnvelope) -> ProcessorResult;
}
