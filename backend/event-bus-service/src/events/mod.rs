//! Event model: application envelopes and Debezium change events

pub mod cdc;
pub mod envelope;

pub use cdc::{CdcChange, CdcMessage, CdcOperation, CdcPayload, CdcSource};
pub use envelope::{EnvelopeBuilder, EventEnvelope, EventMetadata};
