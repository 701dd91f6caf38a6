//! Built-in processors

pub mod analytics;
pub mod cdc_table;
pub mod form;
pub mod response;
pub mod unrouted;

use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::events::cdc::CDC_SOURCE;
use crate::events::EventEnvelope;
use crate::pipeline::processor::Processor;

pub use analytics::{AnalyticsProcessor, AnalyticsWindows};
pub use cdc_table::CdcTableProcessor;
pub use form::FormProcessor;
pub use response::ResponseProcessor;
pub use unrouted::UnroutedSink;

pub(crate) fn is_cdc(envelope: &EventEnvelope) -> bool {
    envelope.source == CDC_SOURCE
}

/// The processors referenced by [`crate::pipeline::router::default_routes`]
pub fn default_processors(config: &PipelineConfig) -> Vec<Arc<dyn Processor>> {
    vec![
        Arc::new(CdcTableProcessor::new(config.cdc_tables.iter().cloned())),
        Arc::new(FormProcessor::new()),
        Arc::new(ResponseProcessor::new()),
        Arc::new(AnalyticsProcessor::new(AnalyticsWindows::from_config(config))),
        Arc::new(UnroutedSink::new(config.unrouted_topic.clone())),
    ]
}
