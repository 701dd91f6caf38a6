//! Tumbling-window counters over CDC and application events
//!
//! Windows are aligned on event time. A window is closed by the first event
//! of its key that falls past its end; the closing event carries the summary
//! of the finished window as its derived event.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::events::cdc::CdcChange;
use crate::events::EventEnvelope;
use crate::pipeline::processor::{Processor, ProcessorError, ProcessorResult};
use crate::pipeline::processors::is_cdc;

pub const NAME: &str = "analytics";
const SOURCE: &str = "analytics-processor";

#[derive(Debug, Clone, Copy)]
pub struct AnalyticsWindows {
    pub forms: Duration,
    pub responses: Duration,
    pub default: Duration,
}

impl Default for AnalyticsWindows {
    fn default() -> Self {
        Self {
            forms: Duration::from_secs(300),
            responses: Duration::from_secs(60),
            default: Duration::from_secs(300),
        }
    }
}

impl AnalyticsWindows {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            forms: Duration::from_secs(config.analytics_form_window_secs),
            responses: Duration::from_secs(config.analytics_response_window_secs),
            default: Duration::from_secs(config.analytics_default_window_secs),
        }
    }

    fn length_for(&self, key: &str) -> Duration {
        match key {
            "forms" | "form" => self.forms,
            "responses" | "response" => self.responses,
            _ => self.default,
        }
    }
}

#[derive(Debug, Clone)]
struct Window {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    event_count: u64,
    operations: BTreeMap<String, u64>,
    tables: BTreeMap<String, u64>,
}

impl Window {
    fn open(start: DateTime<Utc>, length: ChronoDuration) -> Self {
        Self {
            start,
            end: start + length,
            event_count: 0,
            operations: BTreeMap::new(),
            tables: BTreeMap::new(),
        }
    }

    fn record(&mut self, operation: &str, table: Option<&str>) {
        self.event_count += 1;
        *self.operations.entry(operation.to_string()).or_default() += 1;
        if let Some(table) = table {
            *self.tables.entry(table.to_string()).or_default() += 1;
        }
    }

    fn summary(&self, key: &str) -> Map<String, serde_json::Value> {
        let mut data = Map::new();
        data.insert("key".into(), json!(key));
        data.insert("event_count".into(), json!(self.event_count));
        data.insert("operations".into(), json!(self.operations));
        data.insert("tables".into(), json!(self.tables));
        data.insert("window_start".into(), json!(self.start.to_rfc3339()));
        data.insert("window_end".into(), json!(self.end.to_rfc3339()));
        data
    }
}

pub struct AnalyticsProcessor {
    windows: AnalyticsWindows,
    open: Mutex<HashMap<String, Window>>,
}

impl AnalyticsProcessor {
    pub fn new(windows: AnalyticsWindows) -> Self {
        Self {
            windows,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Number of windows currently accumulating
    pub fn open_windows(&self) -> usize {
        self.open.lock().len()
    }

    fn aligned_start(at: DateTime<Utc>, length: ChronoDuration) -> DateTime<Utc> {
        let len_ms = length.num_milliseconds().max(1);
        let ts = at.timestamp_millis();
        let start = ts - ts.rem_euclid(len_ms);
        Utc.timestamp_millis_opt(start).single().unwrap_or(at)
    }

    /// Aggregation key, operation and table for an envelope
    fn classify(envelope: &EventEnvelope) -> Result<(String, String, Option<String>), ProcessorError> {
        if is_cdc(envelope) {
            let change = CdcChange::from_envelope(envelope)?;
            return Ok((
                change.table.clone(),
                change.operation.as_str().to_string(),
                Some(change.table),
            ));
        }

        let mut parts = envelope.event_type.splitn(2, '.');
        let key = parts.next().unwrap_or_default().to_string();
        let operation = parts.next().unwrap_or("event").to_string();
        Ok((key, operation, None))
    }
}

#[async_trait]
impl Processor for AnalyticsProcessor {
    fn name(&self) -> &str {
        NAME
    }

    async fn process(&self, envelope: &EventEnvelope) -> ProcessorResult {
        let (key, operation, table) = Self::classify(envelope)?;
        let length = ChronoDuration::from_std(self.windows.length_for(&key))
            .map_err(|e| ProcessorError::Permanent(format!("invalid window length: {}", e)))?;
        let at = envelope.metadata.timestamp;
        let start = Self::aligned_start(at, length);

        let closed = {
            let mut open = self.open.lock();
            let window = open
                .entry(key.clone())
                .or_insert_with(|| Window::open(start, length));

            let closed = if at >= window.end {
                Some(std::mem::replace(window, Window::open(start, length)))
            } else {
                None
            };
            // Late events count toward the window still open
            window.record(&operation, table.as_deref());
            closed
        };

        let Some(closed) = closed else {
            debug!(key = %key, operation = %operation, "Event counted");
            return Ok(Vec::new());
        };

        info!(
            key = %key,
            event_count = closed.event_count,
            window_start = %closed.start,
            "Analytics window closed"
        );
        let summary = envelope
            .derive(format!("analytics.{}", key), SOURCE, closed.summary(&key))
            .key(key)
            .build()?;
        Ok(vec![summary])
    }
}
