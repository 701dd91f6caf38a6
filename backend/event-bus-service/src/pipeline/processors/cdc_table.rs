use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use tracing::debug;

use crate::events::cdc::{CdcChange, CdcOperation};
use crate::events::EventEnvelope;
use crate::pipeline::processor::{Processor, ProcessorResult};

pub const NAME: &str = "cdc-table";
const SOURCE: &str = "cdc-table-processor";

/// Republishes changes of allow-listed tables to `processed.<table>`
pub struct CdcTableProcessor {
    tables: HashSet<String>,
}

impl CdcTableProcessor {
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }

    pub fn processed_topic(table: &str) -> String {
        format!("processed.{}", table)
    }
}

#[async_trait]
impl Processor for CdcTableProcessor {
    fn name(&self) -> &str {
        NAME
    }

    async fn process(&self, envelope: &EventEnvelope) -> ProcessorResult {
        let change = CdcChange::from_envelope(envelope)?;
        if !self.tables.contains(&change.table) {
            debug!(table = %change.table, "Table not in allow-list, skipping");
            return Ok(Vec::new());
        }

        let mut data = Map::new();
        data.insert("table".into(), json!(change.table));
        data.insert("operation".into(), json!(change.operation.as_str()));
        data.insert("row".into(), change.row().cloned().unwrap_or(Value::Null));
        data.insert("before".into(), change.before.clone().unwrap_or(Value::Null));
        data.insert("after".into(), change.after.clone().unwrap_or(Value::Null));
        data.insert("ts_ms".into(), json!(change.ts_ms));
        if let Some(lsn) = change.lsn {
            data.insert("lsn".into(), json!(lsn));
        }
        if change.operation == CdcOperation::Update {
            data.insert("changed_fields".into(), json!(change.changed_fields()));
        }

        let derived = envelope
            .derive(
                format!("{}.{}", change.table, change.operation.as_str()),
                SOURCE,
                data,
            )
            .topic(Self::processed_topic(&change.table))
            .maybe_key(envelope.key.clone())
            .build()?;

        Ok(vec![derived])
    }
}
