//! Test doubles shared by the integration tests
//!
//! - `RecordingPublisher` stands in for the Kafka producer
//! - `FakeConnectApi` scripts Kafka Connect responses
//! - helpers build Debezium records and consumed messages

#![allow(dead_code)]

use async_trait::async_trait;
use event_bus_service::connector::{
    ConnectApi, ConnectorConfig, ConnectorRuntime, ConnectorState, ConnectorStatus, TaskStatus,
};
use event_bus_service::config::PipelineConfig;
use event_bus_service::error::{EventBusError, Result};
use event_bus_service::kafka::{InboundMessage, OffsetCommitter, OutboundRecord, PublishReceipt};
use event_bus_service::kafka::EventPublisher;
use event_bus_service::metrics::ServiceMetrics;
use event_bus_service::pipeline::{Pipeline, PipelineSettings, Router};
use idempotent_consumer::{GuardConfig, IdempotencyGuard};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Captures every published record; optionally fails records for some topics
#[derive(Default)]
pub struct RecordingPublisher {
    records: Mutex<Vec<OutboundRecord>>,
    failing_suffixes: Mutex<Vec<String>>,
    offsets: AtomicUsize,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make publishes to topics ending in `suffix` fail with BrokerUnavailable
    pub fn fail_topics_ending_with(&self, suffix: &str) {
        self.failing_suffixes.lock().push(suffix.to_string());
    }

    pub fn heal(&self) {
        self.failing_suffixes.lock().clear();
    }

    pub fn records(&self) -> Vec<OutboundRecord> {
        self.records.lock().clone()
    }

    pub fn records_for(&self, topic: &str) -> Vec<OutboundRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }

    pub fn json_for(&self, topic: &str) -> Vec<Value> {
        self.records_for(topic)
            .iter()
            .map(|r| serde_json::from_slice(&r.payload).unwrap())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish_record(&self, record: OutboundRecord) -> Result<PublishReceipt> {
        if self
            .failing_suffixes
            .lock()
            .iter()
            .any(|s| record.topic.ends_with(s.as_str()))
        {
            return Err(EventBusError::BrokerUnavailable(format!(
                "{} unavailable",
                record.topic
            )));
        }

        let offset = self.offsets.fetch_add(1, Ordering::SeqCst) as i64;
        let receipt = PublishReceipt {
            topic: record.topic.clone(),
            partition: 0,
            offset,
        };
        self.records.lock().push(record);
        Ok(receipt)
    }
}

/// Commits recorded per partition
#[derive(Default)]
pub struct RecordingCommitter {
    commits: Mutex<Vec<(String, i32, i64)>>,
}

impl RecordingCommitter {
    pub fn last_commit(&self, topic: &str, partition: i32) -> Option<i64> {
        self.commits
            .lock()
            .iter()
            .rev()
            .find(|(t, p, _)| t == topic && *p == partition)
            .map(|(_, _, o)| *o)
    }
}

impl OffsetCommitter for RecordingCommitter {
    fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()> {
        self.commits
            .lock()
            .push((topic.to_string(), partition, next_offset));
        Ok(())
    }
}

/// Debezium change record value (schemas disabled)
pub fn debezium(table: &str, op: &str, before: Value, after: Value, lsn: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "before": before,
        "after": after,
        "source": {
            "version": "2.5.0",
            "connector": "postgresql",
            "name": "app-db",
            "ts_ms": 1_700_000_000_000i64,
            "db": "app",
            "schema": "public",
            "table": table,
            "lsn": lsn,
        },
        "op": op,
        "ts_ms": 1_700_000_000_123i64,
    }))
    .unwrap()
}

pub fn inbound(topic: &str, partition: i32, offset: i64, key: Option<&str>, payload: Option<Vec<u8>>) -> InboundMessage {
    InboundMessage {
        topic: topic.to_string(),
        partition,
        offset,
        key: key.map(str::to_string),
        payload,
        headers: BTreeMap::new(),
        timestamp_ms: None,
    }
}

/// Scripted Kafka Connect cluster
#[derive(Default)]
pub struct FakeConnectApi {
    configs: Mutex<HashMap<String, ConnectorConfig>>,
    states: Mutex<HashMap<String, VecDeque<ConnectorState>>>,
    current: Mutex<HashMap<String, ConnectorState>>,
    calls: Mutex<Vec<String>>,
    status_unavailable: Mutex<bool>,
    taskless: Mutex<HashSet<String>>,
}

impl FakeConnectApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connector(self, name: &str, config: ConnectorConfig, state: ConnectorState) -> Self {
        self.configs.lock().insert(name.to_string(), config);
        self.current.lock().insert(name.to_string(), state);
        self
    }

    /// States returned by the next status calls, in order; the last one sticks
    pub fn script_states(&self, name: &str, states: &[ConnectorState]) {
        self.states
            .lock()
            .insert(name.to_string(), states.iter().copied().collect());
    }

    pub fn set_status_unavailable(&self, unavailable: bool) {
        *self.status_unavailable.lock() = unavailable;
    }

    /// Report the connector with an empty task list, as before tasks are scheduled
    pub fn set_taskless(&self, name: &str, taskless: bool) {
        let mut set = self.taskless.lock();
        if taskless {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn config_of(&self, name: &str) -> Option<ConnectorConfig> {
        self.configs.lock().get(name).cloned()
    }

    fn record(&self, call: &str, name: &str) {
        self.calls.lock().push(format!("{} {}", call, name));
    }

    fn exists(&self, name: &str) -> Result<()> {
        if self.configs.lock().contains_key(name) {
            Ok(())
        } else {
            Err(EventBusError::NotFound(format!("connector {}", name)))
        }
    }
}

#[async_trait]
impl ConnectApi for FakeConnectApi {
    async fn list_connectors(&self) -> Result<Vec<String>> {
        Ok(self.configs.lock().keys().cloned().collect())
    }

    async fn get_config(&self, name: &str) -> Result<Option<ConnectorConfig>> {
        self.record("get_config", name);
        Ok(self.configs.lock().get(name).cloned())
    }

    async fn create_connector(&self, name: &str, config: &ConnectorConfig) -> Result<()> {
        self.record("create", name);
        self.configs.lock().insert(name.to_string(), config.clone());
        self.current
            .lock()
            .insert(name.to_string(), ConnectorState::Running);
        Ok(())
    }

    async fn update_config(&self, name: &str, config: &ConnectorConfig) -> Result<()> {
        self.record("update", name);
        self.exists(name)?;
        self.configs.lock().insert(name.to_string(), config.clone());
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<ConnectorStatus> {
        self.record("status", name);
        if *self.status_unavailable.lock() {
            return Err(EventBusError::Connect {
                status: Some(503),
                message: "worker rebalancing".into(),
            });
        }
        self.exists(name)?;

        let scripted = {
            let mut states = self.states.lock();
            states.get_mut(name).and_then(|queue| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().copied()
                }
            })
        };
        let state = match scripted {
            Some(state) => state,
            None => self
                .current
                .lock()
                .get(name)
                .copied()
                .unwrap_or(ConnectorState::Running),
        };

        let tasks = if self.taskless.lock().contains(name) {
            Vec::new()
        } else {
            vec![TaskStatus {
                id: 0,
                state,
                worker_id: Some("connect-1:8083".into()),
                trace: (state == ConnectorState::Failed).then(|| "replication slot lost".into()),
            }]
        };

        Ok(ConnectorStatus {
            name: name.to_string(),
            connector: ConnectorRuntime {
                state,
                worker_id: Some("connect-1:8083".into()),
                trace: None,
            },
            tasks,
        })
    }

    async fn restart(&self, name: &str) -> Result<()> {
        self.record("restart", name);
        self.exists(name)
    }

    async fn pause(&self, name: &str) -> Result<()> {
        self.record("pause", name);
        self.exists(name)?;
        self.current
            .lock()
            .insert(name.to_string(), ConnectorState::Paused);
        Ok(())
    }

    async fn resume(&self, name: &str) -> Result<()> {
        self.record("resume", name);
        self.exists(name)?;
        self.current
            .lock()
            .insert(name.to_string(), ConnectorState::Running);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.record("delete", name);
        self.exists(name)?;
        self.configs.lock().remove(name);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Pipeline settings with millisecond backoffs
pub fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        topics: vec!["cdc.forms".into(), "cdc.responses".into(), "app.form.created".into()],
        max_attempts: 3,
        retry_backoff_initial_ms: 1,
        retry_backoff_max_ms: 5,
        processor_timeout_ms: 2_000,
        drain_timeout_ms: 1_000,
        worker_queue_capacity: 16,
        idempotency_max_keys: 10_000,
        idempotency_ids_per_key: 64,
        idempotency_retention_secs: 3_600,
        idempotency_cleanup_interval_secs: 60,
        unrouted_topic: "events.unrouted".into(),
        cdc_tables: vec!["forms".into(), "responses".into(), "users".into()],
        analytics_form_window_secs: 300,
        analytics_response_window_secs: 60,
        analytics_default_window_secs: 300,
        broker_health_interval_secs: 30,
    }
}

/// Pipeline with the built-in processors and routes
pub fn default_pipeline(publisher: Arc<RecordingPublisher>) -> Pipeline {
    Pipeline::from_config(
        &pipeline_config(),
        publisher,
        ServiceMetrics::new().unwrap().pipeline,
    )
    .unwrap()
}

/// Pipeline over a custom router
pub fn custom_pipeline(router: Router, publisher: Arc<RecordingPublisher>) -> Pipeline {
    Pipeline::new(
        router,
        publisher,
        IdempotencyGuard::new(GuardConfig::default()),
        PipelineSettings::from_config(&pipeline_config()),
        ServiceMetrics::new().unwrap().pipeline,
    )
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
