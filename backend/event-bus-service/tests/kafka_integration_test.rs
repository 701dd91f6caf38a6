//! End-to-end flow through a real broker
//!
//! Run with `cargo test --test kafka_integration_test -- --ignored` against a
//! broker at `KAFKA_BROKERS` (default `localhost:9092`).

mod common;

use async_trait::async_trait;
use common::{debezium, eventually};
use event_bus_service::config::Config;
use event_bus_service::error::Result;
use event_bus_service::kafka::{
    EventPublisher, InboundMessage, KafkaAdmin, KafkaProducer, MessageHandler, OutboundRecord,
    PartitionedConsumer, TopicSpec,
};
use event_bus_service::metrics::ServiceMetrics;
use event_bus_service::pipeline::Pipeline;
use parking_lot::Mutex;
use serde_json::{json, Value};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Capture {
    events: Mutex<Vec<Value>>,
}

#[async_trait]
impl MessageHandler for Capture {
    async fn handle(&self, message: &InboundMessage) -> Result<()> {
        if let Some(payload) = &message.payload {
            if let Ok(value) = serde_json::from_slice(payload) {
                self.events.lock().push(value);
            }
        }
        Ok(())
    }
}

fn test_config() -> Config {
    let mut config = Config::from_env().unwrap();
    config.kafka.group_id = format!("event-bus-it-{}", uuid::Uuid::new_v4());
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "Requires Kafka"]
#[serial]
async fn test_cdc_form_create_reaches_app_topic() {
    let config = test_config();
    let metrics = ServiceMetrics::new().unwrap();

    let admin = KafkaAdmin::new(&config.kafka, metrics.kafka.clone()).unwrap();
    admin.health_check().await.unwrap();
    for topic in ["cdc.forms", "cdc.forms.dlq", "processed.forms", "app.form.created", "events.unrouted"] {
        admin
            .create_topic_if_absent(&TopicSpec::with_defaults(topic, &config.topics))
            .await
            .unwrap();
    }

    let (producer, _reports) = KafkaProducer::new(&config.kafka, metrics.kafka.clone()).unwrap();
    let producer = Arc::new(producer);

    let pipeline = Arc::new(
        Pipeline::from_config(&config.pipeline, producer.clone(), metrics.pipeline.clone()).unwrap(),
    );
    let cancel = CancellationToken::new();
    let consumer = PartitionedConsumer::subscribe(
        &config.kafka,
        vec!["cdc.forms".into()],
        pipeline,
        16,
        Duration::from_secs(5),
        metrics.kafka.clone(),
    )
    .unwrap();
    let pipeline_task = tokio::spawn(consumer.run(cancel.clone()));

    let capture = Arc::new(Capture::default());
    let mut capture_config = config.kafka.clone();
    capture_config.group_id = format!("{}-capture", config.kafka.group_id);
    let observer = PartitionedConsumer::subscribe(
        &capture_config,
        vec!["app.form.created".into()],
        capture.clone(),
        16,
        Duration::from_secs(5),
        metrics.kafka.clone(),
    )
    .unwrap();
    let observer_task = tokio::spawn(observer.run(cancel.clone()));

    let form_id = uuid::Uuid::new_v4().to_string();
    let record = OutboundRecord::new(
        "cdc.forms",
        debezium("forms", "c", Value::Null, json!({"id": form_id, "title": "IT"}), 1),
    )
    .with_key(json!({ "id": form_id }).to_string());
    producer.publish_record(record).await.unwrap();

    let seen = eventually(Duration::from_secs(60), || {
        capture
            .events
            .lock()
            .iter()
            .any(|e| e["data"]["form_id"] == form_id.as_str())
    })
    .await;

    cancel.cancel();
    pipeline_task.await.unwrap().unwrap();
    observer_task.await.unwrap().unwrap();
    producer.close(Duration::from_secs(5)).await.unwrap();

    assert!(seen, "form.created for {} never arrived", form_id);
}
