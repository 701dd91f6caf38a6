//! Starts and stops the broker client, connector supervision and pipeline
//!
//! Start order is broker → connectors → pipeline; the pipeline only
//! subscribes once the broker answered a metadata request. Shutdown runs in
//! reverse: stop consumption and drain the partition workers, stop the
//! periodic tasks, pause connectors, flush the producer.

use resilience::{presets, with_deadline, with_retry};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connector::{
    ConnectorHealth, ConnectorManager, ConnectorReport, ConnectorSpec, KafkaConnectClient,
    RestartPolicy,
};
use crate::error::{EventBusError, Result};
use crate::events::cdc::cdc_topic;
use crate::events::EventEnvelope;
use crate::kafka::{
    DeliveryReport, EventPublisher, KafkaAdmin, KafkaProducer, PartitionedConsumer, TopicSpec,
};
use crate::lifecycle::health::{ComponentStatus, HealthState};
use crate::metrics::ServiceMetrics;
use crate::pipeline::processors::CdcTableProcessor;
use crate::pipeline::{dlq_topic, Pipeline};

/// Extra time for flushing the producer after the drain
const PRODUCER_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Spawn `tick` every `period` until `token` is cancelled
///
/// A tick that is already running finishes before the task exits.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; start after one period
        interval.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
        debug!(task = name, "Periodic task stopped");
    })
}

/// Topics the service produces to or consumes from
pub fn required_topics(config: &Config) -> Vec<String> {
    let mut topics = BTreeSet::new();

    for topic in &config.pipeline.topics {
        topics.insert(topic.clone());
        topics.insert(dlq_topic(topic));
    }
    for table in &config.connector.tables {
        topics.insert(cdc_topic(table));
    }
    for table in &config.pipeline.cdc_tables {
        topics.insert(CdcTableProcessor::processed_topic(table));
        topics.insert(EventEnvelope::default_topic(&format!("analytics.{}", table)));
    }
    for event_type in [
        "form.created",
        "form.updated",
        "form.deleted",
        "response.submitted",
        "response.updated",
        "response.deleted",
        "analytics.form",
        "analytics.response",
        "analytics.user",
    ] {
        topics.insert(EventEnvelope::default_topic(event_type));
    }
    topics.insert(config.pipeline.unrouted_topic.clone());

    topics.into_iter().collect()
}

/// Owns every long-running component of the service
pub struct Orchestrator {
    config: Config,
    metrics: ServiceMetrics,
    health: HealthState,
    producer: Arc<KafkaProducer>,
    delivery_rx: Option<mpsc::UnboundedReceiver<DeliveryReport>>,
    admin: KafkaAdmin,
    connectors: Arc<ConnectorManager>,
    connector_spec: ConnectorSpec,
    pipeline: Arc<Pipeline>,
    /// Periodic tasks
    tasks_token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    consumer_token: CancellationToken,
    consumer: Option<JoinHandle<Result<()>>>,
    delivery_token: CancellationToken,
    delivery: Option<JoinHandle<()>>,
}

impl Orchestrator {
    /// Build all clients; nothing is contacted until [`Orchestrator::start`]
    pub fn new(config: Config, metrics: ServiceMetrics) -> Result<Self> {
        let (producer, delivery_rx) = KafkaProducer::new(&config.kafka, metrics.kafka.clone())?;
        let producer = Arc::new(producer);
        let admin = KafkaAdmin::new(&config.kafka, metrics.kafka.clone())?;

        let connect_client = KafkaConnectClient::new(&config.connect)?;
        let connectors = Arc::new(ConnectorManager::new(
            Arc::new(connect_client),
            RestartPolicy::from_config(&config.connect),
            metrics.connectors.clone(),
        ));
        let connector_spec = ConnectorSpec::postgres(&config.connector);

        let publisher: Arc<dyn EventPublisher> = producer.clone();
        let pipeline = Arc::new(Pipeline::from_config(
            &config.pipeline,
            publisher,
            metrics.pipeline.clone(),
        )?);

        Ok(Self {
            config,
            metrics,
            health: HealthState::new(),
            producer,
            delivery_rx: Some(delivery_rx),
            admin,
            connectors,
            connector_spec,
            pipeline,
            tasks_token: CancellationToken::new(),
            tasks: Vec::new(),
            consumer_token: CancellationToken::new(),
            consumer: None,
            delivery_token: CancellationToken::new(),
            delivery: None,
        })
    }

    pub fn health(&self) -> HealthState {
        self.health.clone()
    }

    pub fn publisher(&self) -> Arc<dyn EventPublisher> {
        self.producer.clone()
    }

    pub fn producer(&self) -> Arc<KafkaProducer> {
        self.producer.clone()
    }

    pub fn connectors(&self) -> Arc<ConnectorManager> {
        self.connectors.clone()
    }

    pub fn metrics(&self) -> &ServiceMetrics {
        &self.metrics
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Starting event bus components");

        self.start_broker().await?;
        self.start_connectors().await;
        self.start_pipeline()?;
        self.start_periodic_tasks();

        info!("Event bus started");
        Ok(())
    }

    async fn start_broker(&mut self) -> Result<()> {
        let retry = presets::kafka_admin_config().retry.unwrap_or_default();
        let admin = self.admin.clone();

        if let Err(e) = with_retry(retry, || admin.health_check()).await {
            let err = e.into_inner();
            error!("Kafka is not reachable: {}", err);
            self.health
                .set_kafka(ComponentStatus::Unhealthy, Some(err.to_string()));
            return Err(EventBusError::BrokerUnavailable(err.to_string()));
        }
        self.health.set_kafka(ComponentStatus::Healthy, None);
        info!(brokers = %self.config.kafka.brokers, "Kafka reachable");

        for topic in required_topics(&self.config) {
            let spec = TopicSpec::with_defaults(topic, &self.config.topics);
            // Auto-creation on the broker may still cover a topic we could not create
            if let Err(e) = self.admin.create_topic_if_absent(&spec).await {
                warn!(topic = %spec.name, "Could not create topic: {}", e);
            }
        }

        if let Some(rx) = self.delivery_rx.take() {
            let token = self.delivery_token.clone();
            self.delivery = Some(tokio::spawn(drain_delivery_reports(rx, token)));
        }
        Ok(())
    }

    /// Connector problems degrade health but never abort startup
    async fn start_connectors(&mut self) {
        match self.connectors.ensure_connector(&self.connector_spec).await {
            Ok(outcome) => {
                info!(connector = %self.connector_spec.name, outcome = ?outcome, "CDC connector ready")
            }
            Err(e) => {
                warn!(connector = %self.connector_spec.name, "Could not ensure CDC connector: {}", e);
                self.connectors.supervise(self.connector_spec.clone());
            }
        }

        let reports = self.connectors.poll_health().await;
        record_cdc_health(&self.health, &reports);
    }

    fn start_pipeline(&mut self) -> Result<()> {
        let consumer = PartitionedConsumer::subscribe(
            &self.config.kafka,
            self.config.pipeline.topics.clone(),
            self.pipeline.clone(),
            self.config.pipeline.worker_queue_capacity,
            self.config.pipeline.drain_timeout(),
            self.metrics.kafka.clone(),
        )?;

        let token = self.consumer_token.clone();
        let run = consumer.run(token.clone());
        self.health.set_pipeline(ComponentStatus::Healthy, None);
        self.consumer = Some(tokio::spawn(watch_consumer(run, token, self.health.clone())));
        Ok(())
    }

    fn start_periodic_tasks(&mut self) {
        let connectors = self.connectors.clone();
        let health = self.health.clone();
        self.tasks.push((
            "connector-poll",
            spawn_periodic(
                "connector-poll",
                self.config.connect.poll_interval(),
                self.tasks_token.child_token(),
                move || {
                    let connectors = connectors.clone();
                    let health = health.clone();
                    async move {
                        let reports = connectors.poll_health().await;
                        record_cdc_health(&health, &reports);
                    }
                },
            ),
        ));

        let pipeline = self.pipeline.clone();
        self.tasks.push((
            "idempotency-cleanup",
            spawn_periodic(
                "idempotency-cleanup",
                Duration::from_secs(self.config.pipeline.idempotency_cleanup_interval_secs),
                self.tasks_token.child_token(),
                move || {
                    let pipeline = pipeline.clone();
                    async move {
                        let removed = pipeline.cleanup_idempotency();
                        if removed > 0 {
                            info!(removed, "Expired idempotency entries removed");
                        }
                    }
                },
            ),
        ));

        let admin = self.admin.clone();
        let health = self.health.clone();
        self.tasks.push((
            "broker-health",
            spawn_periodic(
                "broker-health",
                Duration::from_secs(self.config.pipeline.broker_health_interval_secs),
                self.tasks_token.child_token(),
                move || {
                    let admin = admin.clone();
                    let health = health.clone();
                    async move {
                        match admin.health_check().await {
                            Ok(()) => health.set_kafka(ComponentStatus::Healthy, None),
                            Err(e) => {
                                warn!("Kafka health check failed: {}", e);
                                health.set_kafka(ComponentStatus::Unhealthy, Some(e.to_string()));
                            }
                        }
                    }
                },
            ),
        ));
    }

    /// Reverse-order shutdown; every step is bounded
    pub async fn shutdown(&mut self) {
        info!("Shutting down event bus");
        let drain_timeout = self.config.pipeline.drain_timeout();
        // The consumer drains its workers within the drain timeout itself
        let drain_deadline = Instant::now() + drain_timeout + Duration::from_secs(1);

        self.consumer_token.cancel();
        if let Some(mut consumer) = self.consumer.take() {
            match with_deadline(drain_deadline, &mut consumer).await {
                Ok(Ok(Ok(()))) => info!("Consumer stopped"),
                Ok(Ok(Err(e))) => warn!("Consumer stopped with error: {}", e),
                Ok(Err(e)) => error!("Consumer task panicked: {}", e),
                Err(_) => {
                    warn!("Consumer did not stop within {:?}, aborting", drain_timeout);
                    consumer.abort();
                }
            }
        }

        self.tasks_token.cancel();
        for (name, task) in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(task = name, "Periodic task failed: {}", e);
            }
        }

        self.connectors.shutdown().await;

        if let Err(e) = self.producer.close(PRODUCER_FLUSH_TIMEOUT).await {
            warn!("Producer did not flush cleanly: {}", e);
        }

        self.delivery_token.cancel();
        if let Some(delivery) = self.delivery.take() {
            let _ = delivery.await;
        }

        self.health
            .set_kafka(ComponentStatus::Unhealthy, Some("shut down".into()));
        self.health
            .set_pipeline(ComponentStatus::Unhealthy, Some("shut down".into()));
        info!("Event bus stopped");
    }
}

/// Run the consume loop; an exit that was not asked for marks the pipeline unhealthy
async fn watch_consumer<F>(run: F, token: CancellationToken, health: HealthState) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let result = run.await;
    if let Err(e) = &result {
        error!("Consumer loop exited with error: {}", e);
    }
    if !token.is_cancelled() {
        let message = match &result {
            Ok(()) => "consumer loop exited".to_string(),
            Err(e) => format!("consumer loop failed: {}", e),
        };
        health.set_pipeline(ComponentStatus::Unhealthy, Some(message));
    }
    result
}

fn record_cdc_health(health: &HealthState, reports: &[ConnectorReport]) {
    let failing: Vec<&ConnectorReport> = reports
        .iter()
        .filter(|r| r.health != ConnectorHealth::Healthy)
        .collect();

    if failing.is_empty() {
        health.set_cdc(ComponentStatus::Healthy, None);
        return;
    }

    let status = if failing.iter().any(|r| r.health == ConnectorHealth::Unhealthy) {
        ComponentStatus::Unhealthy
    } else {
        ComponentStatus::Degraded
    };
    let message = failing
        .iter()
        .map(|r| format!("{} ({})", r.name, r.phase))
        .collect::<Vec<_>>()
        .join(", ");
    health.set_cdc(status, Some(message));
}

async fn drain_delivery_reports(
    mut rx: mpsc::UnboundedReceiver<DeliveryReport>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            report = rx.recv() => match report {
                Some(report) => match report.outcome {
                    Ok(receipt) => debug!(
                        event_id = %report.event_id,
                        topic = %receipt.topic,
                        partition = receipt.partition,
                        offset = receipt.offset,
                        "Async publish delivered"
                    ),
                    Err(e) => error!(
                        event_id = %report.event_id,
                        topic = %report.topic,
                        "Async publish failed: {}",
                        e
                    ),
                },
                None => break,
            },
        }
    }
}
