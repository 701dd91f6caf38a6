use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::types::RDKafkaErrorCode;
use resilience::{presets, with_retry_if, RetryConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{KafkaConfig, TopicConfig};
use crate::error::{EventBusError, Result};
use crate::kafka::base_client_config;
use crate::kafka::producer::classify_error;
use crate::metrics::KafkaMetrics;

/// Topic to create when absent
#[derive(Debug, Clone, PartialEq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication: i32,
    pub retention_ms: i64,
    pub cleanup_policy: String,
}

impl TopicSpec {
    /// Spec for `name` with the configured topic defaults
    pub fn with_defaults(name: impl Into<String>, defaults: &TopicConfig) -> Self {
        Self {
            name: name.into(),
            partitions: defaults.default_partitions,
            replication: defaults.replication_factor,
            retention_ms: defaults.retention_ms,
            cleanup_policy: defaults.cleanup_policy.clone(),
        }
    }
}

/// Admin and metadata operations
#[derive(Clone)]
pub struct KafkaAdmin {
    client: Arc<AdminClient<DefaultClientContext>>,
    timeout: Duration,
    retry: RetryConfig,
    metrics: KafkaMetrics,
}

impl KafkaAdmin {
    pub fn new(config: &KafkaConfig, metrics: KafkaMetrics) -> Result<Self> {
        let client: AdminClient<DefaultClientContext> =
            base_client_config(config).create().map_err(|e| {
                error!("Failed to create Kafka admin client: {}", e);
                EventBusError::Kafka(e.to_string())
            })?;

        Ok(Self {
            client: Arc::new(client),
            timeout: config.admin_timeout(),
            retry: presets::kafka_admin_config().retry.unwrap_or_default(),
            metrics,
        })
    }

    /// Create the topic unless it already exists
    pub async fn create_topic_if_absent(&self, spec: &TopicSpec) -> Result<()> {
        with_retry_if(
            self.retry.clone(),
            || self.create_topic_once(spec),
            EventBusError::is_transient,
        )
        .await
        .map_err(|e| e.into_inner())
    }

    async fn create_topic_once(&self, spec: &TopicSpec) -> Result<()> {
        let retention = spec.retention_ms.to_string();
        let topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(spec.replication),
        )
        .set("cleanup.policy", &spec.cleanup_policy)
        .set("retention.ms", &retention);

        let options = AdminOptions::new().operation_timeout(Some(self.timeout));
        let results = self
            .client
            .create_topics([&topic], &options)
            .await
            .map_err(classify_error)?;

        for result in results {
            match result {
                Ok(name) => info!(topic = %name, partitions = spec.partitions, "Topic created"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "Topic already exists")
                }
                Err((name, code)) => {
                    warn!(topic = %name, "Topic creation failed: {}", code);
                    return Err(match code {
                        RDKafkaErrorCode::RequestTimedOut
                        | RDKafkaErrorCode::NotController
                        | RDKafkaErrorCode::BrokerTransportFailure => {
                            EventBusError::BrokerUnavailable(format!("create {}: {}", name, code))
                        }
                        _ => EventBusError::Kafka(format!("create {}: {}", name, code)),
                    });
                }
            }
        }
        Ok(())
    }

    /// Names of all topics visible to this client
    pub async fn list_topics(&self) -> Result<Vec<String>> {
        let client = Arc::clone(&self.client);
        let timeout = self.timeout;

        self.blocking(move || {
            let metadata = client
                .inner()
                .fetch_metadata(None, timeout)
                .map_err(classify_error)?;
            Ok(metadata
                .topics()
                .iter()
                .map(|t| t.name().to_string())
                .collect())
        })
        .await
    }

    /// Partition count of a topic, `NotFound` when it does not exist
    pub async fn topic_partitions(&self, name: &str) -> Result<usize> {
        let client = Arc::clone(&self.client);
        let timeout = self.timeout;
        let topic = name.to_string();

        self.blocking(move || {
            let metadata = client
                .inner()
                .fetch_metadata(Some(&topic), timeout)
                .map_err(classify_error)?;
            let found = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .ok_or_else(|| EventBusError::NotFound(format!("topic {}", topic)))?;

            match found.error() {
                None => Ok(found.partitions().len()),
                Some(_) => Err(EventBusError::NotFound(format!("topic {}", topic))),
            }
        })
        .await
    }

    /// Broker metadata is reachable and at least one broker is listed
    pub async fn health_check(&self) -> Result<()> {
        let client = Arc::clone(&self.client);
        let timeout = self.timeout;

        let result = self
            .blocking(move || {
                let metadata = client
                    .inner()
                    .fetch_metadata(None, timeout)
                    .map_err(|e| EventBusError::BrokerUnavailable(e.to_string()))?;
                if metadata.brokers().is_empty() {
                    return Err(EventBusError::BrokerUnavailable(
                        "No Kafka brokers available".into(),
                    ));
                }
                Ok(())
            })
            .await;

        self.metrics
            .broker_healthy
            .set(if result.is_ok() { 1 } else { 0 });
        result
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| EventBusError::Internal(format!("metadata task failed: {}", e)))?
    }
}
