use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use resilience::{presets, with_retry_if, with_timeout, RetryConfig};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::{EventBusError, Result};
use crate::events::EventEnvelope;
use crate::kafka::base_client_config;
use crate::kafka::message::{OutboundRecord, PublishReceipt};
use crate::metrics::KafkaMetrics;

/// Extra time allowed on top of `message.timeout.ms` before the client gives up
/// waiting for librdkafka to report the delivery
const DELIVERY_GRACE: Duration = Duration::from_secs(1);

/// Publishing seam used by the pipeline and the HTTP surface
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Produce one record and wait for the broker acknowledgement
    async fn publish_record(&self, record: OutboundRecord) -> Result<PublishReceipt>;

    /// Validate and produce an envelope, keyed and headed per its fields
    async fn publish(&self, envelope: &EventEnvelope) -> Result<PublishReceipt> {
        envelope.validate()?;
        self.publish_record(envelope.to_record()?).await
    }
}

/// Outcome of an asynchronous publish, delivered on the report channel
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub event_id: String,
    pub topic: String,
    pub outcome: std::result::Result<PublishReceipt, String>,
}

/// Kafka producer with `acks=all`, idempotence and bounded retries
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
    retry: RetryConfig,
    publish_timeout: Duration,
    metrics: KafkaMetrics,
    delivery_tx: mpsc::UnboundedSender<DeliveryReport>,
}

impl KafkaProducer {
    /// Create the producer together with the receiver for async delivery reports
    pub fn new(
        config: &KafkaConfig,
        metrics: KafkaMetrics,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DeliveryReport>)> {
        let producer: FutureProducer = base_client_config(config)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .set("compression.type", &config.compression)
            .set("linger.ms", config.linger_ms.to_string())
            .set("message.timeout.ms", config.publish_timeout_ms.to_string())
            .create()
            .map_err(|e| {
                error!("Failed to create Kafka producer: {}", e);
                EventBusError::Kafka(e.to_string())
            })?;

        let retry = presets::kafka_producer_config()
            .retry
            .unwrap_or_default()
            .with_max_attempts(config.publish_max_attempts);
        let retry = RetryConfig {
            max_elapsed: Some(Duration::from_millis(config.publish_max_elapsed_ms)),
            ..retry
        };

        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

        info!(
            brokers = %config.brokers,
            attempts = retry.max_attempts(),
            "Kafka producer initialized"
        );

        Ok((
            Self {
                producer,
                retry,
                publish_timeout: config.publish_timeout(),
                metrics,
                delivery_tx,
            },
            delivery_rx,
        ))
    }

    /// Queue an envelope and return immediately
    ///
    /// The broker acknowledgement (or failure) arrives later as a
    /// [`DeliveryReport`] on the channel returned by [`KafkaProducer::new`].
    pub fn publish_async(&self, envelope: &EventEnvelope) -> Result<()> {
        envelope.validate()?;
        let record = envelope.to_record()?;
        let headers = build_headers(&record);

        let mut future_record = FutureRecord::<str, [u8]>::to(&record.topic)
            .payload(record.payload.as_slice())
            .headers(headers);
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }

        let delivery = self
            .producer
            .send_result(future_record)
            .map_err(|(e, _)| {
                self.metrics.producer_errors_total.inc();
                classify_error(e)
            })?;

        let tx = self.delivery_tx.clone();
        let metrics = self.metrics.clone();
        let event_id = envelope.id.clone();
        let topic = record.topic.clone();

        tokio::spawn(async move {
            let outcome = match delivery.await {
                Ok(Ok((partition, offset))) => {
                    metrics.messages_produced_total.inc();
                    Ok(PublishReceipt {
                        topic: topic.clone(),
                        partition,
                        offset,
                    })
                }
                Ok(Err((e, _))) => {
                    metrics.producer_errors_total.inc();
                    Err(e.to_string())
                }
                Err(_) => {
                    metrics.producer_errors_total.inc();
                    Err("delivery canceled before acknowledgement".to_string())
                }
            };

            // Receiver gone means the service is shutting down
            let _ = tx.send(DeliveryReport {
                event_id,
                topic,
                outcome,
            });
        });

        Ok(())
    }

    /// Records handed to librdkafka but not yet acknowledged
    pub fn in_flight_count(&self) -> i32 {
        self.producer.in_flight_count()
    }

    /// Flush queued records, waiting at most `timeout`
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        let producer = self.producer.clone();
        let pending = producer.in_flight_count();
        info!(pending, "Flushing Kafka producer");

        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| EventBusError::Internal(format!("flush task failed: {}", e)))?
            .map_err(|e| {
                warn!("Producer flush incomplete: {}", e);
                EventBusError::Timeout(format!("producer flush: {}", e))
            })
    }

    async fn send_once(&self, record: &OutboundRecord) -> Result<PublishReceipt> {
        let mut future_record = FutureRecord::<str, [u8]>::to(&record.topic)
            .payload(record.payload.as_slice())
            .headers(build_headers(record));
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }

        let delivery = self.producer.send(future_record, self.publish_timeout);
        match with_timeout(self.publish_timeout + DELIVERY_GRACE, delivery).await {
            Ok(Ok((partition, offset))) => Ok(PublishReceipt {
                topic: record.topic.clone(),
                partition,
                offset,
            }),
            Ok(Err((e, _))) => {
                self.metrics.producer_errors_total.inc();
                Err(classify_error(e))
            }
            Err(elapsed) => {
                self.metrics.producer_errors_total.inc();
                Err(EventBusError::Timeout(format!(
                    "publish to {}: {}",
                    record.topic, elapsed
                )))
            }
        }
    }
}

#[async_trait]
impl EventPublisher for KafkaProducer {
    async fn publish_record(&self, record: OutboundRecord) -> Result<PublishReceipt> {
        let started = Instant::now();
        let result = with_retry_if(
            self.retry.clone(),
            || self.send_once(&record),
            EventBusError::is_transient,
        )
        .await;
        self.metrics
            .publish_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(receipt) => {
                self.metrics.messages_produced_total.inc();
                debug!(
                    topic = %receipt.topic,
                    partition = receipt.partition,
                    offset = receipt.offset,
                    "Record acknowledged"
                );
                Ok(receipt)
            }
            Err(e) => {
                let attempts = e.attempts();
                let error = e.into_inner();
                error!(topic = %record.topic, attempts, "Publish failed: {}", error);
                if error.is_transient() {
                    Err(EventBusError::BrokerUnavailable(format!(
                        "publish to {} failed after {} attempts: {}",
                        record.topic, attempts, error
                    )))
                } else {
                    Err(error)
                }
            }
        }
    }
}

fn build_headers(record: &OutboundRecord) -> OwnedHeaders {
    record
        .headers
        .iter()
        .fold(OwnedHeaders::new(), |headers, (key, value)| {
            headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            })
        })
}

/// Errors retrying cannot fix map to `Kafka`; the rest are broker unavailability
pub(crate) fn classify_error(err: KafkaError) -> EventBusError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessageSize
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::InvalidRecord
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed
            | RDKafkaErrorCode::UnknownTopicOrPartition,
        ) => EventBusError::Kafka(err.to_string()),
        _ => EventBusError::BrokerUnavailable(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oversized_record_is_permanent() {
        let err = classify_error(KafkaError::MessageProduction(
            RDKafkaErrorCode::MessageSizeTooLarge,
        ));
        assert!(matches!(err, EventBusError::Kafka(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_broker_transport_failure_is_transient() {
        let err = classify_error(KafkaError::MessageProduction(
            RDKafkaErrorCode::BrokerTransportFailure,
        ));
        assert!(matches!(err, EventBusError::BrokerUnavailable(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_headers_copied_from_record() {
        let record = OutboundRecord::new("app.form.created", b"{}".to_vec())
            .with_header("event-id", "e-1")
            .with_header("source", "form-service");

        let headers = build_headers(&record);
        assert_eq!(rdkafka::message::Headers::count(&headers), 2);
    }
}
