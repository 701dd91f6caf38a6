//! Event pipeline: decode, route, deduplicate, process, publish, dead-letter
//!
//! A consumed message is handled by every processor of its route in order.
//! For each processor the pipeline:
//!
//! 1. claims `(processor, entity key, event id)` in the idempotency guard
//! 2. invokes the processor under a deadline, retrying transient failures
//! 3. publishes the derived events, or the DLQ record once retries are spent
//! 4. marks the event processed
//!
//! Only when all processors are done does the handler return `Ok`, which is
//! what lets the partition worker commit the offset.

pub mod dlq;
pub mod processor;
pub mod processors;
pub mod router;

use async_trait::async_trait;
use chrono::Utc;
use idempotent_consumer::{ClaimOutcome, ClaimToken, GuardConfig, IdempotencyError, IdempotencyGuard};
use resilience::{presets, with_retry_if, with_timeout, RetryConfig};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::error::{EventBusError, Result};
use crate::events::cdc::{normalize_record_key, CdcChange, CdcMessage};
use crate::events::EventEnvelope;
use crate::kafka::{EventPublisher, InboundMessage, MessageHandler};
use crate::metrics::PipelineMetrics;

pub use dlq::{dlq_topic, DlqRecord, DLQ_SUFFIX};
pub use processor::{Processor, ProcessorError, ProcessorResult};
pub use router::{default_routes, Route, RouteMatcher, Router, RouterBuilder};

const CDC_TOPIC_PREFIX: &str = "cdc.";

/// Retry and deadline policy for processor invocations
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Total invocations is `retry.max_attempts()`
    pub retry: RetryConfig,
    pub processor_timeout: Duration,
    /// Waiting for a claim held by another worker
    pub claim_retry: RetryConfig,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let preset = presets::processor_config();
        Self {
            retry: preset.retry.unwrap_or_default(),
            processor_timeout: preset.timeout.duration,
            claim_retry: claim_retry(preset.timeout.duration),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut retry = presets::processor_config()
            .retry
            .unwrap_or_default()
            .with_max_attempts(config.max_attempts.max(1));
        retry.initial_backoff = Duration::from_millis(config.retry_backoff_initial_ms);
        retry.max_backoff = Duration::from_millis(config.retry_backoff_max_ms);

        Self {
            retry,
            processor_timeout: config.processor_timeout(),
            claim_retry: claim_retry(config.processor_timeout()),
        }
    }
}

fn claim_retry(budget: Duration) -> RetryConfig {
    RetryConfig {
        max_retries: 20,
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(500),
        backoff_multiplier: 2.0,
        jitter: true,
        max_elapsed: Some(budget),
    }
}

/// The [`MessageHandler`] that drives processors for consumed messages
pub struct Pipeline {
    router: Router,
    publisher: Arc<dyn EventPublisher>,
    guard: IdempotencyGuard,
    settings: PipelineSettings,
    metrics: PipelineMetrics,
}

impl Pipeline {
    pub fn new(
        router: Router,
        publisher: Arc<dyn EventPublisher>,
        guard: IdempotencyGuard,
        settings: PipelineSettings,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            router,
            publisher,
            guard,
            settings,
            metrics,
        }
    }

    /// Pipeline with the built-in processors and default routes
    pub fn from_config(
        config: &PipelineConfig,
        publisher: Arc<dyn EventPublisher>,
        metrics: PipelineMetrics,
    ) -> Result<Self> {
        let builder = processors::default_processors(config)
            .into_iter()
            .fold(Router::builder(), |b, p| b.processor(p));
        let router = default_routes(builder).build()?;

        let guard = IdempotencyGuard::new(GuardConfig {
            max_keys: config.idempotency_max_keys,
            ids_per_key: config.idempotency_ids_per_key,
            retention: Duration::from_secs(config.idempotency_retention_secs),
        });

        Ok(Self::new(
            router,
            publisher,
            guard,
            PipelineSettings::from_config(config),
            metrics,
        ))
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn guard(&self) -> &IdempotencyGuard {
        &self.guard
    }

    /// Drop expired idempotency entries and refresh the key gauge
    pub fn cleanup_idempotency(&self) -> u64 {
        let removed = self.guard.cleanup_old_events();
        self.metrics.idempotency_keys.set(self.guard.len() as f64);
        removed
    }

    /// Decode a consumed payload into an envelope
    ///
    /// `cdc.*` topics carry connector change records; everything else carries
    /// JSON envelopes.
    pub fn decode(message: &InboundMessage, payload: &[u8]) -> Result<EventEnvelope> {
        if message.topic.starts_with(CDC_TOPIC_PREFIX) {
            CdcMessage::decode(payload)?.to_envelope(
                &message.topic,
                message.partition,
                message.offset,
                message.key.as_deref(),
            )
        } else {
            EventEnvelope::from_bytes(payload)
        }
    }

    /// Record key, envelope key, row id, then envelope id
    pub fn entity_key(message: &InboundMessage, envelope: &EventEnvelope) -> String {
        message
            .key
            .as_deref()
            .map(normalize_record_key)
            .filter(|k| !k.is_empty())
            .or_else(|| envelope.key.clone().filter(|k| !k.is_empty()))
            .or_else(|| {
                CdcChange::from_envelope(envelope)
                    .ok()
                    .and_then(|change| change.row_field("id"))
            })
            .or_else(|| envelope.data_str("id").map(str::to_string))
            .unwrap_or_else(|| envelope.id.clone())
    }

    async fn claim(
        &self,
        scope: &str,
        entity_key: &str,
        event_id: &str,
    ) -> std::result::Result<Option<ClaimToken>, IdempotencyError> {
        let attempt = || {
            let outcome = match self.guard.try_claim(scope, entity_key, event_id) {
                Ok(ClaimOutcome::Claimed(token)) => Ok(Some(token)),
                Ok(ClaimOutcome::AlreadyProcessed) => Ok(None),
                Ok(ClaimOutcome::InFlight) => Err(IdempotencyError::InFlight {
                    entity: format!("{}/{}", scope, entity_key),
                    event_id: event_id.to_string(),
                }),
                Err(e) => Err(e),
            };
            std::future::ready(outcome)
        };

        with_retry_if(self.settings.claim_retry.clone(), attempt, IdempotencyError::is_transient)
            .await
            .map_err(|e| e.into_inner())
    }

    async fn run_processor(
        &self,
        processor: &Arc<dyn Processor>,
        envelope: &EventEnvelope,
        entity_key: &str,
        message: &InboundMessage,
    ) -> Result<()> {
        let name = processor.name();

        let token = match self.claim(name, entity_key, &envelope.id).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!(processor = %name, event_id = %envelope.id, "Duplicate delivery skipped");
                self.metrics
                    .processed_total
                    .with_label_values(&[name, "duplicate"])
                    .inc();
                return Ok(());
            }
            Err(IdempotencyError::InvalidEventId(reason)) => {
                return self
                    .dead_letter(
                        message,
                        serde_json::to_value(envelope)?,
                        Some(name),
                        &format!("invalid event id: {}", reason),
                        "invalid_event_id",
                        0,
                    )
                    .await;
            }
            Err(e) => {
                // Not committed; the message is redelivered after resubscribe
                warn!(processor = %name, event_id = %envelope.id, error = %e, "Could not claim event");
                return Err(EventBusError::Timeout(e.to_string()));
            }
        };

        let started = Instant::now();
        let timeout = self.settings.processor_timeout;
        let mut invocations: u32 = 0;
        let result = with_retry_if(
            self.settings.retry.clone(),
            || {
                invocations += 1;
                async move {
                    match with_timeout(timeout, processor.process(envelope)).await {
                        Ok(result) => result,
                        Err(e) => Err(ProcessorError::Transient(format!(
                            "{} exceeded its deadline: {}",
                            processor.name(),
                            e
                        ))),
                    }
                }
            },
            ProcessorError::is_transient,
        )
        .await;

        self.metrics
            .processing_duration_seconds
            .with_label_values(&[name])
            .observe(started.elapsed().as_secs_f64());
        if invocations > 1 {
            self.metrics
                .retries_total
                .with_label_values(&[name])
                .inc_by(u64::from(invocations - 1));
        }

        match result {
            Ok(derived) => {
                // Derived events must be durable before the source offset is committed
                for event in &derived {
                    self.publisher.publish(event).await?;
                    self.metrics.derived_events_total.inc();
                }
                token.complete();
                self.metrics
                    .processed_total
                    .with_label_values(&[name, "success"])
                    .inc();
                debug!(processor = %name, event_id = %envelope.id, derived = derived.len(), "Processed");
                Ok(())
            }
            Err(retry_error) => {
                let attempts = retry_error.attempts();
                let failure = retry_error.into_inner();
                error!(
                    processor = %name,
                    event_id = %envelope.id,
                    attempts,
                    error = %failure,
                    "Processor failed, dead-lettering"
                );
                self.dead_letter(
                    message,
                    serde_json::to_value(envelope)?,
                    Some(name),
                    &failure.to_string(),
                    failure.kind(),
                    attempts,
                )
                .await?;
                token.complete();
                self.metrics
                    .processed_total
                    .with_label_values(&[name, "dead_lettered"])
                    .inc();
                Ok(())
            }
        }
    }

    async fn dead_letter(
        &self,
        message: &InboundMessage,
        envelope: Value,
        processor: Option<&str>,
        error: &str,
        error_kind: &str,
        attempt_count: u32,
    ) -> Result<()> {
        let record = DlqRecord {
            original_topic: message.topic.clone(),
            error: error.to_string(),
            attempt_count,
            envelope,
            processor: processor.map(str::to_string),
            error_kind: error_kind.to_string(),
            partition: message.partition,
            offset: message.offset,
            failed_at: Utc::now(),
        };

        let receipt = self
            .publisher
            .publish_record(record.to_record(message.key.as_deref())?)
            .await?;
        self.metrics
            .dead_lettered_total
            .with_label_values(&[error_kind])
            .inc();
        info!(
            dlq_topic = %receipt.topic,
            original_topic = %message.topic,
            offset = message.offset,
            attempt_count,
            "Message dead-lettered"
        );
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for Pipeline {
    #[instrument(skip(self, message), fields(topic = %message.topic, partition = message.partition, offset = message.offset))]
    async fn handle(&self, message: &InboundMessage) -> Result<()> {
        let Some(payload) = message.payload.as_deref() else {
            debug!("Tombstone skipped");
            self.metrics.tombstones_total.inc();
            return Ok(());
        };

        let envelope = match Self::decode(message, payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Undecodable message");
                return self
                    .dead_letter(
                        message,
                        dlq::raw_payload_value(payload),
                        None,
                        &e.to_string(),
                        e.kind(),
                        0,
                    )
                    .await;
            }
        };

        let route = match self.router.resolve(&envelope, &message.topic) {
            Some(route) => route,
            None => {
                self.metrics.unrouted_total.inc();
                self.router.fallback()
            }
        };

        let entity_key = Self::entity_key(message, &envelope);
        for processor in &route.processors {
            self.run_processor(processor, &envelope, &entity_key, message)
                .await?;
        }
        Ok(())
    }
}
