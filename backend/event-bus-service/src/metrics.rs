//! Prometheus collectors, grouped per component and registered into a
//! registry owned by the service

use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::error::{EventBusError, Result};

fn register<C>(registry: &Registry, collector: C) -> Result<C>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

/// Broker client metrics
#[derive(Clone)]
pub struct KafkaMetrics {
    pub messages_produced_total: IntCounter,
    pub producer_errors_total: IntCounter,
    pub publish_duration_seconds: Histogram,
    pub messages_consumed_total: IntCounter,
    pub consumer_errors_total: IntCounter,
    pub offsets_committed_total: IntCounter,
    /// Rebalance callbacks by kind (assign / revoke)
    pub rebalances_total: IntCounterVec,
    pub active_partition_workers: IntGauge,
    /// Broker reachability (1 = healthy, 0 = unhealthy)
    pub broker_healthy: IntGauge,
}

impl KafkaMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        Ok(Self {
            messages_produced_total: register(
                registry,
                IntCounter::new(
                    "event_bus_messages_produced_total",
                    "Total number of records acknowledged by the broker",
                )?,
            )?,
            producer_errors_total: register(
                registry,
                IntCounter::new(
                    "event_bus_producer_errors_total",
                    "Total number of failed produce attempts",
                )?,
            )?,
            publish_duration_seconds: register(
                registry,
                Histogram::with_opts(HistogramOpts::new(
                    "event_bus_publish_duration_seconds",
                    "Time from publish call to broker acknowledgement",
                ))?,
            )?,
            messages_consumed_total: register(
                registry,
                IntCounter::new(
                    "event_bus_messages_consumed_total",
                    "Total number of records received from the broker",
                )?,
            )?,
            consumer_errors_total: register(
                registry,
                IntCounter::new(
                    "event_bus_consumer_errors_total",
                    "Total number of Kafka consumer errors encountered",
                )?,
            )?,
            offsets_committed_total: register(
                registry,
                IntCounter::new(
                    "event_bus_offsets_committed_total",
                    "Total number of offsets committed after successful handling",
                )?,
            )?,
            rebalances_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new("event_bus_rebalances_total", "Consumer group rebalance callbacks"),
                    &["kind"],
                )?,
            )?,
            active_partition_workers: register(
                registry,
                IntGauge::new(
                    "event_bus_active_partition_workers",
                    "Number of partition workers currently running",
                )?,
            )?,
            broker_healthy: register(
                registry,
                IntGauge::new(
                    "event_bus_broker_healthy",
                    "Broker health status (1 = healthy, 0 = unhealthy)",
                )?,
            )?,
        })
    }
}

/// CDC connector supervision metrics
#[derive(Clone)]
pub struct ConnectorMetrics {
    pub restarts_total: IntCounterVec,
    pub poll_failures_total: IntCounter,
    pub health_score: GaugeVec,
    pub healthy: IntGaugeVec,
}

impl ConnectorMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        Ok(Self {
            restarts_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "cdc_connector_restarts_total",
                        "Automatic and manual connector restarts",
                    ),
                    &["connector", "trigger"],
                )?,
            )?,
            poll_failures_total: register(
                registry,
                IntCounter::new(
                    "cdc_connector_poll_failures_total",
                    "Connector status polls that failed to reach Kafka Connect",
                )?,
            )?,
            health_score: register(
                registry,
                GaugeVec::new(
                    Opts::new("cdc_connector_health_score", "Connector health score (0.0 - 1.0)"),
                    &["connector"],
                )?,
            )?,
            healthy: register(
                registry,
                IntGaugeVec::new(
                    Opts::new(
                        "cdc_connector_healthy",
                        "Connector health status (1 = healthy, 0 = unhealthy)",
                    ),
                    &["connector"],
                )?,
            )?,
        })
    }
}

/// Processing pipeline metrics
#[derive(Clone)]
pub struct PipelineMetrics {
    /// Processor invocations by outcome (success / dead_lettered / duplicate)
    pub processed_total: IntCounterVec,
    pub processing_duration_seconds: HistogramVec,
    pub retries_total: IntCounterVec,
    /// Dead-lettered messages by error kind
    pub dead_lettered_total: IntCounterVec,
    pub derived_events_total: IntCounter,
    pub unrouted_total: IntCounter,
    pub tombstones_total: IntCounter,
    pub idempotency_keys: Gauge,
}

impl PipelineMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        Ok(Self {
            processed_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new("pipeline_processed_total", "Processor outcomes per message"),
                    &["processor", "outcome"],
                )?,
            )?,
            processing_duration_seconds: register(
                registry,
                HistogramVec::new(
                    HistogramOpts::new(
                        "pipeline_processing_duration_seconds",
                        "Processor wall time including retries",
                    ),
                    &["processor"],
                )?,
            )?,
            retries_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new("pipeline_retries_total", "Processor retries after transient errors"),
                    &["processor"],
                )?,
            )?,
            dead_lettered_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new("pipeline_dead_lettered_total", "Messages sent to a dead-letter topic"),
                    &["error_kind"],
                )?,
            )?,
            derived_events_total: register(
                registry,
                IntCounter::new(
                    "pipeline_derived_events_total",
                    "Derived events published by processors",
                )?,
            )?,
            unrouted_total: register(
                registry,
                IntCounter::new(
                    "pipeline_unrouted_total",
                    "Events with no matching route sent to the unknown-event sink",
                )?,
            )?,
            tombstones_total: register(
                registry,
                IntCounter::new("pipeline_tombstones_total", "Tombstone records skipped")?,
            )?,
            idempotency_keys: register(
                registry,
                Gauge::new(
                    "pipeline_idempotency_keys",
                    "Entity keys tracked by the idempotency store",
                )?,
            )?,
        })
    }
}

/// All service metrics plus the registry that exposes them
#[derive(Clone)]
pub struct ServiceMetrics {
    pub registry: Registry,
    pub kafka: KafkaMetrics,
    pub connectors: ConnectorMetrics,
    pub pipeline: PipelineMetrics,
}

impl ServiceMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            kafka: KafkaMetrics::new(&registry)?,
            connectors: ConnectorMetrics::new(&registry)?,
            pipeline: PipelineMetrics::new(&registry)?,
            registry,
        })
    }

    /// Prometheus text exposition of this registry plus the process-wide
    /// default registry (resilience collectors live there)
    pub fn render(&self) -> Result<String> {
        let mut families = self.registry.gather();
        families.extend(prometheus::gather());

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| EventBusError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_service_metrics() {
        let metrics = ServiceMetrics::new().unwrap();
        metrics.kafka.messages_produced_total.inc();
        metrics
            .pipeline
            .processed_total
            .with_label_values(&["form", "success"])
            .inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("event_bus_messages_produced_total 1"));
        assert!(text.contains("pipeline_processed_total"));
    }

    #[test]
    fn test_registries_are_independent() {
        assert!(ServiceMetrics::new().is_ok());
        assert!(ServiceMetrics::new().is_ok());
    }
}
