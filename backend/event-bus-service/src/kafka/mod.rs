//! Broker client: produce, consume and admin operations against Kafka

pub mod admin;
pub mod consumer;
pub mod message;
pub mod producer;
pub mod rebalance;

pub use admin::{KafkaAdmin, TopicSpec};
pub use consumer::{MessageHandler, OffsetCommitter, PartitionedConsumer, WorkerPool};
pub use message::{InboundMessage, OutboundRecord, PublishReceipt, TopicPartition};
pub use producer::{DeliveryReport, EventPublisher, KafkaProducer};
pub use rebalance::{AssignmentBarrier, PartitionLease, RebalanceContext};

use rdkafka::config::ClientConfig;

use crate::config::KafkaConfig;

/// Connection settings shared by the producer, consumer and admin clients
pub(crate) fn base_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.brokers)
        .set("client.id", &config.client_id)
        .set("security.protocol", &config.security_protocol);

    if let Some(mechanism) = &config.sasl_mechanism {
        client.set("sasl.mechanism", mechanism);
    }
    if let (Some(username), Some(password)) = (&config.sasl_username, &config.sasl_password) {
        client
            .set("sasl.username", username)
            .set("sasl.password", password);
    }

    client
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kafka_config() -> KafkaConfig {
        KafkaConfig {
            brokers: "broker-1:9092,broker-2:9092".into(),
            client_id: "event-bus-test".into(),
            group_id: "test-group".into(),
            security_protocol: "SASL_SSL".into(),
            sasl_mechanism: Some("PLAIN".into()),
            sasl_username: Some("svc".into()),
            sasl_password: Some("secret".into()),
            publish_timeout_ms: 1_000,
            publish_max_attempts: 5,
            publish_max_elapsed_ms: 30_000,
            compression: "lz4".into(),
            linger_ms: 10,
            session_timeout_ms: 30_000,
            heartbeat_interval_ms: 3_000,
            max_poll_interval_ms: 300_000,
            admin_timeout_ms: 1_000,
        }
    }

    #[test]
    fn test_base_client_config_applies_sasl() {
        let client = base_client_config(&kafka_config());
        assert_eq!(client.get("bootstrap.servers"), Some("broker-1:9092,broker-2:9092"));
        assert_eq!(client.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(client.get("sasl.mechanism"), Some("PLAIN"));
        assert_eq!(client.get("sasl.username"), Some("svc"));
    }

    #[test]
    fn test_base_client_config_without_credentials() {
        let mut config = kafka_config();
        config.security_protocol = "PLAINTEXT".into();
        config.sasl_mechanism = None;
        config.sasl_password = None;

        let client = base_client_config(&config);
        assert_eq!(client.get("sasl.mechanism"), None);
        assert_eq!(client.get("sasl.username"), None);
    }
}
