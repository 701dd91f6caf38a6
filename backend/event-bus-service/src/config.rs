/// Configuration management for the event bus service
///
/// Loads configuration from environment variables (a `.env` file is read
/// first when present).
use crate::error::{EventBusError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub kafka: KafkaConfig,
    pub topics: TopicConfig,
    pub connect: ConnectConfig,
    pub connector: ConnectorDefinition,
    pub pipeline: PipelineConfig,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound for graceful shutdown of HTTP workers
    pub shutdown_timeout_secs: u64,
}

/// Broker connection and client tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated bootstrap servers
    pub brokers: String,
    pub client_id: String,
    pub group_id: String,
    /// PLAINTEXT, SSL, SASL_PLAINTEXT or SASL_SSL
    pub security_protocol: String,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    /// Deadline for one publish (also `message.timeout.ms`)
    pub publish_timeout_ms: u64,
    /// Total attempts for a synchronous publish
    pub publish_max_attempts: u32,
    /// Overall ceiling for a synchronous publish including retries
    pub publish_max_elapsed_ms: u64,
    pub compression: String,
    pub linger_ms: u64,
    pub session_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    /// Deadline for admin and metadata requests
    pub admin_timeout_ms: u64,
}

/// Defaults applied to topics this service creates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub default_partitions: i32,
    pub replication_factor: i32,
    pub retention_ms: i64,
    pub cleanup_policy: String,
}

/// Kafka Connect REST endpoint and supervision policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: u64,
    pub poll_interval_secs: u64,
    pub max_restarts: u32,
    pub restart_window_secs: u64,
    pub restart_backoff_initial_ms: u64,
    pub restart_backoff_max_ms: u64,
}

/// Declarative Debezium connector for the source database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorDefinition {
    pub name: String,
    pub database_host: String,
    pub database_port: u16,
    pub database_name: String,
    pub database_user: String,
    pub database_password: String,
    pub server_name: String,
    /// Debezium `topic.prefix`; raw topics are `<prefix>.<schema>.<table>`
    pub topic_prefix: String,
    pub schema: String,
    pub tables: Vec<String>,
    pub slot_name: String,
}

/// Processing pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Topics the pipeline subscribes to
    pub topics: Vec<String>,
    /// Total processor invocations before dead-lettering
    pub max_attempts: u32,
    pub retry_backoff_initial_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub processor_timeout_ms: u64,
    /// Bound for finishing in-flight work on revoke and shutdown
    pub drain_timeout_ms: u64,
    pub worker_queue_capacity: usize,
    pub idempotency_max_keys: usize,
    pub idempotency_ids_per_key: usize,
    pub idempotency_retention_secs: u64,
    pub idempotency_cleanup_interval_secs: u64,
    pub unrouted_topic: String,
    /// Tables the CDC-table processor republishes
    pub cdc_tables: Vec<String>,
    pub analytics_form_window_secs: u64,
    pub analytics_response_window_secs: u64,
    pub analytics_default_window_secs: u64,
    pub broker_health_interval_secs: u64,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| EventBusError::Config(format!("{} has invalid value '{}': {}", key, raw, e))),
        Err(_) => Ok(default),
    }
}

fn env_list(key: &str, default: &str) -> Vec<String> {
    env_string(key, default)
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let server = ServerConfig {
            host: env_string("APP_HOST", "0.0.0.0"),
            port: env_parse("PORT", 8080)?,
            shutdown_timeout_secs: env_parse("SHUTDOWN_TIMEOUT_SECS", 30)?,
        };

        let kafka = KafkaConfig {
            brokers: env_string("KAFKA_BROKERS", "localhost:9092"),
            client_id: env_string("KAFKA_CLIENT_ID", "event-bus-service"),
            group_id: env_string("KAFKA_GROUP_ID", "event-bus-pipeline-v1"),
            security_protocol: env_string("KAFKA_SECURITY_PROTOCOL", "PLAINTEXT"),
            sasl_mechanism: env_optional("KAFKA_SASL_MECHANISM"),
            sasl_username: env_optional("KAFKA_SASL_USERNAME"),
            sasl_password: env_optional("KAFKA_SASL_PASSWORD"),
            publish_timeout_ms: env_parse("KAFKA_PUBLISH_TIMEOUT_MS", 10_000)?,
            publish_max_attempts: env_parse("KAFKA_PUBLISH_MAX_ATTEMPTS", 5)?,
            publish_max_elapsed_ms: env_parse("KAFKA_PUBLISH_MAX_ELAPSED_MS", 30_000)?,
            compression: env_string("KAFKA_COMPRESSION", "lz4"),
            linger_ms: env_parse("KAFKA_LINGER_MS", 10)?,
            session_timeout_ms: env_parse("KAFKA_SESSION_TIMEOUT_MS", 30_000)?,
            heartbeat_interval_ms: env_parse("KAFKA_HEARTBEAT_INTERVAL_MS", 3_000)?,
            max_poll_interval_ms: env_parse("KAFKA_MAX_POLL_INTERVAL_MS", 300_000)?,
            admin_timeout_ms: env_parse("KAFKA_ADMIN_TIMEOUT_MS", 10_000)?,
        };

        let topics = TopicConfig {
            default_partitions: env_parse("TOPIC_DEFAULT_PARTITIONS", 3)?,
            replication_factor: env_parse("TOPIC_REPLICATION_FACTOR", 1)?,
            retention_ms: env_parse("TOPIC_RETENTION_MS", 7 * 24 * 3600 * 1000)?,
            cleanup_policy: env_string("TOPIC_CLEANUP_POLICY", "delete"),
        };

        let connect = ConnectConfig {
            url: env_string("KAFKA_CONNECT_URL", "http://localhost:8083"),
            username: env_optional("KAFKA_CONNECT_USERNAME"),
            password: env_optional("KAFKA_CONNECT_PASSWORD"),
            timeout_ms: env_parse("KAFKA_CONNECT_TIMEOUT_MS", 10_000)?,
            poll_interval_secs: env_parse("CONNECTOR_POLL_INTERVAL_SECS", 30)?,
            max_restarts: env_parse("CONNECTOR_MAX_RESTARTS", 3)?,
            restart_window_secs: env_parse("CONNECTOR_RESTART_WINDOW_SECS", 600)?,
            restart_backoff_initial_ms: env_parse("CONNECTOR_RESTART_BACKOFF_INITIAL_MS", 5_000)?,
            restart_backoff_max_ms: env_parse("CONNECTOR_RESTART_BACKOFF_MAX_MS", 300_000)?,
        };

        let topic_prefix = env_string("CDC_TOPIC_PREFIX", "pg");
        let connector = ConnectorDefinition {
            name: env_string("CDC_CONNECTOR_NAME", "postgres-cdc-connector"),
            database_host: env_string("CDC_DATABASE_HOST", "localhost"),
            database_port: env_parse("CDC_DATABASE_PORT", 5432)?,
            database_name: env_string("CDC_DATABASE_NAME", "app"),
            database_user: env_string("CDC_DATABASE_USER", "postgres"),
            database_password: env_string("CDC_DATABASE_PASSWORD", "postgres"),
            server_name: env_string("CDC_SERVER_NAME", "app-db"),
            slot_name: env_string("CDC_SLOT_NAME", &format!("{}_slot", topic_prefix)),
            topic_prefix,
            schema: env_string("CDC_SCHEMA", "public"),
            tables: env_list("CDC_TABLES", "forms,responses,users,analytics"),
        };

        let cdc_tables = env_list("PIPELINE_CDC_TABLES", "forms,responses,users,analytics");
        let default_topics = cdc_tables
            .iter()
            .map(|t| format!("cdc.{}", t))
            .chain(
                ["app.form.created", "app.form.updated", "app.response.submitted", "app.user.registered"]
                    .iter()
                    .map(|s| s.to_string()),
            )
            .collect::<Vec<_>>()
            .join(",");

        let pipeline = PipelineConfig {
            topics: env_list("PIPELINE_TOPICS", &default_topics),
            max_attempts: env_parse("PIPELINE_MAX_ATTEMPTS", 3)?,
            retry_backoff_initial_ms: env_parse("PIPELINE_RETRY_BACKOFF_INITIAL_MS", 100)?,
            retry_backoff_max_ms: env_parse("PIPELINE_RETRY_BACKOFF_MAX_MS", 2_000)?,
            processor_timeout_ms: env_parse("PIPELINE_PROCESSOR_TIMEOUT_MS", 30_000)?,
            drain_timeout_ms: env_parse("PIPELINE_DRAIN_TIMEOUT_MS", 15_000)?,
            worker_queue_capacity: env_parse("PIPELINE_WORKER_QUEUE_CAPACITY", 256)?,
            idempotency_max_keys: env_parse("IDEMPOTENCY_MAX_KEYS", 100_000)?,
            idempotency_ids_per_key: env_parse("IDEMPOTENCY_IDS_PER_KEY", 64)?,
            idempotency_retention_secs: env_parse("IDEMPOTENCY_RETENTION_SECS", 24 * 3600)?,
            idempotency_cleanup_interval_secs: env_parse("IDEMPOTENCY_CLEANUP_INTERVAL_SECS", 3600)?,
            unrouted_topic: env_string("PIPELINE_UNROUTED_TOPIC", "events.unrouted"),
            cdc_tables,
            analytics_form_window_secs: env_parse("ANALYTICS_FORM_WINDOW_SECS", 300)?,
            analytics_response_window_secs: env_parse("ANALYTICS_RESPONSE_WINDOW_SECS", 60)?,
            analytics_default_window_secs: env_parse("ANALYTICS_DEFAULT_WINDOW_SECS", 300)?,
            broker_health_interval_secs: env_parse("BROKER_HEALTH_INTERVAL_SECS", 30)?,
        };

        let config = Self {
            server,
            kafka,
            topics,
            connect,
            connector,
            pipeline,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.trim().is_empty() {
            return Err(EventBusError::Config("KAFKA_BROKERS must not be empty".into()));
        }
        if self.kafka.publish_max_attempts == 0 {
            return Err(EventBusError::Config(
                "KAFKA_PUBLISH_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }
        if self.pipeline.max_attempts == 0 {
            return Err(EventBusError::Config(
                "PIPELINE_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }
        if self.pipeline.topics.is_empty() {
            return Err(EventBusError::Config("PIPELINE_TOPICS must not be empty".into()));
        }
        if self.topics.default_partitions < 1 || self.topics.replication_factor < 1 {
            return Err(EventBusError::Config(
                "Topic partitions and replication factor must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl KafkaConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn admin_timeout(&self) -> Duration {
        Duration::from_millis(self.admin_timeout_ms)
    }
}

impl ConnectConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl PipelineConfig {
    pub fn processor_timeout(&self) -> Duration {
        Duration::from_millis(self.processor_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_defaults() {
        std::env::remove_var("PIPELINE_MAX_ATTEMPTS");
        std::env::remove_var("PIPELINE_TOPICS");
        let config = Config::from_env().expect("defaults are valid");

        assert_eq!(config.pipeline.max_attempts, 3);
        assert_eq!(config.kafka.publish_max_attempts, 5);
        assert_eq!(config.connect.max_restarts, 3);
        assert_eq!(config.topics.retention_ms, 604_800_000);
        assert!(config.pipeline.topics.contains(&"cdc.forms".to_string()));
    }

    #[test]
    #[serial]
    fn test_invalid_number_is_config_error() {
        std::env::set_var("PIPELINE_MAX_ATTEMPTS", "three");
        let result = Config::from_env();
        std::env::remove_var("PIPELINE_MAX_ATTEMPTS");

        assert!(matches!(result, Err(EventBusError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_topic_list_is_trimmed() {
        std::env::set_var("PIPELINE_TOPICS", " cdc.forms , app.form.created ,");
        let config = Config::from_env().expect("valid config");
        std::env::remove_var("PIPELINE_TOPICS");

        assert_eq!(config.pipeline.topics, vec!["cdc.forms", "app.form.created"]);
    }
}
