//! CDC connector supervision over the Kafka Connect REST API

pub mod client;
pub mod manager;
pub mod spec;
pub mod supervisor;

pub use client::{
    ConnectApi, ConnectorConfig, ConnectorRuntime, ConnectorState, ConnectorStatus,
    KafkaConnectClient, TaskStatus,
};
pub use manager::{health_score, ConnectorManager, ConnectorReport, EnsureOutcome};
pub use spec::{diverging_keys, routed_topic, ConnectorSpec};
pub use supervisor::{
    ConnectorHealth, ConnectorRecovery, RecoveryAction, RecoveryPhase, RestartPolicy,
};
