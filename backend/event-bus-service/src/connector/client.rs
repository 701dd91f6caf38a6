/// Kafka Connect REST API client
///
/// Covers the subset of the Connect REST interface the connector manager
/// needs: create, read config, update config, status, restart, pause,
/// resume, delete, list and a connectivity ping.
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use resilience::{presets, with_retry_if, CircuitBreaker, CircuitBreakerError, RetryConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error, info};

use crate::config::ConnectConfig;
use crate::error::{EventBusError, Result};

/// Flat string map as accepted by `PUT /connectors/{name}/config`
pub type ConnectorConfig = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectorState {
    Running,
    Paused,
    Failed,
    Restarting,
    Unassigned,
    #[serde(other)]
    Unknown,
}

impl ConnectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorState::Running => "RUNNING",
            ConnectorState::Paused => "PAUSED",
            ConnectorState::Failed => "FAILED",
            ConnectorState::Restarting => "RESTARTING",
            ConnectorState::Unassigned => "UNASSIGNED",
            ConnectorState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: i32,
    pub state: ConnectorState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorRuntime {
    pub state: ConnectorState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// Body of `GET /connectors/{name}/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorStatus {
    pub name: String,
    pub connector: ConnectorRuntime,
    #[serde(default)]
    pub tasks: Vec<TaskStatus>,
}

impl ConnectorStatus {
    /// State used for supervision
    ///
    /// A failed task fails the whole connector, and a running connector with
    /// no tasks yet is not doing any work.
    pub fn effective_state(&self) -> ConnectorState {
        if self.connector.state != ConnectorState::Running {
            return self.connector.state;
        }
        if self.tasks.iter().any(|t| t.state == ConnectorState::Failed) {
            ConnectorState::Failed
        } else if self.tasks.is_empty() {
            ConnectorState::Unassigned
        } else {
            ConnectorState::Running
        }
    }

    pub fn failed_tasks(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.state == ConnectorState::Failed)
            .count()
    }
}

/// Operations against a Kafka Connect cluster
#[async_trait]
pub trait ConnectApi: Send + Sync {
    async fn list_connectors(&self) -> Result<Vec<String>>;
    /// `None` when the connector does not exist
    async fn get_config(&self, name: &str) -> Result<Option<ConnectorConfig>>;
    async fn create_connector(&self, name: &str, config: &ConnectorConfig) -> Result<()>;
    async fn update_config(&self, name: &str, config: &ConnectorConfig) -> Result<()>;
    async fn status(&self, name: &str) -> Result<ConnectorStatus>;
    /// Restart the connector and its failed tasks
    async fn restart(&self, name: &str) -> Result<()>;
    async fn pause(&self, name: &str) -> Result<()>;
    async fn resume(&self, name: &str) -> Result<()>;
    async fn delete(&self, name: &str) -> Result<()>;
    async fn ping(&self) -> Result<()>;
}

struct ConnectResponse {
    status: StatusCode,
    body: String,
}

impl ConnectResponse {
    fn require_status(self, what: &str, accepted: &[StatusCode]) -> Result<Self> {
        if accepted.contains(&self.status) {
            return Ok(self);
        }
        if self.status == StatusCode::NOT_FOUND {
            return Err(EventBusError::NotFound(what.to_string()));
        }
        Err(EventBusError::Connect {
            status: Some(self.status.as_u16()),
            message: format!("{}: {}", what, self.body),
        })
    }

    fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// HTTP implementation of [`ConnectApi`]
pub struct KafkaConnectClient {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    breaker: CircuitBreaker,
    retry: RetryConfig,
}

impl KafkaConnectClient {
    pub fn new(config: &ConnectConfig) -> Result<Self> {
        let preset = presets::connect_api_config();
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| EventBusError::Config(format!("Kafka Connect HTTP client: {}", e)))?;

        info!(url = %config.url, "Kafka Connect client initialized");

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            breaker: CircuitBreaker::new("kafka-connect", preset.circuit_breaker),
            retry: preset.retry.unwrap_or_default(),
        })
    }

    fn connector_path(name: &str, suffix: &str) -> String {
        format!("/connectors/{}{}", urlencoding::encode(name), suffix)
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<ConnectResponse> {
        with_retry_if(
            self.retry.clone(),
            || self.send_once(method.clone(), path, body),
            EventBusError::is_transient,
        )
        .await
        .map_err(|e| e.into_inner())
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ConnectResponse> {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "Kafka Connect request");

        let outcome = self
            .breaker
            .call(|| async {
                let mut request = self.client.request(method.clone(), &url);
                if let Some(username) = &self.username {
                    request = request.basic_auth(username, self.password.as_deref());
                }
                if let Some(body) = body {
                    request = request.json(body);
                }

                let response = request.send().await.map_err(|e| {
                    if e.is_timeout() {
                        EventBusError::Timeout(format!("{} {}: {}", method, path, e))
                    } else {
                        EventBusError::Connect {
                            status: None,
                            message: format!("{} {}: {}", method, path, e),
                        }
                    }
                })?;

                let status = response.status();
                let body = response.text().await.unwrap_or_default();

                // Server errors and rebalance conflicts count against the breaker
                if status.is_server_error() || status == StatusCode::CONFLICT {
                    return Err(EventBusError::Connect {
                        status: Some(status.as_u16()),
                        message: body,
                    });
                }
                Ok(ConnectResponse { status, body })
            })
            .await;

        outcome.map_err(|e| match e {
            CircuitBreakerError::Open(name) => EventBusError::Connect {
                status: None,
                message: format!("circuit breaker '{}' is open", name),
            },
            CircuitBreakerError::CallFailed(e) => {
                error!("Kafka Connect request failed: {}", e);
                e
            }
        })
    }
}

#[async_trait]
impl ConnectApi for KafkaConnectClient {
    async fn list_connectors(&self) -> Result<Vec<String>> {
        self.send(Method::GET, "/connectors", None)
            .await?
            .require_status("list connectors", &[StatusCode::OK])?
            .json()
    }

    async fn get_config(&self, name: &str) -> Result<Option<ConnectorConfig>> {
        let response = self
            .send(Method::GET, &Self::connector_path(name, "/config"), None)
            .await?;
        if response.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        response
            .require_status(&format!("connector {} config", name), &[StatusCode::OK])?
            .json()
            .map(Some)
    }

    async fn create_connector(&self, name: &str, config: &ConnectorConfig) -> Result<()> {
        let body = json!({ "name": name, "config": config });
        self.send(Method::POST, "/connectors", Some(&body))
            .await?
            .require_status(
                &format!("create connector {}", name),
                &[StatusCode::CREATED, StatusCode::OK],
            )?;
        info!(connector = %name, "Connector created");
        Ok(())
    }

    async fn update_config(&self, name: &str, config: &ConnectorConfig) -> Result<()> {
        let body = serde_json::to_value(config)?;
        self.send(Method::PUT, &Self::connector_path(name, "/config"), Some(&body))
            .await?
            .require_status(
                &format!("connector {}", name),
                &[StatusCode::OK, StatusCode::CREATED],
            )?;
        info!(connector = %name, "Connector config updated");
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<ConnectorStatus> {
        self.send(Method::GET, &Self::connector_path(name, "/status"), None)
            .await?
            .require_status(&format!("connector {}", name), &[StatusCode::OK])?
            .json()
    }

    async fn restart(&self, name: &str) -> Result<()> {
        let path = Self::connector_path(name, "/restart?includeTasks=true&onlyFailed=true");
        self.send(Method::POST, &path, None).await?.require_status(
            &format!("connector {}", name),
            &[StatusCode::OK, StatusCode::ACCEPTED, StatusCode::NO_CONTENT],
        )?;
        Ok(())
    }

    async fn pause(&self, name: &str) -> Result<()> {
        self.send(Method::PUT, &Self::connector_path(name, "/pause"), None)
            .await?
            .require_status(
                &format!("connector {}", name),
                &[StatusCode::ACCEPTED, StatusCode::OK, StatusCode::NO_CONTENT],
            )?;
        Ok(())
    }

    async fn resume(&self, name: &str) -> Result<()> {
        self.send(Method::PUT, &Self::connector_path(name, "/resume"), None)
            .await?
            .require_status(
                &format!("connector {}", name),
                &[StatusCode::ACCEPTED, StatusCode::OK, StatusCode::NO_CONTENT],
            )?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.send(Method::DELETE, &Self::connector_path(name, ""), None)
            .await?
            .require_status(
                &format!("connector {}", name),
                &[StatusCode::NO_CONTENT, StatusCode::OK],
            )?;
        info!(connector = %name, "Connector deleted");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.send(Method::GET, "/", None)
            .await?
            .require_status("Kafka Connect root", &[StatusCode::OK])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_deserializes_connect_payload() {
        let body = r#"{
            "name": "postgres-cdc-connector",
            "connector": {"state": "RUNNING", "worker_id": "10.0.0.4:8083"},
            "tasks": [
                {"id": 0, "state": "RUNNING", "worker_id": "10.0.0.4:8083"},
                {"id": 1, "state": "FAILED", "worker_id": "10.0.0.5:8083", "trace": "org.apache.kafka..."}
            ],
            "type": "source"
        }"#;

        let status: ConnectorStatus = serde_json::from_str(body).unwrap();
        assert_eq!(status.connector.state, ConnectorState::Running);
        assert_eq!(status.failed_tasks(), 1);
        assert_eq!(status.effective_state(), ConnectorState::Failed);
    }

    #[test]
    fn test_running_without_tasks_is_unassigned() {
        let body = r#"{
            "name": "postgres-cdc-connector",
            "connector": {"state": "RUNNING", "worker_id": "10.0.0.4:8083"},
            "tasks": [],
            "type": "source"
        }"#;
        let status: ConnectorStatus = serde_json::from_str(body).unwrap();
        assert_eq!(status.effective_state(), ConnectorState::Unassigned);

        let paused: ConnectorStatus = serde_json::from_str(
            r#"{"name": "postgres-cdc-connector", "connector": {"state": "PAUSED"}, "tasks": []}"#,
        )
        .unwrap();
        assert_eq!(paused.effective_state(), ConnectorState::Paused);
    }

    #[test]
    fn test_unknown_state_is_tolerated() {
        let state: ConnectorState = serde_json::from_str("\"STOPPED\"").unwrap();
        assert_eq!(state, ConnectorState::Unknown);
    }

    #[test]
    fn test_connector_path_is_encoded() {
        assert_eq!(
            KafkaConnectClient::connector_path("pg cdc", "/status"),
            "/connectors/pg%20cdc/status"
        );
    }
}
