use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ComponentStatus::Healthy)
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct ComponentCheck {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
}

impl ComponentCheck {
    fn pending() -> Self {
        Self {
            status: ComponentStatus::Unhealthy,
            message: Some("not checked yet".into()),
            checked_at: None,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct Components {
    pub kafka: ComponentCheck,
    pub cdc: ComponentCheck,
    /// The consume loop feeding the processors
    pub pipeline: ComponentCheck,
}

impl Components {
    fn all_healthy(&self) -> bool {
        [&self.kafka, &self.cdc, &self.pipeline]
            .iter()
            .all(|c| c.status.is_healthy())
    }
}

/// Body of `GET /health`
#[derive(Serialize, Debug, Clone)]
pub struct HealthReport {
    /// `healthy` iff every component is healthy, otherwise `degraded`
    pub status: &'static str,
    pub components: Components,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Latest component checks, written by the orchestrator's periodic tasks
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<RwLock<Components>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Components {
                kafka: ComponentCheck::pending(),
                cdc: ComponentCheck::pending(),
                pipeline: ComponentCheck::pending(),
            })),
        }
    }

    pub fn set_kafka(&self, status: ComponentStatus, message: Option<String>) {
        self.inner.write().kafka = check(status, message);
    }

    pub fn set_cdc(&self, status: ComponentStatus, message: Option<String>) {
        self.inner.write().cdc = check(status, message);
    }

    pub fn set_pipeline(&self, status: ComponentStatus, message: Option<String>) {
        self.inner.write().pipeline = check(status, message);
    }

    pub fn report(&self) -> HealthReport {
        let components = self.inner.read().clone();
        let healthy = components.all_healthy();
        HealthReport {
            status: if healthy { "healthy" } else { "degraded" },
            components,
            timestamp: Utc::now(),
        }
    }
}

fn check(status: ComponentStatus, message: Option<String>) -> ComponentCheck {
    ComponentCheck {
        status,
        message,
        checked_at: Some(Utc::now()),
    }
}
