use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::connector::client::{ConnectApi, ConnectorState, ConnectorStatus, TaskStatus};
use crate::connector::spec::{diverging_keys, ConnectorSpec};
use crate::connector::supervisor::{
    ConnectorHealth, ConnectorRecovery, RecoveryAction, RestartPolicy,
};
use crate::error::{EventBusError, Result};
use crate::metrics::ConnectorMetrics;

/// What `ensure_connector` had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnsureOutcome {
    Created,
    Updated,
    Resumed,
    Unchanged,
}

/// Snapshot of one supervised connector
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorReport {
    pub name: String,
    pub state: Option<ConnectorState>,
    pub tasks: Vec<TaskStatus>,
    pub phase: &'static str,
    pub health: ConnectorHealth,
    pub health_score: f64,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_polled: Option<DateTime<Utc>>,
}

struct Supervised {
    spec: ConnectorSpec,
    recovery: ConnectorRecovery,
    status: Option<ConnectorStatus>,
    restart_count: u32,
    last_error: Option<String>,
    last_polled: Option<DateTime<Utc>>,
}

impl Supervised {
    fn report(&self) -> ConnectorReport {
        ConnectorReport {
            name: self.spec.name.clone(),
            state: self.recovery.last_state(),
            tasks: self
                .status
                .as_ref()
                .map(|s| s.tasks.clone())
                .unwrap_or_default(),
            phase: self.recovery.phase().as_str(),
            health: self.recovery.health(),
            health_score: self
                .status
                .as_ref()
                .map_or(0.0, |s| health_score(s, self.restart_count)),
            restart_count: self.restart_count,
            last_error: self.last_error.clone(),
            last_polled: self.last_polled,
        }
    }
}

/// Connector health score in `[0, 1]`
pub fn health_score(status: &ConnectorStatus, restart_count: u32) -> f64 {
    let mut score = 1.0;
    if status.connector.state != ConnectorState::Running {
        score -= 0.5;
    }
    if !status.tasks.is_empty() {
        score -= 0.3 * status.failed_tasks() as f64 / status.tasks.len() as f64;
    }
    score -= 0.05 * restart_count as f64;
    score.max(0.0)
}

/// Supervises Debezium connectors on a Kafka Connect cluster
///
/// Connectors are never deleted on shutdown, only paused.
pub struct ConnectorManager {
    api: Arc<dyn ConnectApi>,
    policy: RestartPolicy,
    connectors: Mutex<BTreeMap<String, Supervised>>,
    metrics: ConnectorMetrics,
}

impl ConnectorManager {
    pub fn new(api: Arc<dyn ConnectApi>, policy: RestartPolicy, metrics: ConnectorMetrics) -> Self {
        Self {
            api,
            policy,
            connectors: Mutex::new(BTreeMap::new()),
            metrics,
        }
    }

    /// Put `spec` under supervision without contacting Connect
    pub fn supervise(&self, spec: ConnectorSpec) {
        let mut connectors = self.connectors.lock();
        match connectors.get_mut(&spec.name) {
            Some(existing) => existing.spec = spec,
            None => {
                connectors.insert(
                    spec.name.clone(),
                    Supervised {
                        spec,
                        recovery: ConnectorRecovery::new(self.policy.clone()),
                        status: None,
                        restart_count: 0,
                        last_error: None,
                        last_polled: None,
                    },
                );
            }
        }
    }

    /// Create the connector, or reconcile its config, so that it matches `spec`
    ///
    /// A divergent config is applied as pause, update, resume. A paused
    /// connector with the right config is resumed. Safe to call on every start.
    pub async fn ensure_connector(&self, spec: &ConnectorSpec) -> Result<EnsureOutcome> {
        self.supervise(spec.clone());
        let name = spec.name.as_str();

        let outcome = match self.api.get_config(name).await? {
            None => {
                self.api.create_connector(name, &spec.config).await?;
                EnsureOutcome::Created
            }
            Some(current) => {
                let diverging = diverging_keys(&current, &spec.config);
                if !diverging.is_empty() {
                    info!(connector = %name, keys = ?diverging, "Connector config diverges, updating");
                    self.api.pause(name).await?;
                    self.api.update_config(name, &spec.config).await?;
                    self.api.resume(name).await?;
                    EnsureOutcome::Updated
                } else if self.api.status(name).await?.connector.state == ConnectorState::Paused {
                    self.api.resume(name).await?;
                    EnsureOutcome::Resumed
                } else {
                    EnsureOutcome::Unchanged
                }
            }
        };

        info!(connector = %name, outcome = ?outcome, "Connector ensured");
        Ok(outcome)
    }

    pub async fn ensure_all(&self, specs: &[ConnectorSpec]) -> Result<()> {
        for spec in specs {
            self.ensure_connector(spec).await?;
        }
        Ok(())
    }

    /// Poll every supervised connector once and drive recovery
    pub async fn poll_health(&self) -> Vec<ConnectorReport> {
        let names: Vec<String> = self.connectors.lock().keys().cloned().collect();
        let mut reports = Vec::with_capacity(names.len());

        for name in names {
            self.poll_one(&name).await;
            if let Some(report) = self.connector(&name) {
                reports.push(report);
            }
        }
        reports
    }

    async fn poll_one(&self, name: &str) {
        let status = match self.api.status(name).await {
            Ok(status) => status,
            Err(EventBusError::NotFound(_)) => {
                warn!(connector = %name, "Connector missing on Connect cluster, recreating");
                self.recreate(name).await;
                return;
            }
            Err(e) => {
                self.metrics.poll_failures_total.inc();
                warn!(connector = %name, "Connector status poll failed: {}", e);
                if let Some(entry) = self.connectors.lock().get_mut(name) {
                    entry.last_error = Some(e.to_string());
                }
                return;
            }
        };

        let state = status.effective_state();
        let action = {
            let mut connectors = self.connectors.lock();
            let Some(entry) = connectors.get_mut(name) else {
                return;
            };
            let action = entry.recovery.observe(state, Instant::now());
            entry.status = Some(status);
            entry.last_polled = Some(Utc::now());
            self.record_gauges(name, entry);
            action
        };

        match action {
            RecoveryAction::None => debug!(connector = %name, state = %state, "Connector polled"),
            RecoveryAction::Wait => {
                debug!(connector = %name, "Connector failed, waiting for restart backoff")
            }
            RecoveryAction::Restart { attempt } => self.auto_restart(name, attempt).await,
            RecoveryAction::GiveUp => {
                let err = EventBusError::ConnectorUnhealthy(format!(
                    "{} failed more than {} times within {:?}, manual restart required",
                    name, self.policy.max_restarts, self.policy.window
                ));
                error!(connector = %name, "{}", err);
                if let Some(entry) = self.connectors.lock().get_mut(name) {
                    entry.last_error = Some(err.to_string());
                }
            }
        }
    }

    async fn auto_restart(&self, name: &str, attempt: u32) {
        info!(connector = %name, attempt, "Restarting failed connector");
        let result = self.api.restart(name).await;

        let mut connectors = self.connectors.lock();
        let Some(entry) = connectors.get_mut(name) else {
            return;
        };
        match result {
            Ok(()) => {
                entry.restart_count += 1;
                self.metrics
                    .restarts_total
                    .with_label_values(&[name, "auto"])
                    .inc();
            }
            Err(e) => {
                error!(connector = %name, attempt, "Connector restart failed: {}", e);
                entry.recovery.restart_failed(Instant::now());
                entry.last_error = Some(e.to_string());
            }
        }
        self.record_gauges(name, entry);
    }

    async fn recreate(&self, name: &str) {
        let spec = match self.connectors.lock().get(name) {
            Some(entry) => entry.spec.clone(),
            None => return,
        };
        if let Err(e) = self.ensure_connector(&spec).await {
            error!(connector = %name, "Failed to recreate connector: {}", e);
            if let Some(entry) = self.connectors.lock().get_mut(name) {
                entry.last_error = Some(e.to_string());
            }
        }
    }

    fn record_gauges(&self, name: &str, entry: &Supervised) {
        let report = entry.report();
        self.metrics
            .health_score
            .with_label_values(&[name])
            .set(report.health_score);
        self.metrics
            .healthy
            .with_label_values(&[name])
            .set(i64::from(report.health == ConnectorHealth::Healthy));
    }

    /// Operator restart; clears a give-up
    pub async fn restart_connector(&self, name: &str) -> Result<ConnectorReport> {
        self.require(name)?;
        self.api.restart(name).await?;

        let mut connectors = self.connectors.lock();
        let entry = connectors
            .get_mut(name)
            .ok_or_else(|| EventBusError::NotFound(format!("connector {}", name)))?;
        entry.recovery.manual_reset();
        entry.restart_count += 1;
        entry.last_error = None;
        self.metrics
            .restarts_total
            .with_label_values(&[name, "manual"])
            .inc();
        info!(connector = %name, "Connector restarted by operator");
        Ok(entry.report())
    }

    pub async fn pause_connector(&self, name: &str) -> Result<()> {
        self.require(name)?;
        self.api.pause(name).await?;
        info!(connector = %name, "Connector paused");
        Ok(())
    }

    pub async fn resume_connector(&self, name: &str) -> Result<()> {
        self.require(name)?;
        self.api.resume(name).await?;
        info!(connector = %name, "Connector resumed");
        Ok(())
    }

    /// Delete the connector from Connect and stop supervising it
    pub async fn delete_connector(&self, name: &str) -> Result<()> {
        self.require(name)?;
        self.api.delete(name).await?;
        self.connectors.lock().remove(name);
        Ok(())
    }

    /// Best-effort pause of every supervised connector
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.connectors.lock().keys().cloned().collect();
        for name in names {
            match self.api.pause(&name).await {
                Ok(()) => info!(connector = %name, "Connector paused for shutdown"),
                Err(e) => warn!(connector = %name, "Failed to pause connector on shutdown: {}", e),
            }
        }
    }

    pub fn connectors(&self) -> Vec<ConnectorReport> {
        self.connectors.lock().values().map(Supervised::report).collect()
    }

    pub fn connector(&self, name: &str) -> Option<ConnectorReport> {
        self.connectors.lock().get(name).map(Supervised::report)
    }

    /// `Ok` when every connector is healthy
    pub fn check_health(&self) -> Result<()> {
        let unhealthy: Vec<String> = self
            .connectors
            .lock()
            .values()
            .filter(|c| c.recovery.health() != ConnectorHealth::Healthy)
            .map(|c| format!("{} ({})", c.spec.name, c.recovery.phase().as_str()))
            .collect();

        if unhealthy.is_empty() {
            Ok(())
        } else {
            Err(EventBusError::ConnectorUnhealthy(unhealthy.join(", ")))
        }
    }

    /// Reachability of the Connect REST API
    pub async fn ping(&self) -> Result<()> {
        self.api.ping().await
    }

    fn require(&self, name: &str) -> Result<()> {
        if self.connectors.lock().contains_key(name) {
            Ok(())
        } else {
            Err(EventBusError::NotFound(format!("connector {}", name)))
        }
    }
}
