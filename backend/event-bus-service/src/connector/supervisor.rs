//! Auto-recovery state machine for one connector
//!
//! Each poll feeds the observed state into [`ConnectorRecovery::observe`],
//! which answers with the action to take. Failures are counted inside a
//! sliding window; once more than `max_restarts` failures fall in the window
//! the connector is given up on until an operator restarts it.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::ConnectConfig;
use crate::connector::client::ConnectorState;

#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub window: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            window: Duration::from_secs(600),
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RestartPolicy {
    pub fn from_config(config: &ConnectConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            window: Duration::from_secs(config.restart_window_secs),
            initial_backoff: Duration::from_millis(config.restart_backoff_initial_ms),
            max_backoff: Duration::from_millis(config.restart_backoff_max_ms),
        }
    }

    /// Delay before restarting after the n-th failure in the window (1-based)
    pub fn backoff_for(&self, failure: u32) -> Duration {
        let exp = failure.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    Healthy,
    BackingOff { until: Instant, attempt: u32 },
    Restarting { attempt: u32 },
    GaveUp,
    Unassigned,
    Paused,
}

impl RecoveryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryPhase::Healthy => "healthy",
            RecoveryPhase::BackingOff { .. } => "backing_off",
            RecoveryPhase::Restarting { .. } => "restarting",
            RecoveryPhase::GaveUp => "gave_up",
            RecoveryPhase::Unassigned => "unassigned",
            RecoveryPhase::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    None,
    /// Failed, waiting for the backoff to elapse
    Wait,
    Restart { attempt: u32 },
    /// Restart budget spent; report the connector as unhealthy
    GiveUp,
}

/// Coarse health derived from the last observation and the recovery phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct ConnectorRecovery {
    policy: RestartPolicy,
    phase: RecoveryPhase,
    failures: VecDeque<Instant>,
    last_state: Option<ConnectorState>,
}

impl ConnectorRecovery {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            phase: RecoveryPhase::Healthy,
            failures: VecDeque::new(),
            last_state: None,
        }
    }

    pub fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    pub fn last_state(&self) -> Option<ConnectorState> {
        self.last_state
    }

    /// Failures currently inside the window
    pub fn recent_failures(&self) -> usize {
        self.failures.len()
    }

    pub fn gave_up(&self) -> bool {
        self.phase == RecoveryPhase::GaveUp
    }

    pub fn observe(&mut self, state: ConnectorState, now: Instant) -> RecoveryAction {
        self.last_state = Some(state);

        if self.phase == RecoveryPhase::GaveUp {
            return RecoveryAction::None;
        }

        match state {
            ConnectorState::Running => {
                self.phase = RecoveryPhase::Healthy;
                RecoveryAction::None
            }
            ConnectorState::Paused => {
                self.phase = RecoveryPhase::Paused;
                RecoveryAction::None
            }
            ConnectorState::Unassigned => {
                self.phase = RecoveryPhase::Unassigned;
                RecoveryAction::None
            }
            // A restart in progress, or a state this client does not know
            ConnectorState::Restarting | ConnectorState::Unknown => RecoveryAction::None,
            ConnectorState::Failed => self.on_failed(now),
        }
    }

    fn on_failed(&mut self, now: Instant) -> RecoveryAction {
        if let RecoveryPhase::BackingOff { until, attempt } = self.phase {
            return self.restart_if_due(until, attempt, now);
        }

        // A fresh failure (from healthy, or after a restart that did not stick)
        self.prune(now);
        self.failures.push_back(now);
        let failures = self.failures.len() as u32;

        if failures > self.policy.max_restarts {
            self.phase = RecoveryPhase::GaveUp;
            return RecoveryAction::GiveUp;
        }

        let until = now + self.policy.backoff_for(failures);
        self.phase = RecoveryPhase::BackingOff {
            until,
            attempt: failures,
        };
        self.restart_if_due(until, failures, now)
    }

    fn restart_if_due(&mut self, until: Instant, attempt: u32, now: Instant) -> RecoveryAction {
        if now >= until {
            self.phase = RecoveryPhase::Restarting { attempt };
            RecoveryAction::Restart { attempt }
        } else {
            RecoveryAction::Wait
        }
    }

    /// The restart request itself failed; try again after another backoff
    pub fn restart_failed(&mut self, now: Instant) {
        if let RecoveryPhase::Restarting { attempt } = self.phase {
            self.phase = RecoveryPhase::BackingOff {
                until: now + self.policy.backoff_for(attempt),
                attempt,
            };
        }
    }

    /// Operator intervention: forget the failure history
    pub fn manual_reset(&mut self) {
        self.failures.clear();
        self.phase = RecoveryPhase::Restarting { attempt: 0 };
    }

    pub fn health(&self) -> ConnectorHealth {
        match (self.phase, self.last_state) {
            (RecoveryPhase::GaveUp, _) | (RecoveryPhase::Unassigned, _) => ConnectorHealth::Unhealthy,
            (RecoveryPhase::Healthy, Some(ConnectorState::Running)) => ConnectorHealth::Healthy,
            (RecoveryPhase::Restarting { .. }, _) => ConnectorHealth::Healthy,
            (_, Some(ConnectorState::Restarting)) => ConnectorHealth::Healthy,
            _ => ConnectorHealth::Degraded,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(first) = self.failures.front() {
            if now.duration_since(*first) > self.policy.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn immediate_policy() -> RestartPolicy {
        RestartPolicy {
            max_restarts: 3,
            window: Duration::from_secs(600),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_secs(5));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(10));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(20));
        assert_eq!(policy.backoff_for(12), Duration::from_secs(300));
    }

    #[test]
    fn test_fourth_failure_gives_up() {
        let mut recovery = ConnectorRecovery::new(immediate_policy());
        let now = Instant::now();

        for attempt in 1..=3 {
            assert_eq!(
                recovery.observe(ConnectorState::Failed, now),
                RecoveryAction::Restart { attempt }
            );
            assert_eq!(recovery.observe(ConnectorState::Running, now), RecoveryAction::None);
        }

        assert_eq!(recovery.observe(ConnectorState::Failed, now), RecoveryAction::GiveUp);
        assert_eq!(recovery.health(), ConnectorHealth::Unhealthy);

        // Stays given up even if the connector comes back by itself
        assert_eq!(recovery.observe(ConnectorState::Running, now), RecoveryAction::None);
        assert!(recovery.gave_up());

        recovery.manual_reset();
        assert_eq!(recovery.observe(ConnectorState::Running, now), RecoveryAction::None);
        assert_eq!(recovery.health(), ConnectorHealth::Healthy);
    }

    #[test]
    fn test_waits_for_backoff() {
        let mut recovery = ConnectorRecovery::new(RestartPolicy::default());
        let start = Instant::now();

        assert_eq!(recovery.observe(ConnectorState::Failed, start), RecoveryAction::Wait);
        assert_eq!(
            recovery.observe(ConnectorState::Failed, start + Duration::from_secs(2)),
            RecoveryAction::Wait
        );
        assert_eq!(
            recovery.observe(ConnectorState::Failed, start + Duration::from_secs(5)),
            RecoveryAction::Restart { attempt: 1 }
        );
        assert_eq!(recovery.recent_failures(), 1);
    }

    #[test]
    fn test_failures_outside_window_are_forgotten() {
        let mut recovery = ConnectorRecovery::new(immediate_policy());
        let start = Instant::now();

        for _ in 0..3 {
            recovery.observe(ConnectorState::Failed, start);
            recovery.observe(ConnectorState::Running, start);
        }

        let later = start + Duration::from_secs(601);
        assert_eq!(
            recovery.observe(ConnectorState::Failed, later),
            RecoveryAction::Restart { attempt: 1 }
        );
    }

    #[test]
    fn test_unassigned_is_never_restarted() {
        let mut recovery = ConnectorRecovery::new(immediate_policy());
        let now = Instant::now();

        for _ in 0..10 {
            assert_eq!(recovery.observe(ConnectorState::Unassigned, now), RecoveryAction::None);
        }
        assert_eq!(recovery.phase(), RecoveryPhase::Unassigned);
        assert_eq!(recovery.health(), ConnectorHealth::Unhealthy);
        assert_eq!(recovery.recent_failures(), 0);
    }

    #[test]
    fn test_paused_is_not_a_failure() {
        let mut recovery = ConnectorRecovery::new(immediate_policy());
        assert_eq!(
            recovery.observe(ConnectorState::Paused, Instant::now()),
            RecoveryAction::None
        );
        assert_eq!(recovery.recent_failures(), 0);
        assert_eq!(recovery.health(), ConnectorHealth::Degraded);
    }

    #[test]
    fn test_failed_restart_backs_off_again() {
        let mut recovery = ConnectorRecovery::new(RestartPolicy::default());
        let start = Instant::now();

        recovery.observe(ConnectorState::Failed, start);
        let due = start + Duration::from_secs(5);
        assert_eq!(
            recovery.observe(ConnectorState::Failed, due),
            RecoveryAction::Restart { attempt: 1 }
        );

        recovery.restart_failed(due);
        assert_eq!(recovery.observe(ConnectorState::Failed, due), RecoveryAction::Wait);
        assert_eq!(recovery.recent_failures(), 1);
    }
}
