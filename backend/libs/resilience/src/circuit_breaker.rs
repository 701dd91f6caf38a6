/// Circuit breaker for outbound calls to a remote API
///
/// Closed trips to Open on a run of failures or on a high error rate over the
/// recent calls. Open rejects calls until the cool-down passes, then a single
/// HalfOpen phase lets probes through: enough successes close the breaker,
/// one failure opens it again.
use crate::metrics::CircuitBreakerMetrics;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures in a row that open the breaker
    pub failure_threshold: u32,
    /// Probe successes in a row that close it again
    pub success_threshold: u32,
    /// How long the breaker stays open before probing
    pub timeout: Duration,
    /// Failure share (0.0 - 1.0) of recent calls that opens the breaker
    pub error_rate_threshold: f64,
    /// Number of recent calls the error rate is computed over
    pub window_size: usize,
    /// The error rate is ignored until this many calls were recorded
    pub min_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            error_rate_threshold: 0.5,
            window_size: 50,
            min_calls: 10,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker '{0}' is open")]
    Open(String),
    #[error("{0}")]
    CallFailed(E),
}

/// Outcomes of the most recent calls
#[derive(Debug)]
struct Outcomes {
    recent: VecDeque<bool>,
    failures: usize,
    capacity: usize,
}

impl Outcomes {
    fn new(capacity: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(capacity),
            failures: 0,
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, ok: bool) {
        if self.recent.len() == self.capacity {
            if let Some(false) = self.recent.pop_front() {
                self.failures -= 1;
            }
        }
        if !ok {
            self.failures += 1;
        }
        self.recent.push_back(ok);
    }

    fn len(&self) -> usize {
        self.recent.len()
    }

    fn error_rate(&self) -> f64 {
        if self.recent.is_empty() {
            0.0
        } else {
            self.failures as f64 / self.recent.len() as f64
        }
    }

    fn clear(&mut self) {
        self.recent.clear();
        self.failures = 0;
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed { failures_in_row: u32 },
    Open { since: Instant },
    HalfOpen { successes_in_row: u32 },
}

impl Phase {
    fn state(&self) -> CircuitState {
        match self {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    outcomes: Outcomes,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<Inner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            inner: Arc::new(Mutex::new(Inner {
                phase: Phase::Closed { failures_in_row: 0 },
                outcomes: Outcomes::new(config.window_size),
            })),
            config: Arc::new(config),
        }
    }

    /// Run `f` unless the breaker is open; the call's own error is passed through
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.admit() {
            CircuitBreakerMetrics::record_call(CircuitState::Open.as_str(), "rejected");
            return Err(CircuitBreakerError::Open(self.name.to_string()));
        }

        let result = f().await;
        let state = self.record(result.is_ok());
        CircuitBreakerMetrics::record_call(
            state.as_str(),
            if result.is_ok() { "success" } else { "failure" },
        );
        result.map_err(CircuitBreakerError::CallFailed)
    }

    /// Whether a call may proceed; moves Open to HalfOpen once the cool-down passed
    fn admit(&self) -> bool {
        let mut inner = self.inner.lock();
        let phase = inner.phase;
        match phase {
            Phase::Open { since } if since.elapsed() >= self.config.timeout => {
                CircuitBreakerMetrics::record_open_duration(since.elapsed().as_secs_f64());
                info!(breaker = %self.name, "Circuit breaker half-open, probing");
                self.enter(&mut inner, Phase::HalfOpen { successes_in_row: 0 });
                true
            }
            Phase::Open { .. } => false,
            Phase::Closed { .. } | Phase::HalfOpen { .. } => true,
        }
    }

    fn record(&self, ok: bool) -> CircuitState {
        let mut inner = self.inner.lock();
        inner.outcomes.push(ok);

        let phase = inner.phase;
        let next = match (phase, ok) {
            (Phase::Closed { .. }, true) => Phase::Closed { failures_in_row: 0 },
            (Phase::Closed { failures_in_row }, false) => {
                let failures_in_row = failures_in_row + 1;
                let rate = inner.outcomes.error_rate();
                let rate_tripped = inner.outcomes.len() >= self.config.min_calls
                    && rate >= self.config.error_rate_threshold;
                if failures_in_row >= self.config.failure_threshold || rate_tripped {
                    warn!(
                        breaker = %self.name,
                        failures_in_row,
                        error_rate = rate,
                        "Circuit breaker opened"
                    );
                    Phase::Open { since: Instant::now() }
                } else {
                    Phase::Closed { failures_in_row }
                }
            }
            (Phase::HalfOpen { successes_in_row }, true) => {
                let successes_in_row = successes_in_row + 1;
                if successes_in_row >= self.config.success_threshold {
                    info!(breaker = %self.name, "Circuit breaker closed");
                    inner.outcomes.clear();
                    Phase::Closed { failures_in_row: 0 }
                } else {
                    Phase::HalfOpen { successes_in_row }
                }
            }
            (Phase::HalfOpen { .. }, false) => {
                warn!(breaker = %self.name, "Probe failed, circuit breaker re-opened");
                Phase::Open { since: Instant::now() }
            }
            // A call admitted just before another caller opened the breaker
            (phase @ Phase::Open { .. }, _) => phase,
        };

        self.enter(&mut inner, next);
        next.state()
    }

    fn enter(&self, inner: &mut Inner, next: Phase) {
        let from = inner.phase.state();
        let to = next.state();
        if from != to {
            CircuitBreakerMetrics::record_state_transition(from.as_str(), to.as_str());
        }
        inner.phase = next;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().phase.state()
    }

    pub fn error_rate(&self) -> f64 {
        self.inner.lock().outcomes.error_rate()
    }

    /// Close the breaker and forget recent outcomes
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.outcomes.clear();
        self.enter(&mut inner, Phase::Closed { failures_in_row: 0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new("kafka-connect", config)
    }

    async fn fail(cb: &CircuitBreaker) {
        let _ = cb.call(|| async { Err::<(), _>("503 Service Unavailable") }).await;
    }

    async fn succeed(cb: &CircuitBreaker) {
        let _ = cb.call(|| async { Ok::<_, String>(()) }).await;
    }

    #[tokio::test]
    async fn test_opens_after_failures_in_a_row() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });

        for _ in 0..3 {
            fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let result = cb.call(|| async { Ok::<_, String>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Open(name)) if name == "kafka-connect"));
    }

    #[tokio::test]
    async fn test_success_resets_the_run() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });

        fail(&cb).await;
        fail(&cb).await;
        succeed(&cb).await;
        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_call_error_passes_through() {
        let cb = breaker(CircuitBreakerConfig::default());
        let result = cb.call(|| async { Err::<(), _>(409u16) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::CallFailed(409))));
    }

    #[tokio::test]
    async fn test_probe_successes_close_the_breaker() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            timeout: Duration::from_millis(50),
            ..Default::default()
        });

        fail(&cb).await;
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.error_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            timeout: Duration::from_millis(50),
            ..Default::default()
        });

        fail(&cb).await;
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        succeed(&cb).await;
        fail(&cb).await;

        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_error_rate_waits_for_min_calls() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 100,
            error_rate_threshold: 0.5,
            window_size: 10,
            min_calls: 10,
            ..Default::default()
        });

        succeed(&cb).await;
        for _ in 0..4 {
            fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        for _ in 0..5 {
            fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_outcome_window_evicts_oldest() {
        let mut outcomes = Outcomes::new(3);
        outcomes.push(false);
        outcomes.push(true);
        outcomes.push(true);
        assert!((outcomes.error_rate() - 1.0 / 3.0).abs() < f64::EPSILON);

        outcomes.push(true);
        assert_eq!(outcomes.error_rate(), 0.0);
        assert_eq!(outcomes.len(), 3);
    }

    #[tokio::test]
    async fn test_reset_closes_circuit() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.error_rate(), 0.0);
    }
}
