/// Bounding async work by a duration or by an absolute deadline
use crate::metrics::TimeoutMetrics;
use std::future::Future;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub duration: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30),
        }
    }
}

impl TimeoutConfig {
    /// Deadline for an operation starting now
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.duration
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TimeoutError {
    #[error("Operation timed out after {0:?}")]
    Elapsed(Duration),
}

impl TimeoutError {
    pub fn is_elapsed(&self) -> bool {
        matches!(self, TimeoutError::Elapsed(_))
    }
}

/// Time left before `deadline`, zero once it has passed
pub fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Poll `future` for at most `budget`
pub async fn with_timeout<F, T>(budget: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    let outcome = tokio::time::timeout(budget, future).await;
    TimeoutMetrics::record_operation(if outcome.is_ok() { "completed" } else { "elapsed" });
    outcome.map_err(|_| TimeoutError::Elapsed(budget))
}

/// Poll `future` until `deadline`; a deadline in the past fails without polling
pub async fn with_deadline<F, T>(deadline: Instant, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    let budget = remaining(deadline);
    if budget.is_zero() {
        TimeoutMetrics::record_operation("elapsed");
        return Err(TimeoutError::Elapsed(budget));
    }
    with_timeout(budget, future).await
}
