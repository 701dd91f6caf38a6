/// Tuned settings for each dependency of the event bus
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;
use std::time::Duration;

/// Timeout, breaker and retry settings for one dependency
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub timeout: TimeoutConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: Option<RetryConfig>,
}

impl ServiceConfig {
    fn new(timeout: Duration, retry: RetryConfig) -> Self {
        Self {
            timeout: TimeoutConfig { duration: timeout },
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: Some(retry),
        }
    }

    fn breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }
}

/// Doubling backoff with jitter between `initial` and `max`
fn doubling(attempts: u32, initial: Duration, max: Duration, budget: Option<Duration>) -> RetryConfig {
    RetryConfig {
        initial_backoff: initial,
        max_backoff: max,
        backoff_multiplier: 2.0,
        jitter: true,
        max_elapsed: budget,
        ..RetryConfig::default()
    }
    .with_max_attempts(attempts)
}

/// Producing to Kafka: 5 attempts within 30s, each delivery bounded by 30s
pub fn kafka_producer_config() -> ServiceConfig {
    ServiceConfig::new(
        Duration::from_secs(30),
        doubling(
            5,
            Duration::from_millis(200),
            Duration::from_secs(5),
            Some(Duration::from_secs(30)),
        ),
    )
    .breaker(CircuitBreakerConfig {
        window_size: 100,
        min_calls: 20,
        ..CircuitBreakerConfig::default()
    })
}

/// Topic creation and metadata requests; create-if-absent is safe to repeat
pub fn kafka_admin_config() -> ServiceConfig {
    ServiceConfig::new(
        Duration::from_secs(10),
        doubling(
            3,
            Duration::from_millis(500),
            Duration::from_secs(5),
            Some(Duration::from_secs(30)),
        ),
    )
}

/// Kafka Connect REST calls
///
/// A single successful probe closes the breaker since the supervisor polls
/// rarely.
pub fn connect_api_config() -> ServiceConfig {
    ServiceConfig::new(
        Duration::from_secs(10),
        doubling(
            3,
            Duration::from_millis(250),
            Duration::from_secs(2),
            Some(Duration::from_secs(20)),
        ),
    )
    .breaker(CircuitBreakerConfig {
        success_threshold: 1,
        error_rate_threshold: 0.6,
        ..CircuitBreakerConfig::default()
    })
}

/// One processor invocation: 3 attempts, 30s each
pub fn processor_config() -> ServiceConfig {
    ServiceConfig::new(
        Duration::from_secs(30),
        doubling(3, Duration::from_millis(100), Duration::from_secs(2), None),
    )
}
