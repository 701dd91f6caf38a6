/// Resilience patterns for the event bus
///
/// - **Retry**: exponential backoff with jitter, a retryability predicate and an overall time budget
/// - **Timeout**: relative and absolute deadlines for async calls
/// - **Circuit Breaker**: fail fast against a dependency that keeps erroring
/// - **Presets**: tuned settings for the Kafka producer, Kafka admin, Kafka Connect and processors
///
/// # Example: publish with the producer preset
///
/// ```rust,no_run
/// use resilience::{presets, with_retry_if};
///
/// #[tokio::main]
/// async fn main() {
///     let retry = presets::kafka_producer_config().retry.unwrap_or_default();
///
///     let result = with_retry_if(
///         retry,
///         || async { Err::<(), _>("broker unavailable") },
///         |e| *e == "broker unavailable",
///     )
///     .await;
///
///     assert!(result.is_err());
/// }
/// ```

pub mod circuit_breaker;
pub mod metrics;
pub mod presets;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use presets::{
    connect_api_config, kafka_admin_config, kafka_producer_config, processor_config, ServiceConfig,
};
pub use retry::{with_retry, with_retry_if, RetryConfig, RetryError};
pub use timeout::{remaining, with_deadline, with_timeout, TimeoutConfig, TimeoutError};
