/// Integration tests combining retry, deadlines and the circuit breaker
use resilience::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState},
    presets,
    retry::{with_retry_if, RetryConfig, RetryError},
    timeout::{with_timeout, TimeoutError},
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
enum FakeBrokerError {
    Unavailable,
    Rejected,
}

impl std::fmt::Display for FakeBrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FakeBrokerError::Unavailable => write!(f, "broker unavailable"),
            FakeBrokerError::Rejected => write!(f, "record rejected"),
        }
    }
}

fn quick(config: RetryConfig) -> RetryConfig {
    RetryConfig {
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        jitter: false,
        ..config
    }
}

// ==================== Retry + Timeout ====================

#[tokio::test]
async fn test_timed_out_attempts_are_retried() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let result = with_retry_if(
        quick(RetryConfig::default()),
        move || {
            let n = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                with_timeout(Duration::from_millis(10), async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    7
                })
                .await
            }
        },
        TimeoutError::is_elapsed,
    )
    .await;

    assert_eq!(result.unwrap(), 7);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_producer_preset_gives_up_after_five_attempts() {
    let retry = quick(presets::kafka_producer_config().retry.unwrap_or_default());
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let err = with_retry_if(
        retry,
        move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(FakeBrokerError::Unavailable) }
        },
        |e| matches!(e, FakeBrokerError::Unavailable),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, RetryError::Exhausted { attempts: 5, .. }));
    assert_eq!(counter.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_rejected_record_is_not_retried() {
    let retry = quick(presets::kafka_producer_config().retry.unwrap_or_default());

    let err = with_retry_if(
        retry,
        || async { Err::<(), _>(FakeBrokerError::Rejected) },
        |e| matches!(e, FakeBrokerError::Unavailable),
    )
    .await
    .unwrap_err();

    assert_eq!(err.attempts(), 1);
    assert!(matches!(err.into_inner(), FakeBrokerError::Rejected));
}

// ==================== Circuit Breaker + Timeout ====================

#[tokio::test]
async fn test_breaker_opens_on_repeated_timeouts() {
    let cb = CircuitBreaker::new(
        "kafka-connect",
        CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        },
    );

    for _ in 0..2 {
        let _ = cb
            .call(|| async {
                with_timeout(Duration::from_millis(10), async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                })
                .await
            })
            .await;
    }

    assert_eq!(cb.state(), CircuitState::Open);
    let rejected = cb.call(|| async { Ok::<_, String>(()) }).await;
    assert!(matches!(rejected, Err(CircuitBreakerError::Open(name)) if name == "kafka-connect"));
}

#[tokio::test]
async fn test_breaker_full_lifecycle() {
    let cb = CircuitBreaker::new(
        "lifecycle",
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_millis(50),
            ..Default::default()
        },
    );

    for _ in 0..3 {
        let _ = cb.call(|| async { Err::<(), _>("error") }).await;
    }
    assert_eq!(cb.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let _ = cb.call(|| async { Ok::<_, String>(()) }).await;
    assert_eq!(cb.state(), CircuitState::HalfOpen);

    let _ = cb.call(|| async { Ok::<_, String>(()) }).await;
    assert_eq!(cb.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_connect_preset_breaker_starts_closed() {
    let config = presets::connect_api_config();
    let cb = CircuitBreaker::new("connect", config.circuit_breaker);

    assert_eq!(cb.state(), CircuitState::Closed);
    let result = cb.call(|| async { Ok::<_, String>(42) }).await;
    assert_eq!(result.unwrap(), 42);
}
