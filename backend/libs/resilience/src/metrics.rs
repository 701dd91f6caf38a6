/// Prometheus instrumentation for retries, deadlines and circuit breakers
///
/// Collectors live in the default registry and are only compiled in with the
/// `metrics` feature; without it every recorder is a no-op.
#[cfg(feature = "metrics")]
mod collectors {
    use once_cell::sync::Lazy;
    use prometheus::{
        register_histogram, register_histogram_vec, register_int_counter_vec, Histogram,
        HistogramVec, IntCounterVec,
    };

    pub(super) struct Collectors {
        pub breaker_transitions: IntCounterVec,
        pub breaker_calls: IntCounterVec,
        pub breaker_open_seconds: Histogram,
        pub deadline_outcomes: IntCounterVec,
        pub retry_attempts: HistogramVec,
    }

    fn register() -> prometheus::Result<Collectors> {
        Ok(Collectors {
            breaker_transitions: register_int_counter_vec!(
                "resilience_circuit_breaker_transitions_total",
                "Circuit breaker state changes",
                &["from", "to"]
            )?,
            breaker_calls: register_int_counter_vec!(
                "resilience_circuit_breaker_calls_total",
                "Calls seen by circuit breakers, by state and outcome",
                &["state", "result"]
            )?,
            breaker_open_seconds: register_histogram!(
                "resilience_circuit_breaker_open_seconds",
                "Time a circuit breaker spent open before probing",
                vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]
            )?,
            deadline_outcomes: register_int_counter_vec!(
                "resilience_deadline_outcomes_total",
                "Deadline-bounded operations, by outcome",
                &["result"]
            )?,
            retry_attempts: register_histogram_vec!(
                "resilience_retry_attempts",
                "Attempts used by a retried operation",
                &["result"],
                vec![1.0, 2.0, 3.0, 4.0, 5.0, 8.0, 13.0]
            )?,
        })
    }

    // Registration fails only when another copy already owns the names
    pub(super) static COLLECTORS: Lazy<Option<Collectors>> = Lazy::new(|| register().ok());
}

#[cfg(feature = "metrics")]
fn with_collectors(f: impl FnOnce(&collectors::Collectors)) {
    if let Some(c) = collectors::COLLECTORS.as_ref() {
        f(c);
    }
}

pub struct CircuitBreakerMetrics;

impl CircuitBreakerMetrics {
    #[allow(unused_variables)]
    pub fn record_state_transition(from: &str, to: &str) {
        #[cfg(feature = "metrics")]
        with_collectors(|c| c.breaker_transitions.with_label_values(&[from, to]).inc());
    }

    #[allow(unused_variables)]
    pub fn record_call(state: &str, result: &str) {
        #[cfg(feature = "metrics")]
        with_collectors(|c| c.breaker_calls.with_label_values(&[state, result]).inc());
    }

    #[allow(unused_variables)]
    pub fn record_open_duration(duration_secs: f64) {
        #[cfg(feature = "metrics")]
        with_collectors(|c| c.breaker_open_seconds.observe(duration_secs));
    }
}

pub struct TimeoutMetrics;

impl TimeoutMetrics {
    #[allow(unused_variables)]
    pub fn record_operation(result: &str) {
        #[cfg(feature = "metrics")]
        with_collectors(|c| c.deadline_outcomes.with_label_values(&[result]).inc());
    }
}

pub struct RetryMetrics;

impl RetryMetrics {
    #[allow(unused_variables)]
    pub fn record_attempts(result: &str, attempts: u32) {
        #[cfg(feature = "metrics")]
        with_collectors(|c| {
            c.retry_attempts
                .with_label_values(&[result])
                .observe(f64::from(attempts))
        });
    }
}
