use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EventBusError>;

#[derive(Debug, Error)]
pub enum EventBusError {
    /// Broker unreachable or not acknowledging; retried before surfacing
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Malformed or semantically invalid event; never retried
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Connector unhealthy: {0}")]
    ConnectorUnhealthy(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Non-retryable broker error (oversized record, authorization, ...)
    #[error("Kafka error: {0}")]
    Kafka(String),

    #[error("Kafka Connect error ({status:?}): {message}")]
    Connect { status: Option<u16>, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EventBusError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            EventBusError::BrokerUnavailable(_) | EventBusError::Timeout(_) => true,
            // 409 is returned while the Connect cluster rebalances
            EventBusError::Connect { status, .. } => {
                matches!(status, None | Some(409) | Some(500..=599))
            }
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EventBusError::BrokerUnavailable(_) => "broker_unavailable",
            EventBusError::InvalidEvent(_) => "invalid_event",
            EventBusError::ConnectorUnhealthy(_) => "connector_unhealthy",
            EventBusError::Config(_) => "config",
            EventBusError::Validation(_) => "validation",
            EventBusError::NotFound(_) => "not_found",
            EventBusError::Kafka(_) => "kafka",
            EventBusError::Connect { .. } => "connect",
            EventBusError::Serialization(_) => "serialization",
            EventBusError::Timeout(_) => "timeout",
            EventBusError::Internal(_) => "internal",
        }
    }
}

impl From<resilience::TimeoutError> for EventBusError {
    fn from(err: resilience::TimeoutError) -> Self {
        EventBusError::Timeout(err.to_string())
    }
}

impl From<prometheus::Error> for EventBusError {
    fn from(err: prometheus::Error) -> Self {
        EventBusError::Internal(format!("metrics: {}", err))
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

impl ResponseError for EventBusError {
    fn error_response(&self) -> HttpResponse {
        let code = self.status_code();
        let message = match self {
            EventBusError::NotFound(msg)
            | EventBusError::Validation(msg)
            | EventBusError::InvalidEvent(msg) => msg.clone(),
            _ => self.to_string(),
        };

        HttpResponse::build(code).json(ErrorResponse {
            error: message,
            code: code.as_u16(),
        })
    }

    fn status_code(&self) -> StatusCode {
        match self {
            EventBusError::NotFound(_) => StatusCode::NOT_FOUND,
            EventBusError::Validation(_) | EventBusError::InvalidEvent(_) => {
                StatusCode::BAD_REQUEST
            }
            EventBusError::ConnectorUnhealthy(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EventBusError::BrokerUnavailable("down".into()).is_transient());
        assert!(EventBusError::Timeout("publish".into()).is_transient());
        assert!(EventBusError::Connect {
            status: Some(503),
            message: "busy".into()
        }
        .is_transient());
        assert!(!EventBusError::Connect {
            status: Some(400),
            message: "bad config".into()
        }
        .is_transient());
        assert!(!EventBusError::InvalidEvent("no after".into()).is_transient());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            EventBusError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            EventBusError::ConnectorUnhealthy("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            EventBusError::BrokerUnavailable("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
