use thiserror::Error;

pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyError {
    /// Another worker holds the claim for this entity and event
    #[error("Event {event_id} is already being processed for {entity}")]
    InFlight { entity: String, event_id: String },

    /// Empty, oversized or otherwise unusable event id
    #[error("Invalid event ID: {0}")]
    InvalidEventId(String),
}

impl IdempotencyError {
    /// An in-flight claim goes away when its holder finishes, so retrying can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, IdempotencyError::InFlight { .. })
    }
}
