//! Event bus service
//!
//! Publishes application events, supervises the Debezium CDC connector and
//! runs the processing pipeline over the resulting Kafka topics.

pub mod config;
pub mod connector;
pub mod error;
pub mod events;
pub mod handlers;
pub mod kafka;
pub mod lifecycle;
pub mod metrics;
pub mod pipeline;

pub use config::Config;
pub use error::{EventBusError, Result};
