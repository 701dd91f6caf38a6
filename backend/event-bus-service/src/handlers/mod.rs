//! HTTP surface

pub mod connectors;
pub mod events;
pub mod health;

use actix_web::web;
use std::sync::Arc;

use crate::connector::ConnectorManager;
use crate::error::EventBusError;
use crate::kafka::EventPublisher;
use crate::lifecycle::HealthState;
use crate::metrics::ServiceMetrics;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<dyn EventPublisher>,
    pub health: HealthState,
    /// `None` when connector supervision is disabled
    pub connectors: Option<Arc<ConnectorManager>>,
    pub metrics: ServiceMetrics,
}

/// Register every route
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _req| {
        EventBusError::Validation(format!("Invalid JSON body: {}", err)).into()
    }))
    .route("/health", web::get().to(health::health_check))
    .route("/ready", web::get().to(health::readiness_check))
    .route("/live", web::get().to(health::liveness_check))
    .route("/metrics", web::get().to(health::metrics))
    .route("/version", web::get().to(health::version))
    .service(
        web::scope("/events")
            .route("", web::post().to(events::publish_event))
            .route("/batch", web::post().to(events::publish_batch)),
    )
    .service(
        web::scope("/connectors")
            .route("", web::get().to(connectors::list_connectors))
            .route("/{name}", web::get().to(connectors::get_connector))
            .route("/{name}/restart", web::post().to(connectors::restart_connector))
            .route("/{name}/pause", web::post().to(connectors::pause_connector))
            .route("/{name}/resume", web::post().to(connectors::resume_connector)),
    );
}
