/// Connector operations - inspection and manual intervention
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::connector::ConnectorManager;
use crate::error::{EventBusError, Result};
use crate::handlers::AppState;

fn manager(state: &AppState) -> Result<&Arc<ConnectorManager>> {
    state
        .connectors
        .as_ref()
        .ok_or_else(|| EventBusError::NotFound("connector supervision is disabled".into()))
}

/// GET /connectors
pub async fn list_connectors(state: web::Data<AppState>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(manager(&state)?.connectors()))
}

/// GET /connectors/{name}
pub async fn get_connector(
    state: web::Data<AppState>,
    name: web::Path<String>,
) -> Result<HttpResponse> {
    let report = manager(&state)?
        .connector(&name)
        .ok_or_else(|| EventBusError::NotFound(format!("connector {}", name)))?;
    Ok(HttpResponse::Ok().json(report))
}

/// POST /connectors/{name}/restart
///
/// Manual intervention: clears a given-up connector and restarts it with its tasks.
pub async fn restart_connector(
    state: web::Data<AppState>,
    name: web::Path<String>,
) -> Result<HttpResponse> {
    let report = manager(&state)?.restart_connector(&name).await?;
    info!(connector = %name, "Connector restarted by operator");
    Ok(HttpResponse::Ok().json(report))
}

/// POST /connectors/{name}/pause
pub async fn pause_connector(
    state: web::Data<AppState>,
    name: web::Path<String>,
) -> Result<HttpResponse> {
    manager(&state)?.pause_connector(&name).await?;
    info!(connector = %name, "Connector paused by operator");
    Ok(HttpResponse::Ok().json(json!({"connector": name.as_str(), "status": "paused"})))
}

/// POST /connectors/{name}/resume
pub async fn resume_connector(
    state: web::Data<AppState>,
    name: web::Path<String>,
) -> Result<HttpResponse> {
    manager(&state)?.resume_connector(&name).await?;
    info!(connector = %name, "Connector resumed by operator");
    Ok(HttpResponse::Ok().json(json!({"connector": name.as_str(), "status": "resumed"})))
}
