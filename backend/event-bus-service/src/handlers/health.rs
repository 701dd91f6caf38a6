use actix_web::{web, HttpResponse, Responder};
use serde_json::json;

use crate::handlers::AppState;

/// GET /health: 200 when every component is healthy, 503 with the same body otherwise
pub async fn health_check(state: web::Data<AppState>) -> impl Responder {
    let report = state.health.report();
    if report.is_healthy() {
        HttpResponse::Ok().json(report)
    } else {
        HttpResponse::ServiceUnavailable().json(report)
    }
}

/// GET /ready
pub async fn readiness_check(state: web::Data<AppState>) -> impl Responder {
    let report = state.health.report();
    let body = json!({
        "ready": report.is_healthy(),
        "status": report.status,
        "timestamp": report.timestamp,
    });

    if report.is_healthy() {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

pub async fn liveness_check() -> impl Responder {
    HttpResponse::Ok().json(json!({"alive": true}))
}

/// GET /metrics in the Prometheus text format
pub async fn metrics(state: web::Data<AppState>) -> HttpResponse {
    match state.metrics.render() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => {
            tracing::error!("Failed to render metrics: {}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

pub async fn version() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
