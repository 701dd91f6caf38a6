use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use event_bus_service::handlers::{self, AppState};
use event_bus_service::lifecycle::{shutdown_signal, Orchestrator};
use event_bus_service::metrics::ServiceMetrics;
use event_bus_service::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Multi-threaded: the rebalance callback blocks its thread while partition
// workers drain.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,event_bus_service=debug,rdkafka=warn".into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer()))
        .init();

    tracing::info!("Starting event-bus-service v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env().context("Failed to load configuration")?;
    let metrics = ServiceMetrics::new().context("Failed to register metrics")?;

    let mut orchestrator =
        Orchestrator::new(config.clone(), metrics.clone()).context("Failed to build clients")?;
    orchestrator
        .start()
        .await
        .context("Failed to start event bus")?;

    let state = AppState {
        publisher: orchestrator.publisher(),
        health: orchestrator.health(),
        connectors: Some(orchestrator.connectors()),
        metrics,
    };

    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Starting HTTP server at {}", bind_address);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(tracing_actix_web::TracingLogger::default())
            .configure(handlers::configure)
    })
    .bind(&bind_address)
    .with_context(|| format!("Failed to bind HTTP server to {}", bind_address))?
    .shutdown_timeout(config.server.shutdown_timeout_secs)
    .disable_signals()
    .run();
    let server_handle = server.handle();

    let shutdown = shutdown_signal();
    tokio::pin!(server);
    tokio::pin!(shutdown);

    let mut server_error = None;
    tokio::select! {
        result = &mut server => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
                server_error = Some(e);
            }
        }
        _ = &mut shutdown => {
            tracing::info!("Shutdown signal received");
            server_handle.stop(true).await;
        }
    }

    orchestrator.shutdown().await;
    tracing::info!("event-bus-service shut down");

    match server_error {
        Some(e) => Err(e).context("HTTP server failed"),
        None => Ok(()),
    }
}
