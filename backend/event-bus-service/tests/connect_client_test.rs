//! Kafka Connect REST client against a local stub server

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use event_bus_service::config::ConnectConfig;
use event_bus_service::connector::{
    ConnectApi, ConnectorConfig, ConnectorManager, ConnectorSpec, ConnectorState, EnsureOutcome,
    KafkaConnectClient, RestartPolicy,
};
use event_bus_service::error::EventBusError;
use event_bus_service::metrics::ServiceMetrics;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

const NAME: &str = "pg-cdc";

#[derive(Default)]
struct ConnectStub {
    requests: Mutex<Vec<String>>,
    bodies: Mutex<Vec<Value>>,
    authorized: Mutex<Vec<bool>>,
    conflicts_left: Mutex<u32>,
}

impl ConnectStub {
    fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

fn stub_config() -> Value {
    json!({
        "connector.class": "io.debezium.connector.postgresql.PostgresConnector",
        "table.include.list": "public.forms",
        "name": NAME,
    })
}

async fn handle(req: HttpRequest, body: web::Bytes, stub: web::Data<ConnectStub>) -> HttpResponse {
    stub.requests
        .lock()
        .push(format!("{} {}", req.method(), req.uri()));
    stub.authorized
        .lock()
        .push(req.headers().contains_key("authorization"));
    if let Ok(value) = serde_json::from_slice::<Value>(&body) {
        stub.bodies.lock().push(value);
    }

    let not_found = || HttpResponse::NotFound().json(json!({"error_code": 404, "message": "Connector not found"}));
    match (req.method().as_str(), req.path()) {
        ("GET", "/") => HttpResponse::Ok().json(json!({"version": "3.6.0", "commit": "abc"})),
        ("GET", "/connectors") => HttpResponse::Ok().json(json!([NAME])),
        ("GET", "/connectors/pg-cdc/config") => HttpResponse::Ok().json(stub_config()),
        ("GET", "/connectors/pg-cdc/status") => {
            let mut conflicts = stub.conflicts_left.lock();
            if *conflicts > 0 {
                *conflicts -= 1;
                return HttpResponse::Conflict()
                    .json(json!({"error_code": 409, "message": "Cannot complete request because of a conflicting operation"}));
            }
            HttpResponse::Ok().json(json!({
                "name": NAME,
                "connector": {"state": "RUNNING", "worker_id": "10.0.0.4:8083"},
                "tasks": [{"id": 0, "state": "RUNNING", "worker_id": "10.0.0.4:8083"}],
                "type": "source"
            }))
        }
        ("POST", "/connectors") => HttpResponse::Created().json(json!({"name": "created"})),
        ("PUT", "/connectors/pg-cdc/config") => HttpResponse::Ok().json(stub_config()),
        ("POST", "/connectors/pg-cdc/restart") => HttpResponse::Accepted().finish(),
        ("PUT", "/connectors/pg-cdc/pause") | ("PUT", "/connectors/pg-cdc/resume") => {
            HttpResponse::Accepted().finish()
        }
        ("DELETE", "/connectors/pg-cdc") => HttpResponse::NoContent().finish(),
        _ => not_found(),
    }
}

async fn start_stub(stub: web::Data<ConnectStub>) -> String {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(stub.clone())
            .default_service(web::to(handle))
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .unwrap();
    let addr = server.addrs()[0];
    actix_rt::spawn(server.run());
    format!("http://{}", addr)
}

fn client_config(url: String) -> ConnectConfig {
    ConnectConfig {
        url,
        username: Some("connect".into()),
        password: Some("secret".into()),
        timeout_ms: 2_000,
        poll_interval_secs: 30,
        max_restarts: 3,
        restart_window_secs: 600,
        restart_backoff_initial_ms: 0,
        restart_backoff_max_ms: 0,
    }
}

async fn setup() -> (web::Data<ConnectStub>, KafkaConnectClient) {
    let stub = web::Data::new(ConnectStub::default());
    let url = start_stub(stub.clone()).await;
    let client = KafkaConnectClient::new(&client_config(url)).unwrap();
    (stub, client)
}

#[actix_web::test]
async fn test_status_and_config_round_trip() {
    let (stub, client) = setup().await;

    let status = client.status(NAME).await.unwrap();
    assert_eq!(status.connector.state, ConnectorState::Running);
    assert_eq!(status.tasks.len(), 1);

    let config = client.get_config(NAME).await.unwrap().unwrap();
    assert_eq!(config["table.include.list"], "public.forms");

    assert_eq!(client.get_config("missing").await.unwrap(), None);
    assert_eq!(client.list_connectors().await.unwrap(), vec![NAME.to_string()]);
    client.ping().await.unwrap();

    assert!(stub.authorized.lock().iter().all(|sent| *sent));
}

#[actix_web::test]
async fn test_missing_connector_status_is_not_found() {
    let (_stub, client) = setup().await;

    assert!(matches!(
        client.status("missing").await,
        Err(EventBusError::NotFound(_))
    ));
}

#[actix_web::test]
async fn test_lifecycle_requests() {
    let (stub, client) = setup().await;
    let config: ConnectorConfig = [("table.include.list".to_string(), "public.forms".to_string())]
        .into_iter()
        .collect();

    client.create_connector(NAME, &config).await.unwrap();
    client.update_config(NAME, &config).await.unwrap();
    client.pause(NAME).await.unwrap();
    client.resume(NAME).await.unwrap();
    client.restart(NAME).await.unwrap();
    client.delete(NAME).await.unwrap();

    assert_eq!(
        stub.requests(),
        vec![
            "POST /connectors",
            "PUT /connectors/pg-cdc/config",
            "PUT /connectors/pg-cdc/pause",
            "PUT /connectors/pg-cdc/resume",
            "POST /connectors/pg-cdc/restart?includeTasks=true&onlyFailed=true",
            "DELETE /connectors/pg-cdc",
        ]
    );

    let bodies = stub.bodies.lock().clone();
    assert_eq!(bodies[0]["name"], NAME);
    assert_eq!(bodies[0]["config"]["table.include.list"], "public.forms");
    assert_eq!(bodies[1]["table.include.list"], "public.forms");
}

#[actix_web::test]
async fn test_rebalance_conflict_is_retried() {
    let (stub, client) = setup().await;
    *stub.conflicts_left.lock() = 1;

    let status = client.status(NAME).await.unwrap();

    assert_eq!(status.connector.state, ConnectorState::Running);
    assert_eq!(
        stub.requests()
            .iter()
            .filter(|r| r.as_str() == "GET /connectors/pg-cdc/status")
            .count(),
        2
    );
}

#[actix_web::test]
async fn test_ensure_over_http_is_idempotent() {
    let (stub, client) = setup().await;
    let manager = ConnectorManager::new(
        Arc::new(client),
        RestartPolicy::default(),
        ServiceMetrics::new().unwrap().connectors,
    );
    let spec = ConnectorSpec::new(
        NAME,
        [
            (
                "connector.class".to_string(),
                "io.debezium.connector.postgresql.PostgresConnector".to_string(),
            ),
            ("table.include.list".to_string(), "public.forms".to_string()),
        ]
        .into_iter()
        .collect(),
    );

    assert_eq!(manager.ensure_connector(&spec).await.unwrap(), EnsureOutcome::Unchanged);
    assert_eq!(manager.ensure_connector(&spec).await.unwrap(), EnsureOutcome::Unchanged);
    assert!(stub
        .requests()
        .iter()
        .all(|r| r.starts_with("GET ")));
}
