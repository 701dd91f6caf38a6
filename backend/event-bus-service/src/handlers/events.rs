/// Event publishing handlers - synchronous publish through the broker client
use actix_web::{web, HttpResponse};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{error, info};

use crate::error::{EventBusError, Result};
use crate::events::EventEnvelope;
use crate::handlers::AppState;

pub const MAX_BATCH_SIZE: usize = 1000;

const HTTP_SOURCE_HEADER: &str = "ingress";

#[derive(Debug, Clone, Deserialize)]
pub struct PublishEventRequest {
    pub event_type: Option<String>,
    pub source: Option<String>,
    pub data: Option<Value>,
    pub topic: Option<String>,
    pub key: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub correlation_id: Option<String>,
}

impl PublishEventRequest {
    pub fn into_envelope(self) -> Result<EventEnvelope> {
        let event_type = required(self.event_type, "event_type")?;
        let source = required(self.source, "source")?;
        let data = match self.data {
            Some(Value::Object(map)) => map,
            Some(_) => return Err(EventBusError::Validation("data must be a JSON object".into())),
            None => return Err(EventBusError::Validation("data is required".into())),
        };

        let mut builder = EventEnvelope::builder(event_type, source)
            .data(data)
            .maybe_topic(self.topic.filter(|t| !t.trim().is_empty()))
            .maybe_key(self.key)
            .headers(self.headers)
            .header(HTTP_SOURCE_HEADER, "http");
        if let Some(correlation_id) = self.correlation_id {
            builder = builder.correlation_id(correlation_id);
        }
        builder.build()
    }
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| EventBusError::Validation(format!("{} is required", field)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishEventResponse {
    pub event_id: String,
    pub topic: String,
    pub status: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct PublishBatchRequest {
    pub events: Vec<PublishEventRequest>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub index: usize,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishBatchResponse {
    pub total: usize,
    pub published: usize,
    pub failed: usize,
    pub results: Vec<BatchItemResult>,
}

/// POST /events
pub async fn publish_event(
    state: web::Data<AppState>,
    req: web::Json<PublishEventRequest>,
) -> Result<HttpResponse> {
    let envelope = req.into_inner().into_envelope()?;

    let receipt = state.publisher.publish(&envelope).await.map_err(|e| {
        error!(event_id = %envelope.id, topic = %envelope.topic, "Publish failed: {}", e);
        e
    })?;

    info!(
        event_id = %envelope.id,
        event_type = %envelope.event_type,
        topic = %receipt.topic,
        partition = receipt.partition,
        offset = receipt.offset,
        "Event published"
    );

    Ok(HttpResponse::Ok().json(PublishEventResponse {
        event_id: envelope.id,
        topic: receipt.topic,
        status: "published".to_string(),
        partition: receipt.partition,
        offset: receipt.offset,
    }))
}

/// POST /events/batch
///
/// 200 when every event was published, 206 on partial success, 500 when
/// nothing was published.
pub async fn publish_batch(
    state: web::Data<AppState>,
    req: web::Json<PublishBatchRequest>,
) -> Result<HttpResponse> {
    let events = req.into_inner().events;
    if events.is_empty() {
        return Err(EventBusError::Validation("events must not be empty".into()));
    }
    if events.len() > MAX_BATCH_SIZE {
        return Err(EventBusError::Validation(format!(
            "batch of {} exceeds the limit of {} events",
            events.len(),
            MAX_BATCH_SIZE
        )));
    }

    let publisher = &state.publisher;
    let results = join_all(events.into_iter().enumerate().map(|(index, event)| async move {
        let outcome = match event.into_envelope() {
            Ok(envelope) => publisher
                .publish(&envelope)
                .await
                .map(|receipt| (envelope.id, receipt.topic)),
            Err(e) => Err(e),
        };
        match outcome {
            Ok((event_id, topic)) => BatchItemResult {
                index,
                status: "published".to_string(),
                event_id: Some(event_id),
                topic: Some(topic),
                error: None,
            },
            Err(e) => BatchItemResult {
                index,
                status: "failed".to_string(),
                event_id: None,
                topic: None,
                error: Some(e.to_string()),
            },
        }
    }))
    .await;

    let total = results.len();
    let published = results.iter().filter(|r| r.status == "published").count();
    let failed = total - published;
    info!(total, published, failed, "Batch published");

    let body = PublishBatchResponse {
        total,
        published,
        failed,
        results,
    };
    let response = if failed == 0 {
        HttpResponse::Ok().json(body)
    } else if published > 0 {
        HttpResponse::PartialContent().json(body)
    } else {
        HttpResponse::InternalServerError().json(body)
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: Value) -> PublishEventRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_envelope_defaults_to_app_topic() {
        let envelope = request(json!({
            "event_type": "form.created",
            "source": "form-service",
            "data": {"form_id": "f1"}
        }))
        .into_envelope()
        .unwrap();

        assert_eq!(envelope.topic, "app.form.created");
        assert_eq!(envelope.headers.get(HTTP_SOURCE_HEADER).map(String::as_str), Some("http"));
    }

    #[test]
    fn test_missing_fields_are_validation_errors() {
        for body in [
            json!({"source": "s", "data": {}}),
            json!({"event_type": "a.b", "data": {}}),
            json!({"event_type": "a.b", "source": "s"}),
            json!({"event_type": "a.b", "source": "s", "data": [1]}),
        ] {
            let err = request(body).into_envelope().unwrap_err();
            assert!(matches!(err, EventBusError::Validation(_)), "{:?}", err);
        }
    }
}
