//! API Endpoint Tests
//!
//! Tests for:
//! - CloudEvent ingress (binary and structured mode)
//! - Status mapping of relay outcomes
//! - Health endpoints (basic, liveness, readiness)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;

use nt_api::{create_router, AppState};
use nt_common::AuditStatus;
use nt_relay::{
    AuditBackend, AuditLogger, DispatchError, DispatchReceipt, Dispatcher, InMemoryAuditStore,
    RelayHandler, StaticTokenProvider,
};

/// Mock dispatcher that records calls and answers with a fixed status
struct MockDispatcher {
    calls: parking_lot::Mutex<Vec<String>>,
    status: u16,
}

impl MockDispatcher {
    fn new(status: u16) -> Self {
        Self {
            calls: parking_lot::Mutex::new(Vec::new()),
            status,
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Dispatcher for MockDispatcher {
    async fn dispatch(&self, doc_id: &str, _token: &str) -> Result<DispatchReceipt, DispatchError> {
        self.calls.lock().push(doc_id.to_string());
        let url = format!("http://nlp.test/process/web/{}", doc_id);
        if self.status >= 400 {
            return Err(DispatchError::Status {
                url,
                status: self.status,
                body: "{\"detail\":\"boom\"}".to_string(),
            });
        }
        Ok(DispatchReceipt {
            url,
            status: self.status,
            body: json!({"accepted": true}),
            elapsed: Duration::from_millis(5),
        })
    }
}

fn create_test_app(status: u16) -> (axum::Router, Arc<MockDispatcher>, Arc<InMemoryAuditStore>) {
    let store = Arc::new(InMemoryAuditStore::new());
    let dispatcher = Arc::new(MockDispatcher::new(status));
    let handler = RelayHandler::new(
        AuditBackend::Ready(AuditLogger::new(store.clone())),
        Arc::new(StaticTokenProvider::new("test-token")),
        dispatcher.clone(),
        "http://nlp.test",
    );

    let app = create_router(AppState {
        handler: Arc::new(handler),
        metrics: None,
    });

    (app, dispatcher, store)
}

fn unavailable_app() -> axum::Router {
    let handler = RelayHandler::new(
        AuditBackend::Unavailable("server selection timeout".to_string()),
        Arc::new(StaticTokenProvider::new("test-token")),
        Arc::new(MockDispatcher::new(200)),
        "http://nlp.test",
    );
    create_router(AppState {
        handler: Arc::new(handler),
        metrics: None,
    })
}

fn document_data(before: &str, after: &str) -> serde_json::Value {
    json!({
        "oldValue": { "fields": { "status": { "stringValue": before } } },
        "value": { "fields": { "status": { "stringValue": after } } }
    })
}

fn binary_event(doc_id: &str, data: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/")
        .header("content-type", "application/json")
        .header("ce-id", "evt-1")
        .header("ce-specversion", "1.0")
        .header("ce-type", "google.cloud.firestore.document.v1.updated")
        .header("ce-source", "//firestore.googleapis.com/projects/p/databases/(default)")
        .header("ce-subject", format!("documents/monitor_results/{}", doc_id))
        .body(Body::from(data.to_string()))
        .unwrap()
}

async fn get_body_json(body: Body) -> serde_json::Value {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// ============================================================================
// Event Ingress Tests
// ============================================================================

#[tokio::test]
async fn test_transition_is_dispatched() {
    let (app, dispatcher, store) = create_test_app(200);

    let response = app
        .oneshot(binary_event("doc-1", &document_data("pending", "scraper_ok")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["status"], "DISPATCHED");
    assert_eq!(json["doc_id"], "doc-1");
    assert!(json["run_id"].is_string());

    assert_eq!(dispatcher.call_count(), 1);
    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, AuditStatus::Success);
}

#[tokio::test]
async fn test_structured_mode_event() {
    let (app, dispatcher, _store) = create_test_app(200);

    let envelope = json!({
        "specversion": "1.0",
        "id": "evt-9",
        "type": "google.cloud.firestore.document.v1.updated",
        "source": "//firestore.googleapis.com/projects/p",
        "subject": "documents/monitor_results/doc-9",
        "data": document_data("pending", "scraper_ok")
    });
    let request = Request::builder()
        .method(Method::POST)
        .uri("/")
        .header("content-type", "application/cloudevents+json")
        .body(Body::from(envelope.to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(*dispatcher.calls.lock(), vec!["doc-9".to_string()]);
}

#[tokio::test]
async fn test_irrelevant_change_is_skipped() {
    let (app, dispatcher, store) = create_test_app(200);

    let response = app
        .oneshot(binary_event("doc-1", &document_data("scraper_ok", "scraper_ok")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["status"], "SKIPPED");
    assert_eq!(dispatcher.call_count(), 0);
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn test_malformed_data_is_skipped() {
    let (app, dispatcher, _store) = create_test_app(200);

    let response = app
        .oneshot(binary_event("doc-1", &json!({ "oldValue": {} })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["status"], "SKIPPED");
    assert_eq!(dispatcher.call_count(), 0);
}

#[tokio::test]
async fn test_dispatch_failure_returns_500() {
    let (app, _dispatcher, store) = create_test_app(500);

    let response = app
        .oneshot(binary_event("doc-1", &document_data("pending", "scraper_ok")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["status"], "FAILED");
    assert_eq!(json["reason"], "DISPATCH_ERROR");

    let records = store.records();
    assert_eq!(records[0].status, AuditStatus::Failed);
    assert_eq!(records[0].error_details.as_deref(), Some("{\"detail\":\"boom\"}"));
}

#[tokio::test]
async fn test_store_unavailable_is_acknowledged() {
    for data in [document_data("pending", "scraper_ok"), document_data("pending", "pending")] {
        let response = unavailable_app()
            .oneshot(binary_event("doc-1", &data))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = get_body_json(response.into_body()).await;
        assert_eq!(json["status"], "ABORTED");
        assert_eq!(json["error"], "server selection timeout");
    }
}

#[tokio::test]
async fn test_non_cloudevent_is_rejected() {
    let (app, dispatcher, store) = create_test_app(200);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/")
        .header("content-type", "application/json")
        .body(Body::from(document_data("pending", "scraper_ok").to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["status"], "REJECTED");
    assert_eq!(dispatcher.call_count(), 0);
    assert!(store.writes().is_empty());
}

// ============================================================================
// Health Endpoint Tests
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _, _) = create_test_app(200);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["status"], "UP");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_liveness_probe() {
    let (app, _, _) = create_test_app(200);

    let response = app
        .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["status"], "LIVE");
}

#[tokio::test]
async fn test_readiness_probe() {
    let (app, _, _) = create_test_app(200);

    let response = app
        .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["status"], "READY");
}

#[tokio::test]
async fn test_readiness_probe_without_store() {
    let response = unavailable_app()
        .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["status"], "NOT_READY");
}
