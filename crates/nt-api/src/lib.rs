//! NLP Trigger API
//!
//! HTTP endpoints for:
//! - CloudEvent ingress (push delivery of document changes)
//! - Health and Kubernetes probes (liveness/readiness)
//! - Prometheus metrics

pub mod cloudevent;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use nt_relay::{HandleOutcome, RelayHandler, SkipReason};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

pub use cloudevent::{CloudEvent, CloudEventError};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<RelayHandler>,
    pub metrics: Option<PrometheusHandle>,
}

/// Simple health response for basic health check
#[derive(Serialize)]
pub struct SimpleHealthResponse {
    /// Health status: UP
    pub status: String,
    /// Application version
    pub version: String,
}

/// Kubernetes probe response
#[derive(Serialize)]
pub struct ProbeResponse {
    /// Probe status: LIVE, READY, NOT_READY
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Result of one event delivery
#[derive(Debug, Serialize)]
pub struct EventResponse {
    /// DISPATCHED, SKIPPED, ABORTED, FAILED or REJECTED
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EventResponse {
    fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
            doc_id: None,
            run_id: None,
            reason: None,
            error: None,
        }
    }
}

/// Create the router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Event ingress
        .route("/", post(receive_event))
        // Basic health
        .route("/health", get(health_handler))
        // Kubernetes probes
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        // Prometheus metrics
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn receive_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let event = match CloudEvent::from_request(&headers, &body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Rejected request that is not a CloudEvent");
            let mut response = EventResponse::new("REJECTED");
            response.error = Some(e.to_string());
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    debug!(event_id = %event.id, subject = %event.subject, "CloudEvent received");

    match state.handler.handle(&event.to_change_event()).await {
        Ok(HandleOutcome::Dispatched { doc_id, run_id, receipt }) => {
            let mut response = EventResponse::new("DISPATCHED");
            response.doc_id = Some(doc_id);
            response.run_id = Some(run_id);
            response.reason = Some(format!("NLP API responded with status {}", receipt.status));
            (StatusCode::OK, Json(response)).into_response()
        }
        Ok(HandleOutcome::Skipped(reason)) => {
            let mut response = EventResponse::new("SKIPPED");
            response.reason = Some(match reason {
                SkipReason::NotRelevant { .. } => "status change not relevant".to_string(),
                SkipReason::Malformed(reason) => reason.to_string(),
            });
            (StatusCode::OK, Json(response)).into_response()
        }
        // Acknowledged so the event source does not redeliver every update while
        // the store is down; readiness reports the outage instead
        Ok(HandleOutcome::StoreUnavailable { reason }) => {
            let mut response = EventResponse::new("ABORTED");
            response.reason = Some("audit store unavailable".to_string());
            response.error = Some(reason);
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            let mut response = EventResponse::new("FAILED");
            response.reason = Some(e.kind().to_string());
            response.error = Some(e.to_string());
            (StatusCode::INTERNAL_SERVER_ERROR, Json(response)).into_response()
        }
    }
}

async fn health_handler() -> Json<SimpleHealthResponse> {
    Json(SimpleHealthResponse {
        status: "UP".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn liveness_probe() -> Json<ProbeResponse> {
    Json(ProbeResponse {
        status: "LIVE".to_string(),
        reason: None,
    })
}

async fn readiness_probe(State(state): State<AppState>) -> (StatusCode, Json<ProbeResponse>) {
    match state.handler.check_ready().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ProbeResponse {
                status: "READY".to_string(),
                reason: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeResponse {
                status: "NOT_READY".to_string(),
                reason: Some(e.to_string()),
            }),
        ),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}
