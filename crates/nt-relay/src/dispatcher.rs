//! HTTP Dispatcher for the NLP API
//!
//! One authenticated `POST {base}/process/web/{doc_id}` per invocation.
//! There is no retry here: redelivery belongs to the event source.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use nt_config::DispatchConfig;
use tracing::{debug, info};

use crate::audit::AuditSummary;
use crate::error::DispatchError;

/// HTTP dispatcher configuration
#[derive(Debug, Clone)]
pub struct HttpDispatcherConfig {
    /// NLP service base URL
    pub base_url: String,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Request timeout
    pub request_timeout: Duration,
}

impl HttpDispatcherConfig {
    pub fn new(base_url: impl Into<String>, dispatch: &DispatchConfig) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: Duration::from_secs(dispatch.connect_timeout_secs),
            request_timeout: Duration::from_secs(dispatch.request_timeout_secs),
        }
    }
}

impl Default for HttpDispatcherConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Successful NLP invocation
#[derive(Debug, Clone)]
pub struct DispatchReceipt {
    pub url: String,
    pub status: u16,
    pub body: serde_json::Value,
    pub elapsed: Duration,
}

impl AuditSummary for DispatchReceipt {
    fn audit_details(&self) -> String {
        format!("NLP API invoked successfully. Response status: {}.", self.status)
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, doc_id: &str, token: &str) -> Result<DispatchReceipt, DispatchError>;
}

pub struct HttpDispatcher {
    config: HttpDispatcherConfig,
    client: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new(config: HttpDispatcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { config, client })
    }

    pub fn target_url(&self, doc_id: &str) -> String {
        format!("{}/process/web/{}", self.config.base_url.trim_end_matches('/'), doc_id)
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, doc_id: &str, token: &str) -> Result<DispatchReceipt, DispatchError> {
        let url = self.target_url(doc_id);
        info!(doc_id = %doc_id, url = %url, "Invoking NLP API");

        let started = Instant::now();
        let response = self.client
            .post(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                let timed_out = e.is_timeout();
                debug!(url = %url, timed_out, error = %e, "NLP request failed without a response");
                DispatchError::Transport {
                    url: url.clone(),
                    message: e.to_string(),
                    timed_out,
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(url = %url, status = %status, body = %body, "NLP API returned an error status");
            return Err(DispatchError::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await.map_err(|e| DispatchError::Transport {
            url: url.clone(),
            message: format!("failed to read response body: {}", e),
            timed_out: e.is_timeout(),
        })?;

        let body: serde_json::Value = serde_json::from_str(&text).map_err(|e| DispatchError::InvalidBody {
            url: url.clone(),
            status: status.as_u16(),
            body: text.clone(),
            message: e.to_string(),
        })?;

        let elapsed = started.elapsed();
        debug!(url = %url, elapsed_ms = elapsed.as_millis() as u64, "NLP API responded");
        info!(doc_id = %doc_id, status = status.as_u16(), response = %body, "NLP API invoked successfully");

        Ok(DispatchReceipt {
            url,
            status: status.as_u16(),
            body,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nt_common::NO_RESPONSE_MARKER;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dispatcher(base_url: &str, timeout: Duration) -> HttpDispatcher {
        HttpDispatcher::new(HttpDispatcherConfig {
            base_url: base_url.to_string(),
            connect_timeout: Duration::from_secs(2),
            request_timeout: timeout,
        })
        .unwrap()
    }

    #[test]
    fn test_target_url_trims_trailing_slash() {
        let d = dispatcher("https://nlp.example.com/", Duration::from_secs(1));
        assert_eq!(d.target_url("abc"), "https://nlp.example.com/process/web/abc");
    }

    #[test]
    fn test_config_from_dispatch_settings() {
        let config = HttpDispatcherConfig::new("https://nlp.example.com", &DispatchConfig::default());
        assert_eq!(config.request_timeout, Duration::from_secs(300));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_success_captures_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/process/web/doc-1"))
            .and(header("Authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({"queued": true})))
            .expect(1)
            .mount(&server)
            .await;

        let receipt = dispatcher(&server.uri(), Duration::from_secs(5))
            .dispatch("doc-1", "tok")
            .await
            .unwrap();

        assert_eq!(receipt.status, 202);
        assert_eq!(receipt.body["queued"], true);
        assert_eq!(receipt.audit_details(), "NLP API invoked successfully. Response status: 202.");
    }

    #[tokio::test]
    async fn test_error_status_keeps_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/process/web/doc-1"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
            .mount(&server)
            .await;

        let err = dispatcher(&server.uri(), Duration::from_secs(5))
            .dispatch("doc-1", "tok")
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Status { status: 500, .. }));
        assert_eq!(err.error_details(), "model crashed");
    }

    #[tokio::test]
    async fn test_timeout_has_no_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let err = dispatcher(&server.uri(), Duration::from_millis(200))
            .dispatch("doc-1", "tok")
            .await
            .unwrap_err();

        match &err {
            DispatchError::Transport { timed_out, .. } => assert!(*timed_out),
            other => panic!("expected transport error, got {:?}", other),
        }
        assert_eq!(err.error_details(), NO_RESPONSE_MARKER);
    }

    #[tokio::test]
    async fn test_non_json_success_body_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .mount(&server)
            .await;

        let err = dispatcher(&server.uri(), Duration::from_secs(5))
            .dispatch("doc-1", "tok")
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::InvalidBody { status: 200, .. }));
        assert_eq!(err.error_details(), "<html>ok</html>");
    }
}
