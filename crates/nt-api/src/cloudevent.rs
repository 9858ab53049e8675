//! CloudEvent extraction for the push ingress
//!
//! Binary mode carries attributes in `ce-*` headers with the JSON data as the
//! body. Structured mode carries the whole envelope as
//! `application/cloudevents+json`.

use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use nt_common::ChangeEvent;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";

#[derive(Error, Debug)]
pub enum CloudEventError {
    #[error("Missing CloudEvent attribute: {0}")]
    MissingAttribute(&'static str),

    #[error("Unreadable CloudEvent body: {0}")]
    InvalidBody(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloudEvent {
    pub id: String,
    pub source: Option<String>,
    pub event_type: Option<String>,
    pub subject: String,
    pub data: Value,
}

#[derive(Deserialize)]
struct StructuredEnvelope {
    id: Option<String>,
    source: Option<String>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    subject: Option<String>,
    #[serde(default)]
    data: Value,
}

impl CloudEvent {
    pub fn from_request(headers: &HeaderMap, body: &[u8]) -> Result<Self, CloudEventError> {
        let structured = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with(STRUCTURED_CONTENT_TYPE))
            .unwrap_or(false);

        if structured {
            Self::from_structured(body)
        } else {
            Self::from_binary(headers, body)
        }
    }

    fn from_structured(body: &[u8]) -> Result<Self, CloudEventError> {
        let envelope: StructuredEnvelope = serde_json::from_slice(body)
            .map_err(|e| CloudEventError::InvalidBody(e.to_string()))?;

        Ok(Self {
            id: envelope.id.ok_or(CloudEventError::MissingAttribute("id"))?,
            source: envelope.source,
            event_type: envelope.event_type,
            subject: envelope.subject.ok_or(CloudEventError::MissingAttribute("subject"))?,
            data: envelope.data,
        })
    }

    fn from_binary(headers: &HeaderMap, body: &[u8]) -> Result<Self, CloudEventError> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let id = header("ce-id").ok_or(CloudEventError::MissingAttribute("id"))?;
        let subject = header("ce-subject").ok_or(CloudEventError::MissingAttribute("subject"))?;

        let data = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(body).map_err(|e| CloudEventError::InvalidBody(e.to_string()))?
        };

        Ok(Self {
            id,
            source: header("ce-source"),
            event_type: header("ce-type"),
            subject,
            data,
        })
    }

    pub fn to_change_event(&self) -> ChangeEvent {
        ChangeEvent::from_document_event(self.subject.clone(), &self.data)
    }
}
