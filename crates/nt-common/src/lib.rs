use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Module name written into every audit record
pub const MODULE_NAME: &str = "trigger-nlp-web";

/// Document status that triggers an NLP invocation
pub const TRIGGER_STATUS: &str = "scraper_ok";

/// Recorded as error details when a dispatch failed without any HTTP response
pub const NO_RESPONSE_MARKER: &str = "No response from server";

/// Name of the status field inspected on both document snapshots
pub const STATUS_FIELD: &str = "status";

// ============================================================================
// Document Field Values
// ============================================================================

/// Fields of a document snapshot, keyed by field name
pub type Fields = BTreeMap<String, FieldValue>;

/// A typed field value as delivered by the document store.
///
/// The wire form is the store's wrapper object with a single key naming the
/// type, e.g. `{"stringValue": "scraper_ok"}` or `{"integerValue": "42"}`.
/// Wrappers this crate does not model are kept verbatim in [`FieldValue::Other`].
#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Timestamp(String),
    Map(Fields),
    Array(Vec<FieldValue>),
    Other(serde_json::Value),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        let wrapper = match &value {
            Value::Object(map) if map.len() == 1 => {
                map.iter().next().map(|(kind, inner)| (kind.clone(), inner.clone()))
            }
            _ => None,
        };
        let Some((kind, inner)) = wrapper else {
            return FieldValue::Other(value);
        };

        let parsed = match (kind.as_str(), &inner) {
            ("nullValue", _) => Some(FieldValue::Null),
            ("booleanValue", Value::Bool(b)) => Some(FieldValue::Boolean(*b)),
            // 64-bit integers arrive as decimal strings
            ("integerValue", Value::String(s)) => s.parse().ok().map(FieldValue::Integer),
            ("integerValue", Value::Number(n)) => n.as_i64().map(FieldValue::Integer),
            ("doubleValue", Value::Number(n)) => n.as_f64().map(FieldValue::Double),
            ("stringValue", Value::String(s)) => Some(FieldValue::String(s.clone())),
            ("timestampValue", Value::String(s)) => Some(FieldValue::Timestamp(s.clone())),
            ("mapValue", Value::Object(m)) => {
                let fields = match m.get("fields") {
                    Some(Value::Object(f)) => f
                        .iter()
                        .map(|(k, v)| (k.clone(), FieldValue::from(v.clone())))
                        .collect(),
                    _ => Fields::new(),
                };
                Some(FieldValue::Map(fields))
            }
            ("arrayValue", Value::Object(a)) => {
                let values = match a.get("values") {
                    Some(Value::Array(items)) => items.iter().cloned().map(FieldValue::from).collect(),
                    _ => Vec::new(),
                };
                Some(FieldValue::Array(values))
            }
            _ => None,
        };

        parsed.unwrap_or(FieldValue::Other(value))
    }
}

impl From<FieldValue> for serde_json::Value {
    fn from(value: FieldValue) -> Self {
        use serde_json::json;

        match value {
            FieldValue::Null => json!({ "nullValue": null }),
            FieldValue::Boolean(b) => json!({ "booleanValue": b }),
            FieldValue::Integer(i) => json!({ "integerValue": i.to_string() }),
            FieldValue::Double(d) => json!({ "doubleValue": d }),
            FieldValue::String(s) => json!({ "stringValue": s }),
            FieldValue::Timestamp(t) => json!({ "timestampValue": t }),
            FieldValue::Map(fields) => {
                let fields: serde_json::Map<String, serde_json::Value> = fields
                    .into_iter()
                    .map(|(k, v)| (k, v.into()))
                    .collect();
                json!({ "mapValue": { "fields": fields } })
            }
            FieldValue::Array(values) => {
                let values: Vec<serde_json::Value> = values.into_iter().map(Into::into).collect();
                json!({ "arrayValue": { "values": values } })
            }
            FieldValue::Other(raw) => raw,
        }
    }
}

/// Read a string-typed field. Missing fields and non-string values yield `None`.
pub fn string_field<'a>(fields: &'a Fields, name: &str) -> Option<&'a str> {
    fields.get(name).and_then(FieldValue::as_str)
}

// ============================================================================
// Change Events
// ============================================================================

/// A single document change, alive only for one invocation.
///
/// `new_fields`/`old_fields` are `None` when the trigger payload did not carry
/// a readable field structure for that side.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Resource path of the changed document; its last segment is the document id
    pub subject: String,
    pub new_fields: Option<Fields>,
    pub old_fields: Option<Fields>,
}

impl ChangeEvent {
    pub fn new(subject: impl Into<String>, new_fields: Option<Fields>, old_fields: Option<Fields>) -> Self {
        Self {
            subject: subject.into(),
            new_fields,
            old_fields,
        }
    }

    /// Build an event from a document-store event payload of the form
    /// `{"oldValue": {"fields": {..}}, "value": {"fields": {..}}}`.
    pub fn from_document_event(subject: impl Into<String>, data: &serde_json::Value) -> Self {
        Self {
            subject: subject.into(),
            new_fields: snapshot_fields(data, "value"),
            old_fields: snapshot_fields(data, "oldValue"),
        }
    }

    /// Last path segment of the subject, if non-empty
    pub fn document_id(&self) -> Option<&str> {
        self.subject
            .rsplit('/')
            .next()
            .filter(|id| !id.is_empty())
    }
}

fn snapshot_fields(data: &serde_json::Value, side: &str) -> Option<Fields> {
    let fields = data.get(side)?.get("fields")?;
    serde_json::from_value(fields.clone()).ok()
}

// ============================================================================
// Audit Records
// ============================================================================

/// Lifecycle status of an audit record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Processing,
    Success,
    Failed,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Processing => "processing",
            AuditStatus::Success => "success",
            AuditStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AuditStatus::Success | AuditStatus::Failed)
    }

    /// Only `processing -> success|failed` is allowed
    pub fn can_transition_to(&self, next: AuditStatus) -> bool {
        *self == AuditStatus::Processing && next.is_terminal()
    }
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid audit status transition: {from} -> {to}")]
pub struct AuditTransitionError {
    pub from: AuditStatus,
    pub to: AuditStatus,
}

/// Persisted record of one relay invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub run_id: String,
    pub module: String,
    pub target_doc_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: AuditStatus,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

impl AuditRecord {
    /// A fresh `processing` record for the given document
    pub fn begin(doc_id: impl Into<String>) -> Self {
        let target_doc_id = doc_id.into();
        let details = format!(
            "Status \"{}\" detected. Starting NLP API invocation for document: {}",
            TRIGGER_STATUS, target_doc_id
        );

        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            module: MODULE_NAME.to_string(),
            target_doc_id,
            start_time: Utc::now(),
            end_time: None,
            status: AuditStatus::Processing,
            details,
            error_details: None,
        }
    }

    /// Move the record to a terminal status and stamp `end_time`
    pub fn complete(
        &mut self,
        status: AuditStatus,
        details: impl Into<String>,
        error_details: Option<String>,
    ) -> Result<(), AuditTransitionError> {
        if !self.status.can_transition_to(status) {
            return Err(AuditTransitionError { from: self.status, to: status });
        }

        self.status = status;
        self.details = details.into();
        self.error_details = error_details;
        self.end_time = Some(Utc::now());
        Ok(())
    }

    pub fn elapsed(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}
