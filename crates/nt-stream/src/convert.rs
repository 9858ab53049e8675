//! Change-stream documents to relay change events

use mongodb::bson::{Bson, Document};
use nt_common::{ChangeEvent, FieldValue, Fields};

pub fn field_value_from_bson(value: &Bson) -> FieldValue {
    match value {
        Bson::Null | Bson::Undefined => FieldValue::Null,
        Bson::Boolean(b) => FieldValue::Boolean(*b),
        Bson::Int32(i) => FieldValue::Integer(i64::from(*i)),
        Bson::Int64(i) => FieldValue::Integer(*i),
        Bson::Double(d) => FieldValue::Double(*d),
        Bson::String(s) => FieldValue::String(s.clone()),
        Bson::DateTime(dt) => FieldValue::Timestamp(
            dt.try_to_rfc3339_string().unwrap_or_else(|_| dt.to_string()),
        ),
        Bson::Document(d) => FieldValue::Map(fields_from_document(d)),
        Bson::Array(items) => FieldValue::Array(items.iter().map(field_value_from_bson).collect()),
        other => FieldValue::Other(other.clone().into_relaxed_extjson()),
    }
}

pub fn fields_from_document(document: &Document) -> Fields {
    document
        .iter()
        .map(|(key, value)| (key.clone(), field_value_from_bson(value)))
        .collect()
}

fn document_id(document_key: &Document) -> Option<String> {
    match document_key.get("_id")? {
        Bson::String(s) => Some(s.clone()),
        Bson::ObjectId(oid) => Some(oid.to_hex()),
        Bson::Int32(i) => Some(i.to_string()),
        Bson::Int64(i) => Some(i.to_string()),
        other => Some(other.to_string()),
    }
}

/// Build a change event from the pieces of a change-stream event.
///
/// The subject mirrors a document resource path,
/// `databases/{db}/documents/{collection}/{id}`. A missing pre-image leaves
/// `old_fields` empty, which the filter treats as malformed.
pub fn change_event_from_stream(
    database: &str,
    collection: &str,
    document_key: Option<&Document>,
    full_document: Option<&Document>,
    before_change: Option<&Document>,
) -> Option<ChangeEvent> {
    let id = document_key.and_then(document_id)?;
    let subject = format!("databases/{}/documents/{}/{}", database, collection, id);

    Some(ChangeEvent::new(
        subject,
        full_document.map(fields_from_document),
        before_change.map(fields_from_document),
    ))
}
