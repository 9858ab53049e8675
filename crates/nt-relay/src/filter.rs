//! Edge-triggered status filter
//!
//! An event passes only when the document's `status` moves *into*
//! `scraper_ok`. Steady-state updates where the status already was
//! `scraper_ok` are suppressed, so re-triggers that do not touch the status
//! never cause a second dispatch.

use nt_common::{string_field, ChangeEvent, STATUS_FIELD, TRIGGER_STATUS};

/// Why an event could not be evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    MissingNewFields,
    MissingOldFields,
    MissingDocumentId,
}

impl std::fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            MalformedReason::MissingNewFields => "missing value.fields",
            MalformedReason::MissingOldFields => "missing oldValue.fields",
            MalformedReason::MissingDocumentId => "subject has no document id",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision<'a> {
    /// Relevant transition; dispatch for this document
    Pass { doc_id: &'a str },
    /// Well-formed but not the transition we relay
    Skip {
        doc_id: &'a str,
        before: Option<&'a str>,
        after: Option<&'a str>,
    },
    /// Fail closed
    Malformed(MalformedReason),
}

pub fn evaluate(event: &ChangeEvent) -> FilterDecision<'_> {
    let Some(new_fields) = event.new_fields.as_ref() else {
        return FilterDecision::Malformed(MalformedReason::MissingNewFields);
    };
    let Some(old_fields) = event.old_fields.as_ref() else {
        return FilterDecision::Malformed(MalformedReason::MissingOldFields);
    };
    let Some(doc_id) = event.document_id() else {
        return FilterDecision::Malformed(MalformedReason::MissingDocumentId);
    };

    let after = string_field(new_fields, STATUS_FIELD);
    let before = string_field(old_fields, STATUS_FIELD);

    if is_trigger_transition(before, after) {
        FilterDecision::Pass { doc_id }
    } else {
        FilterDecision::Skip { doc_id, before, after }
    }
}

pub fn is_trigger_transition(before: Option<&str>, after: Option<&str>) -> bool {
    after == Some(TRIGGER_STATUS) && before != Some(TRIGGER_STATUS)
}
