//! Relay Handler
//!
//! Runs one invocation: filter -> audit begin -> token -> dispatch -> audit finish.
//! Long-lived collaborators are injected at construction and shared read-only
//! across invocations.

use std::sync::Arc;

use nt_common::ChangeEvent;
use tracing::{error, info, warn};

use crate::audit::{AuditLogger, Scoped};
use crate::dispatcher::{DispatchReceipt, Dispatcher};
use crate::error::{RelayError, Result};
use crate::filter::{self, FilterDecision, MalformedReason};
use crate::token::TokenProvider;

/// Audit store state fixed at process startup
#[derive(Clone)]
pub enum AuditBackend {
    Ready(AuditLogger),
    /// The store client could not be initialized; every invocation aborts
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotRelevant {
        before: Option<String>,
        after: Option<String>,
    },
    Malformed(MalformedReason),
}

#[derive(Debug, Clone)]
pub enum HandleOutcome {
    Skipped(SkipReason),
    /// The audit store never came up; nothing was filtered, audited or sent
    StoreUnavailable { reason: String },
    Dispatched {
        doc_id: String,
        run_id: String,
        receipt: DispatchReceipt,
    },
}

impl HandleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            HandleOutcome::Skipped(SkipReason::NotRelevant { .. }) => "skipped",
            HandleOutcome::Skipped(SkipReason::Malformed(_)) => "malformed",
            HandleOutcome::StoreUnavailable { .. } => "store_unavailable",
            HandleOutcome::Dispatched { .. } => "dispatched",
        }
    }
}

pub struct RelayHandler {
    audit: AuditBackend,
    tokens: Arc<dyn TokenProvider>,
    dispatcher: Arc<dyn Dispatcher>,
    /// Audience of issued tokens: the NLP service base URL
    audience: String,
}

impl RelayHandler {
    pub fn new(
        audit: AuditBackend,
        tokens: Arc<dyn TokenProvider>,
        dispatcher: Arc<dyn Dispatcher>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            audit,
            tokens,
            dispatcher,
            audience: audience.into(),
        }
    }

    pub async fn handle(&self, event: &ChangeEvent) -> Result<HandleOutcome> {
        let result = self.handle_inner(event).await;

        let outcome = match &result {
            Ok(outcome) => outcome.label(),
            Err(_) => "failed",
        };
        metrics::counter!("nt_events_total", "outcome" => outcome).increment(1);

        result
    }

    async fn handle_inner(&self, event: &ChangeEvent) -> Result<HandleOutcome> {
        let logger = match &self.audit {
            AuditBackend::Ready(logger) => logger,
            AuditBackend::Unavailable(reason) => {
                error!(subject = %event.subject, reason = %reason, "CRITICAL: audit store is not available, invocation aborted");
                return Ok(HandleOutcome::StoreUnavailable {
                    reason: reason.clone(),
                });
            }
        };

        let doc_id = match filter::evaluate(event) {
            FilterDecision::Pass { doc_id } => doc_id,
            FilterDecision::Skip { doc_id, before, after } => {
                info!(
                    doc_id = %doc_id,
                    before = ?before,
                    after = ?after,
                    "Event ignored, status change not relevant"
                );
                return Ok(HandleOutcome::Skipped(SkipReason::NotRelevant {
                    before: before.map(str::to_string),
                    after: after.map(str::to_string),
                }));
            }
            FilterDecision::Malformed(reason) => {
                warn!(subject = %event.subject, reason = %reason, "Status fields not found in event, ignoring");
                return Ok(HandleOutcome::Skipped(SkipReason::Malformed(reason)));
            }
        };

        info!(doc_id = %doc_id, "Trigger status detected, invoking NLP API");

        let result = logger.scope(doc_id, || self.invoke(doc_id)).await;
        match result {
            Ok(Scoped { run_id, value: receipt }) => {
                metrics::histogram!("nt_dispatch_duration_seconds").record(receipt.elapsed.as_secs_f64());
                Ok(HandleOutcome::Dispatched {
                    doc_id: doc_id.to_string(),
                    run_id,
                    receipt,
                })
            }
            Err(e) => {
                match &e {
                    RelayError::Auth(_) | RelayError::Dispatch(_) | RelayError::Store(_) => {
                        error!(doc_id = %doc_id, kind = e.kind(), error = %e, "Invocation failed");
                    }
                    _ => {
                        error!(doc_id = %doc_id, kind = e.kind(), error = ?e, "Invocation failed unexpectedly");
                    }
                }
                Err(e)
            }
        }
    }

    async fn invoke(&self, doc_id: &str) -> Result<DispatchReceipt> {
        let token = self.tokens.fetch_token(&self.audience).await?;
        let receipt = self.dispatcher.dispatch(doc_id, &token).await?;
        Ok(receipt)
    }

    /// Readiness: the audit store is initialized and reachable
    pub async fn check_ready(&self) -> Result<()> {
        match &self.audit {
            AuditBackend::Ready(logger) => Ok(logger.store().ping().await?),
            AuditBackend::Unavailable(reason) => Err(RelayError::StoreUnavailable(reason.clone())),
        }
    }
}
