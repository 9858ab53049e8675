//! NLP Trigger Relay
//!
//! Relays document status transitions to the NLP service:
//! - filter: edge-triggered `status -> scraper_ok` detection
//! - audit: audit records with guaranteed finalization
//! - token: audience-scoped identity tokens
//! - dispatcher: authenticated POST to the NLP API
//! - handler: the per-event pipeline tying them together

pub mod audit;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod handler;
pub mod mongo;
pub mod store;
pub mod token;

pub use audit::{AuditGuard, AuditLogger, AuditSummary, Scoped};
pub use dispatcher::{DispatchReceipt, Dispatcher, HttpDispatcher, HttpDispatcherConfig};
pub use error::{AuthError, DispatchError, RelayError, Result, StoreError};
pub use filter::{FilterDecision, MalformedReason};
pub use handler::{AuditBackend, HandleOutcome, RelayHandler, SkipReason};
pub use mongo::MongoAuditStore;
pub use store::{AuditStore, AuditWrite, InMemoryAuditStore, WriteKind};
pub use token::{
    create_provider, KeyFileTokenProvider, MetadataTokenProvider, ServiceAccountTokenProvider,
    StaticTokenProvider, TokenProvider,
};
