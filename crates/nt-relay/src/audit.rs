//! Audit Logger
//!
//! Every invocation that passes the filter gets exactly one audit record:
//! inserted as `processing` before anything else happens, then updated once
//! to `success` or `failed`.
//!
//! Finalization does not depend on callers remembering to call
//! [`AuditGuard::finish`] on every exit path:
//! - [`AuditLogger::scope`] runs the work, catches panics, and finishes the
//!   record from whatever the work returned.
//! - If the guard is dropped unfinished (the invocation future was cancelled),
//!   `Drop` finalizes the record as `failed` on the current runtime.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use nt_common::{AuditRecord, AuditStatus};
use tracing::{error, info, warn};

use crate::error::{RelayError, StoreError};
use crate::store::AuditStore;

const ABORTED_DETAILS: &str = "Invocation aborted before completion";

/// Success summary written into a finished record's `details`
pub trait AuditSummary {
    fn audit_details(&self) -> String;
}

/// Output of a completed [`AuditLogger::scope`]
#[derive(Debug, Clone)]
pub struct Scoped<T> {
    pub run_id: String,
    pub value: T,
}

#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    /// Create and persist a `processing` record for `doc_id`
    pub async fn begin(&self, doc_id: &str) -> Result<AuditGuard, StoreError> {
        let record = AuditRecord::begin(doc_id);
        self.store.insert(&record).await?;
        info!(doc_id = %doc_id, run_id = %record.run_id, "Audit record created");

        Ok(AuditGuard {
            store: self.store.clone(),
            record,
            finished: false,
        })
    }

    /// Run `work` between [`begin`](Self::begin) and a guaranteed finish.
    ///
    /// The record ends `success` when `work` returns `Ok`, `failed` otherwise
    /// (including when `work` panics). A store failure while finishing is only
    /// surfaced when `work` itself succeeded; otherwise the work's error wins.
    pub async fn scope<T, F, Fut>(&self, doc_id: &str, work: F) -> Result<Scoped<T>, RelayError>
    where
        T: AuditSummary,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        let guard = self.begin(doc_id).await?;
        let run_id = guard.run_id().to_string();

        let result = match AssertUnwindSafe(work()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(RelayError::Unexpected(panic_message(panic.as_ref()))),
        };

        let (status, details, error_details) = match &result {
            Ok(value) => (AuditStatus::Success, value.audit_details(), None),
            Err(e) => (AuditStatus::Failed, e.to_string(), e.error_details()),
        };

        match guard.finish(status, details, error_details).await {
            Ok(record) => {
                info!(doc_id = %doc_id, run_id = %run_id, status = %record.status, "Audit record finalized");
                result.map(|value| Scoped { run_id, value })
            }
            Err(store_error) => {
                error!(doc_id = %doc_id, run_id = %run_id, error = %store_error, "Failed to finalize audit record");
                match result {
                    Ok(_) => Err(store_error.into()),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

/// Handle to a `processing` record that must be finished exactly once
pub struct AuditGuard {
    store: Arc<dyn AuditStore>,
    record: AuditRecord,
    finished: bool,
}

impl AuditGuard {
    pub fn record(&self) -> &AuditRecord {
        &self.record
    }

    pub fn run_id(&self) -> &str {
        &self.record.run_id
    }

    /// Stamp the outcome and persist it. Consumes the guard.
    pub async fn finish(
        mut self,
        status: AuditStatus,
        details: impl Into<String>,
        error_details: Option<String>,
    ) -> Result<AuditRecord, StoreError> {
        self.record.complete(status, details, error_details)?;
        let result = self.store.update(&self.record).await;
        self.finished = true;
        result.map(|_| self.record.clone())
    }
}

impl Drop for AuditGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let mut record = self.record.clone();
        // An outcome may already be stamped if the update itself was interrupted
        if !record.status.is_terminal()
            && record.complete(AuditStatus::Failed, ABORTED_DETAILS, None).is_err()
        {
            return;
        }

        let store = self.store.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(run_id = %record.run_id, "Audit guard dropped unfinished, finalizing as failed");
                handle.spawn(async move {
                    if let Err(e) = store.update(&record).await {
                        error!(run_id = %record.run_id, error = %e, "Failed to finalize aborted audit record");
                    }
                });
            }
            Err(_) => {
                error!(run_id = %record.run_id, "No runtime available, audit record left in processing");
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {}", message)
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::store::{InMemoryAuditStore, WriteKind};
    use std::time::Duration;

    #[derive(Debug)]
    struct Done(&'static str);

    impl AuditSummary for Done {
        fn audit_details(&self) -> String {
            self.0.to_string()
        }
    }

    fn logger() -> (AuditLogger, Arc<InMemoryAuditStore>) {
        let store = Arc::new(InMemoryAuditStore::new());
        (AuditLogger::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_scope_success() {
        let (logger, store) = logger();

        let scoped = logger
            .scope("doc-1", || async { Ok(Done("all good")) })
            .await
            .unwrap();

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].run_id, scoped.run_id);
        assert_eq!(records[0].status, AuditStatus::Success);
        assert_eq!(records[0].details, "all good");
        assert!(records[0].end_time.is_some());

        let kinds: Vec<WriteKind> = store.writes().iter().map(|w| w.kind).collect();
        assert_eq!(kinds, vec![WriteKind::Insert, WriteKind::Update]);
        assert_eq!(store.writes()[0].record.status, AuditStatus::Processing);
    }

    #[tokio::test]
    async fn test_scope_failure_records_error_details() {
        let (logger, store) = logger();

        let err = logger
            .scope("doc-1", || async {
                Err::<Done, _>(RelayError::Dispatch(DispatchError::Status {
                    url: "http://nlp/process/web/doc-1".into(),
                    status: 500,
                    body: "internal".into(),
                }))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Dispatch(_)));
        let record = &store.records()[0];
        assert_eq!(record.status, AuditStatus::Failed);
        assert_eq!(record.error_details.as_deref(), Some("internal"));
        assert!(record.details.contains("HTTP/network error"));
    }

    #[tokio::test]
    async fn test_scope_catches_panic() {
        let (logger, store) = logger();

        let err = logger
            .scope("doc-1", || async {
                if true {
                    panic!("exploded");
                }
                Ok(Done("unreachable"))
            })
            .await
            .unwrap_err();

        match err {
            RelayError::Unexpected(message) => assert!(message.contains("exploded")),
            other => panic!("expected unexpected error, got {:?}", other),
        }
        assert_eq!(store.records()[0].status, AuditStatus::Failed);
        assert_eq!(store.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_guard_finalizes_as_failed() {
        let (logger, store) = logger();

        let guard = logger.begin("doc-1").await.unwrap();
        let run_id = guard.run_id().to_string();
        drop(guard);

        // Finalization runs on a spawned task
        for _ in 0..50 {
            if store.writes_for(&run_id).len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let record = &store.records()[0];
        assert_eq!(record.status, AuditStatus::Failed);
        assert_eq!(record.details, ABORTED_DETAILS);
    }

    #[tokio::test]
    async fn test_cancelled_scope_still_finalizes() {
        let (logger, store) = logger();

        let scope = logger.scope("doc-1", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Done("never"))
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(20), scope).await;
        assert!(timed_out.is_err());

        for _ in 0..50 {
            if store.writes().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.records()[0].status, AuditStatus::Failed);
    }

    #[tokio::test]
    async fn test_finish_runs_once() {
        let (logger, store) = logger();
        let guard = logger.begin("doc-1").await.unwrap();
        let record = guard.finish(AuditStatus::Success, "ok", None).await.unwrap();

        assert_eq!(record.status, AuditStatus::Success);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.writes().len(), 2);
    }
}
