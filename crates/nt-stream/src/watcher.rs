use crate::checkpoint::CheckpointStore;
use crate::convert::change_event_from_stream;
use crate::{ChangeSource, StreamConfig};
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use mongodb::bson::{doc, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, ResumeToken};
use mongodb::options::{ChangeStreamOptions, FullDocumentBeforeChangeType, FullDocumentType};
use mongodb::{Client, Collection};
use nt_relay::RelayHandler;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Reconnection settings
const INITIAL_BACKOFF_MS: u64 = 5000;    // 5 seconds
const MAX_BACKOFF_MS: u64 = 60000;       // 60 seconds
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Feeds update/replace events of the watched collection to the relay handler.
///
/// The watched collection must have `changeStreamPreAndPostImages` enabled so
/// events carry the before-image needed for edge detection.
pub struct MongoChangeSource {
    client: Client,
    config: StreamConfig,
    handler: Arc<RelayHandler>,
    checkpoint_store: Arc<dyn CheckpointStore>,
}

impl MongoChangeSource {
    pub fn new(
        client: Client,
        config: StreamConfig,
        handler: Arc<RelayHandler>,
        checkpoint_store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            client,
            config,
            handler,
            checkpoint_store,
        }
    }

    fn stream_options(&self, resume_after: Option<ResumeToken>) -> ChangeStreamOptions {
        let mut options = ChangeStreamOptions::default();
        options.full_document = Some(FullDocumentType::UpdateLookup);
        options.full_document_before_change = Some(FullDocumentBeforeChangeType::WhenAvailable);
        options.resume_after = resume_after;
        options
    }

    async fn load_resume_token(&self, checkpoint_key: &str) -> Option<ResumeToken> {
        let doc = match self.checkpoint_store.get_checkpoint(checkpoint_key).await {
            Ok(doc) => doc?,
            Err(e) => {
                warn!("[{}] Failed to load checkpoint, starting from current: {}", self.config.name, e);
                return None;
            }
        };

        match mongodb::bson::from_document::<ResumeToken>(doc) {
            Ok(token) => {
                info!("[{}] Resuming from checkpoint", self.config.name);
                Some(token)
            }
            Err(e) => {
                warn!("[{}] Stored checkpoint is not a resume token, starting from current: {}", self.config.name, e);
                None
            }
        }
    }

    async fn save_resume_token(&self, checkpoint_key: &str, token: &ResumeToken) -> Result<()> {
        let token_doc = mongodb::bson::to_document(token)?;
        self.checkpoint_store.save_checkpoint(checkpoint_key, token_doc).await?;
        Ok(())
    }

    async fn handle_event(&self, event: &ChangeStreamEvent<Document>) {
        let Some(change) = change_event_from_stream(
            &self.config.source_database,
            &self.config.source_collection,
            event.document_key.as_ref(),
            event.full_document.as_ref(),
            event.full_document_before_change.as_ref(),
        ) else {
            warn!("[{}] Change event without document key, ignoring", self.config.name);
            return;
        };

        // Failures are already audited and logged by the handler; nothing redelivers here
        if let Ok(outcome) = self.handler.handle(&change).await {
            debug!("[{}] {} -> {}", self.config.name, change.subject, outcome.label());
        }
    }

    /// Process events until shutdown is requested or the stream fails.
    ///
    /// Shutdown is only observed between events, so an invocation in flight
    /// always runs to its audited end.
    async fn process_stream_events<S>(
        &self,
        stream: &mut S,
        checkpoint_key: &str,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<()>
    where
        S: Stream<Item = mongodb::error::Result<ChangeStreamEvent<Document>>> + Unpin + Send,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.recv() => return Ok(()),
                next = stream.next() => next,
            };

            let event = match next {
                Some(event) => event?,
                None => return Err(anyhow::anyhow!("Change stream closed unexpectedly")),
            };
            self.handle_event(&event).await;
            self.save_resume_token(checkpoint_key, &event.id).await?;
        }
    }
}

#[async_trait]
impl ChangeSource for MongoChangeSource {
    /// Watch the change stream with automatic reconnection on failure.
    ///
    /// Stream and connection failures retry with exponential backoff. A stale
    /// resume token clears the checkpoint and restarts from the current position.
    /// Returns once `shutdown` fires.
    async fn watch(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let db = self.client.database(&self.config.source_database);
        let collection: Collection<Document> = db.collection(&self.config.source_collection);
        let checkpoint_key = self.config.checkpoint_key();

        let mut consecutive_failures = 0u32;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let resume_token = self.load_resume_token(&checkpoint_key).await;
            if resume_token.is_none() {
                info!("[{}] Starting from current position (no checkpoint)", self.config.name);
            }

            let pipeline = vec![
                doc! { "$match": { "operationType": { "$in": self.config.watch_operations.clone() } } }
            ];

            let stream_result = collection
                .watch()
                .pipeline(pipeline)
                .with_options(self.stream_options(resume_token))
                .await;

            let error = match stream_result {
                Ok(mut stream) => {
                    consecutive_failures = 0;
                    backoff_ms = INITIAL_BACKOFF_MS;
                    info!("[{}] Change stream opened on {}.{}",
                        self.config.name, self.config.source_database, self.config.source_collection);

                    match self.process_stream_events(&mut stream, &checkpoint_key, &mut shutdown).await {
                        Ok(()) => {
                            info!("[{}] Change stream stopped for shutdown", self.config.name);
                            return Ok(());
                        }
                        Err(e) => e,
                    }
                }
                Err(e) => e.into(),
            };

            consecutive_failures += 1;

            if is_stale_resume_token_error(&error) {
                error!("[{}] Resume token expired - clearing checkpoint. EVENTS MAY BE MISSED.", self.config.name);
                if let Err(e) = self.checkpoint_store.clear_checkpoint(&checkpoint_key).await {
                    warn!("[{}] Failed to clear checkpoint: {}", self.config.name, e);
                }
                backoff_ms = INITIAL_BACKOFF_MS;
                continue;
            }

            warn!("[{}] Change stream error (attempt {}), reconnecting in {}ms: {}",
                self.config.name, consecutive_failures, backoff_ms, error);

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                _ = shutdown.recv() => return Ok(()),
            }
            backoff_ms = next_backoff(backoff_ms);
        }
    }
}

fn next_backoff(current_ms: u64) -> u64 {
    ((current_ms as f64 * BACKOFF_MULTIPLIER) as u64).min(MAX_BACKOFF_MS)
}

/// Check if an error is due to a stale/expired resume token
fn is_stale_resume_token_error<E: std::fmt::Display>(e: &E) -> bool {
    let err_str = e.to_string().to_lowercase();
    err_str.contains("changestream") && err_str.contains("history") ||
    err_str.contains("resume token") ||
    err_str.contains("oplog") ||
    err_str.contains("invalidate")
}

#[cfg(test)]
mod tests {
    use super::*;
    use nt_common::AuditStatus;
    use nt_relay::{
        AuditBackend, AuditLogger, DispatchError, DispatchReceipt, Dispatcher, InMemoryAuditStore,
        StaticTokenProvider,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Checkpoint store that keeps every saved token
    #[derive(Default)]
    struct MemoryCheckpoints {
        saved: parking_lot::Mutex<Vec<Document>>,
    }

    #[async_trait]
    impl CheckpointStore for MemoryCheckpoints {
        async fn get_checkpoint(&self, _key: &str) -> Result<Option<Document>> {
            Ok(self.saved.lock().last().cloned())
        }

        async fn save_checkpoint(&self, _key: &str, token: Document) -> Result<()> {
            self.saved.lock().push(token);
            Ok(())
        }

        async fn clear_checkpoint(&self, _key: &str) -> Result<()> {
            self.saved.lock().clear();
            Ok(())
        }
    }

    /// Dispatcher that takes a while to answer
    struct SlowDispatcher {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Dispatcher for SlowDispatcher {
        async fn dispatch(&self, doc_id: &str, _token: &str) -> std::result::Result<DispatchReceipt, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(DispatchReceipt {
                url: format!("http://nlp.test/process/web/{}", doc_id),
                status: 200,
                body: serde_json::json!({}),
                elapsed: self.delay,
            })
        }
    }

    fn update_event(doc_id: &str) -> ChangeStreamEvent<Document> {
        mongodb::bson::from_document(doc! {
            "_id": { "_data": format!("token-{}", doc_id) },
            "operationType": "update",
            "documentKey": { "_id": doc_id },
            "fullDocument": { "_id": doc_id, "status": "scraper_ok" },
            "fullDocumentBeforeChange": { "_id": doc_id, "status": "pending" },
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_invocation() {
        let store = Arc::new(InMemoryAuditStore::new());
        let dispatcher = Arc::new(SlowDispatcher {
            delay: Duration::from_millis(300),
            calls: AtomicUsize::new(0),
        });
        let handler = Arc::new(RelayHandler::new(
            AuditBackend::Ready(AuditLogger::new(store.clone())),
            Arc::new(StaticTokenProvider::new("t")),
            dispatcher.clone(),
            "http://nlp.test",
        ));
        let checkpoints = Arc::new(MemoryCheckpoints::default());

        // Server selection is lazy; nothing connects here
        let client = Client::with_uri_str("mongodb://127.0.0.1:1").await.unwrap();
        let source = Arc::new(MongoChangeSource::new(
            client,
            StreamConfig::default(),
            handler,
            checkpoints.clone(),
        ));

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let mut stream = futures::stream::iter(vec![Ok::<_, mongodb::error::Error>(update_event("doc-1"))])
            .chain(futures::stream::pending());

        let task = {
            let source = source.clone();
            tokio::spawn(async move {
                source
                    .process_stream_events(&mut stream, "checkpoint:test", &mut shutdown_rx)
                    .await
            })
        };

        // Shut down while the dispatch is still in flight
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());

        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, AuditStatus::Success);
        assert_eq!(checkpoints.saved.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_stream_is_an_error() {
        let handler = Arc::new(RelayHandler::new(
            AuditBackend::Ready(AuditLogger::new(Arc::new(InMemoryAuditStore::new()))),
            Arc::new(StaticTokenProvider::new("t")),
            Arc::new(SlowDispatcher { delay: Duration::ZERO, calls: AtomicUsize::new(0) }),
            "http://nlp.test",
        ));
        let client = Client::with_uri_str("mongodb://127.0.0.1:1").await.unwrap();
        let source = MongoChangeSource::new(
            client,
            StreamConfig::default(),
            handler,
            Arc::new(MemoryCheckpoints::default()),
        );

        let (_shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let mut stream = futures::stream::empty::<mongodb::error::Result<ChangeStreamEvent<Document>>>();

        let result = source
            .process_stream_events(&mut stream, "checkpoint:test", &mut shutdown_rx)
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(next_backoff(INITIAL_BACKOFF_MS), 10000);
        assert_eq!(next_backoff(40000), MAX_BACKOFF_MS);
        assert_eq!(next_backoff(MAX_BACKOFF_MS), MAX_BACKOFF_MS);
    }

    #[test]
    fn test_stale_resume_token_detection() {
        assert!(is_stale_resume_token_error(&"Resume of change stream was not possible, as the resume token was not found"));
        assert!(is_stale_resume_token_error(&"ChangeStreamHistoryLost: history lost"));
        assert!(!is_stale_resume_token_error(&"connection refused"));
    }
}
