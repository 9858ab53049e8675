//! NLP Trigger change-stream source
//!
//! Alternative to HTTP push delivery: watches the results collection directly
//! and feeds each update through the relay handler, checkpointing as it goes.

pub mod checkpoint;
pub mod config;
pub mod convert;
pub mod watcher;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

pub use checkpoint::{CheckpointStore, MongoCheckpointStore};
pub use config::StreamConfig;
pub use convert::{change_event_from_stream, field_value_from_bson, fields_from_document};
pub use watcher::MongoChangeSource;

#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Run until `shutdown` fires; transient failures are retried internally
    async fn watch(&self, shutdown: broadcast::Receiver<()>) -> Result<()>;
}
