use nt_config::SourceConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub source_database: String,
    pub source_collection: String,
    pub checkpoint_collection: String,
    pub watch_operations: Vec<String>,
}

impl StreamConfig {
    pub fn from_source(source: &SourceConfig) -> Self {
        Self {
            name: format!("{}.{}", source.watch_database, source.watch_collection),
            source_database: source.watch_database.clone(),
            source_collection: source.watch_collection.clone(),
            checkpoint_collection: source.checkpoint_collection.clone(),
            ..Self::default()
        }
    }

    pub fn checkpoint_key(&self) -> String {
        format!("checkpoint:{}", self.name)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: "nlp_trigger.monitor_results".to_string(),
            source_database: "nlp_trigger".to_string(),
            source_collection: "monitor_results".to_string(),
            checkpoint_collection: "stream_checkpoints".to_string(),
            // Only writes to an existing document can carry a status transition
            watch_operations: vec!["update".to_string(), "replace".to_string()],
        }
    }
}
