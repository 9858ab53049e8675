//! MongoDB audit store

use async_trait::async_trait;
use mongodb::bson::{doc, Document};
use mongodb::{Client, Collection, Database};
use nt_common::AuditRecord;
use tracing::debug;

use crate::error::StoreError;
use crate::store::AuditStore;

pub struct MongoAuditStore {
    database: Database,
    collection: Collection<Document>,
}

impl MongoAuditStore {
    pub fn new(client: &Client, db_name: &str, collection_name: &str) -> Self {
        let database = client.database(db_name);
        let collection = database.collection(collection_name);
        Self { database, collection }
    }

    /// Connect and verify the server answers before handing out the store
    pub async fn connect(uri: &str, db_name: &str, collection_name: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri).await?;
        let store = Self::new(&client, db_name, collection_name);
        store.ping().await?;
        Ok(store)
    }
}

fn to_bson_datetime(value: chrono::DateTime<chrono::Utc>) -> mongodb::bson::DateTime {
    mongodb::bson::DateTime::from_chrono(value)
}

/// Mutable part of a record, as written on every update
fn outcome_fields(record: &AuditRecord) -> Document {
    let mut fields = doc! {
        "end_time": record.end_time.map(to_bson_datetime),
        "status": record.status.as_str(),
        "details": &record.details,
    };
    if let Some(error_details) = &record.error_details {
        fields.insert("error_details", error_details);
    }
    fields
}

pub(crate) fn record_to_document(record: &AuditRecord) -> Document {
    let mut document = doc! {
        "_id": &record.run_id,
        "run_id": &record.run_id,
        "module": &record.module,
        "target_doc_id": &record.target_doc_id,
        "start_time": to_bson_datetime(record.start_time),
    };
    for (key, value) in outcome_fields(record) {
        document.insert(key, value);
    }
    document
}

#[async_trait]
impl AuditStore for MongoAuditStore {
    async fn insert(&self, record: &AuditRecord) -> Result<(), StoreError> {
        self.collection.insert_one(record_to_document(record)).await?;
        debug!(run_id = %record.run_id, "Inserted audit record");
        Ok(())
    }

    async fn update(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let result = self.collection
            .update_one(doc! { "_id": &record.run_id }, doc! { "$set": outcome_fields(record) })
            .await?;

        if result.matched_count == 0 {
            return Err(StoreError::NotFound { run_id: record.run_id.clone() });
        }
        debug!(run_id = %record.run_id, status = %record.status, "Updated audit record");
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.database.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "mongo"
    }
}
