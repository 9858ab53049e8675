use async_trait::async_trait;
use nt_common::AuditRecord;
use parking_lot::Mutex;

use crate::error::StoreError;

/// Persistence for audit records
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist a newly created record
    async fn insert(&self, record: &AuditRecord) -> Result<(), StoreError>;

    /// Overwrite an existing record, matched by run id
    async fn update(&self, record: &AuditRecord) -> Result<(), StoreError>;

    /// Connectivity check for readiness probes
    async fn ping(&self) -> Result<(), StoreError>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
}

/// One write observed by [`InMemoryAuditStore`]
#[derive(Debug, Clone)]
pub struct AuditWrite {
    pub kind: WriteKind,
    pub record: AuditRecord,
}

/// Process-local audit store. Keeps every write in order so the record
/// lifecycle can be inspected.
#[derive(Default)]
pub struct InMemoryAuditStore {
    writes: Mutex<Vec<AuditWrite>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest state of every record, in creation order
    pub fn records(&self) -> Vec<AuditRecord> {
        let writes = self.writes.lock();
        let mut records: Vec<AuditRecord> = Vec::new();
        for write in writes.iter() {
            match records.iter_mut().find(|r| r.run_id == write.record.run_id) {
                Some(existing) => *existing = write.record.clone(),
                None => records.push(write.record.clone()),
            }
        }
        records
    }

    pub fn writes(&self) -> Vec<AuditWrite> {
        self.writes.lock().clone()
    }

    pub fn writes_for(&self, run_id: &str) -> Vec<AuditWrite> {
        self.writes
            .lock()
            .iter()
            .filter(|w| w.record.run_id == run_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn insert(&self, record: &AuditRecord) -> Result<(), StoreError> {
        self.writes.lock().push(AuditWrite {
            kind: WriteKind::Insert,
            record: record.clone(),
        });
        Ok(())
    }

    async fn update(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let mut writes = self.writes.lock();
        if !writes.iter().any(|w| w.record.run_id == record.run_id) {
            return Err(StoreError::NotFound { run_id: record.run_id.clone() });
        }
        writes.push(AuditWrite {
            kind: WriteKind::Update,
            record: record.clone(),
        });
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
