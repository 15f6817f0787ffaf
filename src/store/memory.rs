use super::{increment_in, upsert_into, QuotaRecord, QuotaStore, SubjectRecord, SubjectRepository};
use crate::error::StoreError;
use crate::subject::Shape;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// In-process backend for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    subjects: Mutex<Vec<SubjectRecord>>,
    quotas: Mutex<HashMap<String, QuotaRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn subjects(&self) -> Result<MutexGuard<'_, Vec<SubjectRecord>>, StoreError> {
        self.subjects
            .lock()
            .map_err(|_| StoreError::Unavailable("subject table lock poisoned".into()))
    }

    fn quotas(&self) -> Result<MutexGuard<'_, HashMap<String, QuotaRecord>>, StoreError> {
        self.quotas
            .lock()
            .map_err(|_| StoreError::Unavailable("quota table lock poisoned".into()))
    }
}

#[async_trait]
impl SubjectRepository for MemoryStore {
    async fn find_by_name(&self, name_key: &str) -> Result<Option<SubjectRecord>, StoreError> {
        Ok(self
            .subjects()?
            .iter()
            .find(|row| row.name_key == name_key)
            .cloned())
    }

    async fn find_by_catalog_id(&self, id: &str) -> Result<Option<SubjectRecord>, StoreError> {
        Ok(self
            .subjects()?
            .iter()
            .find(|row| row.catalog_id.as_deref() == Some(id))
            .cloned())
    }

    async fn upsert(&self, record: SubjectRecord) -> Result<(), StoreError> {
        upsert_into(&mut *self.subjects()?, record);
        Ok(())
    }

    async fn clear_payload(&self, target: &SubjectRecord, shape: Shape) -> Result<(), StoreError> {
        for row in self
            .subjects()?
            .iter_mut()
            .filter(|row| row.same_subject(target))
        {
            row.payloads.remove(&shape);
        }
        Ok(())
    }

    async fn featured(&self) -> Result<Vec<SubjectRecord>, StoreError> {
        Ok(self
            .subjects()?
            .iter()
            .filter(|row| row.featured)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn load(&self, identity: &str) -> Result<Option<QuotaRecord>, StoreError> {
        Ok(self.quotas()?.get(identity).cloned())
    }

    async fn increment(
        &self,
        identity: &str,
        default_limit: u32,
    ) -> Result<QuotaRecord, StoreError> {
        Ok(increment_in(&mut *self.quotas()?, identity, default_limit))
    }

    async fn save(&self, record: QuotaRecord) -> Result<(), StoreError> {
        self.quotas()?.insert(record.identity.clone(), record);
        Ok(())
    }
}
