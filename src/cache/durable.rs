//! Durable tier with an in-process fallback.
//!
//! Reads and writes go to the injected [`SubjectRepository`]. When it fails,
//! the error is logged and the same operation is applied to a process-local
//! row list instead. The fallback is lost on restart; callers must tolerate
//! re-generation after one.

use crate::store::{upsert_into, SubjectRecord, SubjectRepository};
use crate::subject::{normalize_name, Shape, Subject};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};

pub struct DurableTier {
    repo: Arc<dyn SubjectRepository>,
    fallback: Mutex<Vec<SubjectRecord>>,
}

impl DurableTier {
    pub fn new(repo: Arc<dyn SubjectRepository>) -> Self {
        Self {
            repo,
            fallback: Mutex::new(Vec::new()),
        }
    }

    fn fallback(&self) -> MutexGuard<'_, Vec<SubjectRecord>> {
        self.fallback.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Payload for `shape`, looked up by name then by catalog id.
    pub async fn get(&self, subject: &Subject, shape: Shape) -> Option<Value> {
        if let Some(record) = self.find(subject).await {
            if let Some(payload) = record.payload(shape) {
                return Some(payload.clone());
            }
        }
        self.find_fallback(subject)
            .and_then(|record| record.payload(shape).cloned())
    }

    /// Row for a subject from the backend; errors degrade to a miss.
    pub async fn find(&self, subject: &Subject) -> Option<SubjectRecord> {
        if let Some(name) = subject.name.as_deref().filter(|n| !n.trim().is_empty()) {
            match self.repo.find_by_name(&normalize_name(name)).await {
                Ok(Some(record)) => return Some(record),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(subject = name, error = %err, "durable lookup by name failed");
                }
            }
        }
        if let Some(id) = subject.catalog_id.as_deref() {
            match self.repo.find_by_catalog_id(id).await {
                Ok(found) => return found,
                Err(err) => {
                    tracing::warn!(catalog_id = id, error = %err, "durable lookup by id failed");
                }
            }
        }
        None
    }

    fn find_fallback(&self, subject: &Subject) -> Option<SubjectRecord> {
        let probe = subject_record(subject);
        self.fallback()
            .iter()
            .find(|row| row.same_subject(&probe))
            .cloned()
    }

    /// Upsert; on backend failure the row goes to the in-process fallback.
    pub async fn set(&self, subject: &Subject, shape: Shape, payload: Value, featured: bool) {
        let mut record = subject_record(subject);
        record.featured = featured;
        record.set_payload(shape, payload);

        if let Err(err) = self.repo.upsert(record.clone()).await {
            tracing::warn!(
                subject = subject.label(),
                error = %err,
                "durable write failed, keeping result in process memory"
            );
            upsert_into(&mut self.fallback(), record);
        }
    }

    /// Drop `shape` from the subject's row, matched by name or catalog id.
    /// Returns the row that was targeted so callers can clear aliases.
    pub async fn invalidate(&self, subject: &Subject, shape: Shape) -> SubjectRecord {
        let probe = subject_record(subject);
        let target = match self.find(subject).await {
            Some(mut found) => {
                if found.catalog_id.is_none() {
                    found.catalog_id = probe.catalog_id.clone();
                }
                found
            }
            None => probe,
        };
        if let Err(err) = self.repo.clear_payload(&target, shape).await {
            tracing::warn!(subject = subject.label(), error = %err, "durable invalidate failed");
        }
        for row in self.fallback().iter_mut().filter(|row| row.same_subject(&target)) {
            row.payloads.remove(&shape);
        }
        target
    }

    /// Featured rows; backend errors fall back to the in-process rows.
    pub async fn featured(&self) -> Vec<SubjectRecord> {
        let mut rows = match self.repo.featured().await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(error = %err, "durable featured read failed");
                Vec::new()
            }
        };
        for row in self.fallback().iter().filter(|row| row.featured) {
            if !rows.iter().any(|r| r.same_subject(row)) {
                rows.push(row.clone());
            }
        }
        rows
    }
}

fn subject_record(subject: &Subject) -> SubjectRecord {
    SubjectRecord::new(
        subject.name.as_deref().unwrap_or(""),
        subject.catalog_id.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct DownStore;

    #[async_trait]
    impl SubjectRepository for DownStore {
        async fn find_by_name(&self, _: &str) -> Result<Option<SubjectRecord>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn find_by_catalog_id(&self, _: &str) -> Result<Option<SubjectRecord>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn upsert(&self, _: SubjectRecord) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn clear_payload(&self, _: &SubjectRecord, _: Shape) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn featured(&self) -> Result<Vec<SubjectRecord>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn unreachable_backend_uses_process_fallback() {
        let tier = DurableTier::new(Arc::new(DownStore));
        let subject = Subject::named("Steven Wilson");
        assert!(tier.get(&subject, Shape::Recommendations).await.is_none());

        tier.set(&subject, Shape::Recommendations, json!(["x"]), true)
            .await;
        assert_eq!(
            tier.get(&Subject::named("STEVEN WILSON"), Shape::Recommendations)
                .await,
            Some(json!(["x"]))
        );
        assert_eq!(tier.featured().await.len(), 1);

        tier.invalidate(&subject, Shape::Recommendations).await;
        assert!(tier.get(&subject, Shape::Recommendations).await.is_none());
    }

    #[tokio::test]
    async fn catalog_id_is_an_alternate_key() {
        let tier = DurableTier::new(Arc::new(MemoryStore::new()));
        let subject = Subject::named("Can").with_catalog_id("can-id");
        tier.set(&subject, Shape::Influences, json!({"root": {}}), false)
            .await;

        let by_id = Subject::by_catalog_id("can-id");
        assert!(tier.get(&by_id, Shape::Influences).await.is_some());
    }

    #[tokio::test]
    async fn invalidate_clears_row_written_by_catalog_id() {
        let tier = DurableTier::new(Arc::new(MemoryStore::new()));
        let by_id = Subject::by_catalog_id("4X42BfuhWCAZ2swiVze9O0");
        tier.set(&by_id, Shape::Recommendations, json!(["stale"]), false)
            .await;

        let target = tier.invalidate(&by_id, Shape::Recommendations).await;
        assert_eq!(target.catalog_id.as_deref(), Some("4X42BfuhWCAZ2swiVze9O0"));
        assert!(tier.get(&by_id, Shape::Recommendations).await.is_none());
    }

    #[tokio::test]
    async fn rewrite_updates_existing_row() {
        let repo = Arc::new(MemoryStore::new());
        let tier = DurableTier::new(repo.clone());
        let subject = Subject::named("Low");
        tier.set(&subject, Shape::Recommendations, json!([1]), false)
            .await;
        tier.set(&subject, Shape::Recommendations, json!([2]), false)
            .await;

        let row = repo.find_by_name("low").await.unwrap().unwrap();
        assert_eq!(row.payload(Shape::Recommendations), Some(&json!([2])));
    }
}
