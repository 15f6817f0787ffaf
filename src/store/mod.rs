//! Persistence service contracts.
//!
//! The durable cache tier and the quota gate talk to storage only through
//! these traits so tests can substitute fakes and several pipelines in one
//! process never share hidden state.

pub(crate) mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::subject::{normalize_name, Shape};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One row of the durable subject table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub name: String,
    /// Lowercased, whitespace-collapsed `name`; the lookup column.
    pub name_key: String,
    #[serde(default)]
    pub catalog_id: Option<String>,
    #[serde(default)]
    pub featured: bool,
    #[serde(default)]
    pub payloads: HashMap<Shape, StoredPayload>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPayload {
    pub payload: Value,
    pub stored_at: DateTime<Utc>,
}

impl SubjectRecord {
    pub fn new(name: &str, catalog_id: Option<String>) -> Self {
        Self {
            name: name.trim().to_string(),
            name_key: normalize_name(name),
            catalog_id,
            featured: false,
            payloads: HashMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn payload(&self, shape: Shape) -> Option<&Value> {
        self.payloads.get(&shape).map(|p| &p.payload)
    }

    pub fn set_payload(&mut self, shape: Shape, payload: Value) {
        let now = Utc::now();
        self.payloads.insert(
            shape,
            StoredPayload {
                payload,
                stored_at: now,
            },
        );
        self.updated_at = now;
    }

    /// Whether `other` describes the same subject (name or catalog id).
    pub fn same_subject(&self, other: &SubjectRecord) -> bool {
        if !self.name_key.is_empty() && self.name_key == other.name_key {
            return true;
        }
        matches!(
            (&self.catalog_id, &other.catalog_id),
            (Some(a), Some(b)) if a == b
        )
    }

    /// Fold a newer write into this row in place.
    pub fn merge_from(&mut self, newer: SubjectRecord) {
        if !newer.name.is_empty() {
            self.name = newer.name;
            self.name_key = newer.name_key;
        }
        if newer.catalog_id.is_some() {
            self.catalog_id = newer.catalog_id;
        }
        self.featured = self.featured || newer.featured;
        self.payloads.extend(newer.payloads);
        self.updated_at = newer.updated_at.max(self.updated_at);
    }
}

/// Per-identity generation counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub identity: String,
    pub count: u32,
    pub limit: u32,
    #[serde(default)]
    pub is_exempt: bool,
    pub updated_at: DateTime<Utc>,
}

impl QuotaRecord {
    pub fn new(identity: &str, limit: u32) -> Self {
        Self {
            identity: identity.to_string(),
            count: 0,
            limit,
            is_exempt: false,
            updated_at: Utc::now(),
        }
    }

    pub fn allows_generation(&self) -> bool {
        self.is_exempt || self.count < self.limit
    }

    pub fn remaining(&self) -> u32 {
        if self.is_exempt {
            u32::MAX
        } else {
            self.limit.saturating_sub(self.count)
        }
    }
}

/// Durable subject table: case-insensitive name lookup, catalog id lookup,
/// upsert, and the `featured` bulk read.
#[async_trait]
pub trait SubjectRepository: Send + Sync {
    /// `name_key` is already normalized.
    async fn find_by_name(&self, name_key: &str) -> Result<Option<SubjectRecord>, StoreError>;

    async fn find_by_catalog_id(&self, id: &str) -> Result<Option<SubjectRecord>, StoreError>;

    /// Insert, or update in place when a row for the same subject exists.
    async fn upsert(&self, record: SubjectRecord) -> Result<(), StoreError>;

    /// Remove one shape's payload from every row describing the same
    /// subject as `target` (see [`SubjectRecord::same_subject`]); rows stay.
    async fn clear_payload(&self, target: &SubjectRecord, shape: Shape)
        -> Result<(), StoreError>;

    async fn featured(&self) -> Result<Vec<SubjectRecord>, StoreError>;
}

/// Storage behind the quota gate.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn load(&self, identity: &str) -> Result<Option<QuotaRecord>, StoreError>;

    /// Atomically add one to the counter, creating the record with
    /// `default_limit` on first use.
    async fn increment(&self, identity: &str, default_limit: u32)
        -> Result<QuotaRecord, StoreError>;

    async fn save(&self, record: QuotaRecord) -> Result<(), StoreError>;
}

/// Insert-or-merge into a row list; shared by the in-process backends.
pub(crate) fn upsert_into(rows: &mut Vec<SubjectRecord>, record: SubjectRecord) {
    match rows.iter_mut().find(|row| row.same_subject(&record)) {
        Some(existing) => existing.merge_from(record),
        None => rows.push(record),
    }
}

pub(crate) fn increment_in(
    quotas: &mut HashMap<String, QuotaRecord>,
    identity: &str,
    default_limit: u32,
) -> QuotaRecord {
    let record = quotas
        .entry(identity.to_string())
        .or_insert_with(|| QuotaRecord::new(identity, default_limit));
    record.count = record.count.saturating_add(1);
    record.updated_at = Utc::now();
    record.clone()
}
