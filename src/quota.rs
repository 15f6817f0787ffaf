//! Per-identity generation quota.
//!
//! Anonymous callers never generate. Signed-in callers get `limit`
//! generations; administrators (configured, or flagged on their record) are
//! exempt. An unreadable backend denies rather than allowing unlimited use.
//!
//! `check` and `record_generation` are separate steps with generation in
//! between, and no slot is reserved. One identity running generations for
//! several subjects at once can therefore end above `limit`, by at most the
//! number of its generations in flight when it crossed the limit. The count
//! is never lost: every completed generation is recorded, and the identity
//! is denied once the stored count reaches `limit`.

use crate::error::StoreError;
use crate::store::{QuotaRecord, QuotaStore};
use crate::subject::Identity;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

/// Limit observed in production.
pub const DEFAULT_GENERATION_LIMIT: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    /// `remaining` is `None` for exempt identities.
    Allowed { remaining: Option<u32> },
    Denied(DenyReason),
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allowed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    Anonymous,
    Exhausted { limit: u32 },
    BackendUnavailable,
}

pub struct QuotaGate {
    store: Arc<dyn QuotaStore>,
    limit: u32,
    admins: HashSet<String>,
}

impl QuotaGate {
    pub fn new(store: Arc<dyn QuotaStore>, limit: u32) -> Self {
        Self {
            store,
            limit,
            admins: HashSet::new(),
        }
    }

    pub fn with_admins<I, S>(mut self, admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.admins = admins.into_iter().map(Into::into).collect();
        self
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    fn is_admin(&self, id: &str) -> bool {
        self.admins.contains(id)
    }

    pub async fn check(&self, identity: &Identity) -> QuotaDecision {
        let Some(id) = identity.id() else {
            return QuotaDecision::Denied(DenyReason::Anonymous);
        };
        if self.is_admin(id) {
            return QuotaDecision::Allowed { remaining: None };
        }

        let record = match self.store.load(id).await {
            Ok(record) => record.unwrap_or_else(|| QuotaRecord::new(id, self.limit)),
            Err(err) => {
                tracing::warn!(identity = id, error = %err, "quota backend unreadable, denying");
                return QuotaDecision::Denied(DenyReason::BackendUnavailable);
            }
        };

        if record.is_exempt {
            QuotaDecision::Allowed { remaining: None }
        } else if record.allows_generation() {
            QuotaDecision::Allowed {
                remaining: Some(record.remaining()),
            }
        } else {
            QuotaDecision::Denied(DenyReason::Exhausted {
                limit: record.limit,
            })
        }
    }

    pub async fn can_generate(&self, identity: &Identity) -> bool {
        self.check(identity).await.is_allowed()
    }

    /// Count one completed generation. Exempt and anonymous identities are
    /// not counted; a failed write is logged and swallowed.
    pub async fn record_generation(&self, identity: &Identity) {
        let Some(id) = identity.id() else {
            return;
        };
        if self.is_admin(id) {
            return;
        }
        if let Ok(Some(record)) = self.store.load(id).await {
            if record.is_exempt {
                return;
            }
        }
        match self.store.increment(id, self.limit).await {
            Ok(record) => {
                tracing::info!(identity = id, count = record.count, limit = record.limit, "generation counted");
            }
            Err(err) => {
                tracing::warn!(identity = id, error = %err, "failed to record generation");
            }
        }
    }

    /// Generations left; `u32::MAX` for exempt identities, 0 when unknown.
    pub async fn remaining(&self, identity: &Identity) -> u32 {
        match self.check(identity).await {
            QuotaDecision::Allowed { remaining: None } => u32::MAX,
            QuotaDecision::Allowed {
                remaining: Some(n),
            } => n,
            QuotaDecision::Denied(_) => 0,
        }
    }

    /// Administrative reset; the only path that lowers a count.
    pub async fn reset(&self, identity: &str) -> Result<(), StoreError> {
        let mut record = self
            .store
            .load(identity)
            .await?
            .unwrap_or_else(|| QuotaRecord::new(identity, self.limit));
        record.count = 0;
        record.updated_at = Utc::now();
        self.store.save(record).await?;
        tracing::info!(identity, "quota reset");
        Ok(())
    }

    pub async fn set_exempt(&self, identity: &str, exempt: bool) -> Result<(), StoreError> {
        let mut record = self
            .store
            .load(identity)
            .await?
            .unwrap_or_else(|| QuotaRecord::new(identity, self.limit));
        record.is_exempt = exempt;
        record.updated_at = Utc::now();
        self.store.save(record).await
    }

    pub async fn record(&self, identity: &str) -> Result<Option<QuotaRecord>, StoreError> {
        self.store.load(identity).await
    }
}
