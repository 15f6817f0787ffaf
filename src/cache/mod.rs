//! Two-tier cache for generated results.
//!
//! Lookups go local tier first, then the durable tier; a durable hit is
//! copied back into the local tier. Writes go to both.
//!
//! # Error Handling
//!
//! Cache operations are best-effort. A failing durable backend is logged and
//! treated as a miss (reads) or redirected to an in-process map (writes), so
//! the pipeline can still generate. Nothing in this module returns an error
//! to the orchestrator.

mod durable;
mod local;

pub use durable::DurableTier;
pub use local::{CacheEntry, LocalCache};

use crate::store::{SubjectRecord, SubjectRepository};
use crate::subject::{Shape, Subject, SubjectKey};
use chrono::Duration;
use serde_json::Value;
use std::sync::Arc;

/// Upper bound for configured TTLs (100 years).
const MAX_TTL_SECS: u64 = 100 * 365 * 24 * 3600;

/// Lifetime classes for local-tier entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    /// Catalog search results for type-ahead
    Suggestions,
    /// Generated flat recommendations
    Recommendations,
    /// Generated influence trees
    Influences,
    /// Placeholder payloads produced when generation could not be parsed
    Fallback,
}

impl TtlClass {
    pub fn for_shape(shape: Shape) -> Self {
        match shape {
            Shape::Recommendations => TtlClass::Recommendations,
            Shape::Influences => TtlClass::Influences,
        }
    }
}

/// TTL per class. `None` never expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlPolicy {
    pub suggestions: Option<Duration>,
    pub recommendations: Option<Duration>,
    pub influences: Option<Duration>,
    pub fallback: Option<Duration>,
}

impl TtlPolicy {
    /// Build from second counts; zero means unbounded.
    pub fn from_secs(suggestions: u64, recommendations: u64, influences: u64, fallback: u64) -> Self {
        let ttl = |secs: u64| {
            let secs = secs.min(MAX_TTL_SECS) as i64;
            (secs > 0).then(|| Duration::seconds(secs))
        };
        Self {
            suggestions: ttl(suggestions),
            recommendations: ttl(recommendations),
            influences: ttl(influences),
            fallback: ttl(fallback),
        }
    }

    pub fn ttl_for(&self, class: TtlClass) -> Option<Duration> {
        match class {
            TtlClass::Suggestions => self.suggestions,
            TtlClass::Recommendations => self.recommendations,
            TtlClass::Influences => self.influences,
            TtlClass::Fallback => self.fallback,
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::from_secs(5 * 60, 7 * 24 * 3600, 30 * 24 * 3600, 10 * 60)
    }
}

/// Which tier answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Local,
    Durable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub payload: Value,
    pub tier: CacheTier,
}

/// Facade over both tiers for generated results.
pub struct CacheStore {
    local: LocalCache,
    durable: DurableTier,
    ttl: TtlPolicy,
}

impl CacheStore {
    pub fn new(local: LocalCache, repo: Arc<dyn SubjectRepository>, ttl: TtlPolicy) -> Self {
        Self {
            local,
            durable: DurableTier::new(repo),
            ttl,
        }
    }

    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    pub fn durable(&self) -> &DurableTier {
        &self.durable
    }

    pub fn ttl(&self) -> &TtlPolicy {
        &self.ttl
    }

    /// Local tier, then durable tier (with backfill).
    pub async fn get(&self, subject: &Subject, shape: Shape) -> Option<CacheHit> {
        let key = subject.key().cache_key(shape);
        if let Some(payload) = self.local.get(&key) {
            return Some(CacheHit {
                payload,
                tier: CacheTier::Local,
            });
        }

        let payload = self.durable.get(subject, shape).await?;
        self.local.set(
            &key,
            payload.clone(),
            self.ttl.ttl_for(TtlClass::for_shape(shape)),
        );
        Some(CacheHit {
            payload,
            tier: CacheTier::Durable,
        })
    }

    /// Write a generated or ingested result to both tiers.
    pub async fn set(
        &self,
        subject: &Subject,
        shape: Shape,
        payload: Value,
        featured: bool,
    ) {
        let key = subject.key().cache_key(shape);
        self.local.set(
            &key,
            payload.clone(),
            self.ttl.ttl_for(TtlClass::for_shape(shape)),
        );
        self.durable.set(subject, shape, payload, featured).await;
    }

    /// Local tier only; for payloads that must not outlive a restart.
    pub fn set_local(&self, subject: &Subject, shape: Shape, payload: Value, class: TtlClass) {
        let key = subject.key().cache_key(shape);
        self.local.set(&key, payload, self.ttl.ttl_for(class));
    }

    /// Drop `shape` for a subject from both tiers, including local entries
    /// aliased under the stored row's name or catalog id.
    pub async fn invalidate(&self, subject: &Subject, shape: Shape) {
        self.local.invalidate(&subject.key().cache_key(shape));
        let row = self.durable.invalidate(subject, shape).await;
        if !row.name.is_empty() {
            self.local
                .invalidate(&SubjectKey::from_name(&row.name).cache_key(shape));
        }
        for id in [row.catalog_id.as_deref(), subject.catalog_id.as_deref()]
            .into_iter()
            .flatten()
        {
            self.local
                .invalidate(&SubjectKey::from_catalog_id(id).cache_key(shape));
        }
    }

    pub async fn featured(&self) -> Vec<SubjectRecord> {
        self.durable.featured().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn store() -> CacheStore {
        CacheStore::new(
            LocalCache::new(),
            Arc::new(MemoryStore::new()),
            TtlPolicy::default(),
        )
    }

    #[tokio::test]
    async fn set_then_get_hits_local_tier() {
        let cache = store();
        let subject = Subject::named("Miles Davis");
        cache
            .set(&subject, Shape::Recommendations, json!([1, 2]), false)
            .await;

        let hit = cache
            .get(&Subject::named(" miles  DAVIS "), Shape::Recommendations)
            .await
            .unwrap();
        assert_eq!(hit.tier, CacheTier::Local);
        assert_eq!(hit.payload, json!([1, 2]));
    }

    #[tokio::test]
    async fn durable_hit_backfills_local() {
        let cache = store();
        let subject = Subject::named("Can");
        cache
            .set(&subject, Shape::Influences, json!({"root": {"name": "Can"}}), false)
            .await;
        cache
            .local()
            .invalidate(&subject.key().cache_key(Shape::Influences));

        let first = cache.get(&subject, Shape::Influences).await.unwrap();
        assert_eq!(first.tier, CacheTier::Durable);
        let second = cache.get(&subject, Shape::Influences).await.unwrap();
        assert_eq!(second.tier, CacheTier::Local);
    }

    #[tokio::test]
    async fn invalidate_clears_both_tiers() {
        let cache = store();
        let subject = Subject::named("Low");
        cache
            .set(&subject, Shape::Recommendations, json!([]), false)
            .await;
        cache.invalidate(&subject, Shape::Recommendations).await;
        assert!(cache.get(&subject, Shape::Recommendations).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_by_name_drops_catalog_id_alias() {
        let cache = store();
        let resolved = Subject::named("Steven Wilson").with_catalog_id("4X42");
        let by_id = Subject::by_catalog_id("4X42");
        cache
            .set(&resolved, Shape::Recommendations, json!(["old"]), false)
            .await;
        cache.set_local(&by_id, Shape::Recommendations, json!(["old"]), TtlClass::Recommendations);

        cache
            .invalidate(&Subject::named("steven wilson"), Shape::Recommendations)
            .await;
        assert!(cache.get(&by_id, Shape::Recommendations).await.is_none());
        assert!(cache.get(&resolved, Shape::Recommendations).await.is_none());
    }

    #[tokio::test]
    async fn shapes_do_not_collide() {
        let cache = store();
        let subject = Subject::named("Björk");
        cache
            .set(&subject, Shape::Recommendations, json!(["flat"]), false)
            .await;
        assert!(cache.get(&subject, Shape::Influences).await.is_none());
    }

    #[test]
    fn zero_ttl_means_unbounded() {
        let policy = TtlPolicy::from_secs(0, 60, 60, 60);
        assert!(policy.ttl_for(TtlClass::Suggestions).is_none());
        assert_eq!(
            policy.ttl_for(TtlClass::Fallback),
            Some(Duration::seconds(60))
        );
    }
}
