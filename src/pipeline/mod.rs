//! Generation orchestrator.
//!
//! Per subject key a request moves through
//! `uncached -> quota checked -> in flight -> normalized | fallen back -> cached`,
//! or stops at denied / failed without a cache write.
//!
//! - Cache hits are served to anyone, anonymous callers included.
//! - Only the caller that claims the in-flight ticket calls the generator;
//!   concurrent callers for the same key wait on that ticket.
//! - Generation runs on its own task with a timeout, so a caller giving up
//!   never leaves the ticket claimed.
//! - A failure is remembered and returned to later callers until a forced
//!   refresh or [`Pipeline::clear_failure`].
//! - Quota is charged after a cacheable result exists; placeholder results
//!   are free and stay in the local tier.

mod tickets;

pub use tickets::{FailureRecord, TicketState};

use crate::cache::{CacheStore, CacheTier, LocalCache, TtlClass, TtlPolicy};
use crate::catalog::CatalogService;
use crate::error::{GenerationError, PipelineError};
use crate::generate::{prompts, TextGenerator};
use crate::normalize::{self, decode, NormalizeOutcome, Recommendations};
use crate::quota::{DenyReason, QuotaDecision, QuotaGate, DEFAULT_GENERATION_LIMIT};
use crate::store::{QuotaStore, SubjectRepository};
use crate::subject::{normalize_name, ArtistProfile, Identity, Shape, Subject};
use crate::tree;
use crate::util::elapsed_ms;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tickets::{wait_for_ticket, Claim, FailureLog, Ticket, TicketBoard};

/// Everything the orchestrator needs from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub ttl: TtlPolicy,
    pub generation_limit: u32,
    pub admin_identities: Vec<String>,
    /// Bound on catalog lookup plus generation for one subject.
    pub generation_timeout: Duration,
    /// How long a concurrent caller waits on someone else's generation.
    pub in_flight_wait: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            ttl: TtlPolicy::default(),
            generation_limit: DEFAULT_GENERATION_LIMIT,
            admin_identities: Vec::new(),
            generation_timeout: Duration::from_secs(60),
            in_flight_wait: Duration::from_secs(75),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecommendationRequest {
    pub subject: Subject,
    pub identity: Identity,
    pub shape: Shape,
    pub force_refresh: bool,
}

impl RecommendationRequest {
    pub fn new(subject: Subject, identity: Identity) -> Self {
        Self {
            subject,
            identity,
            shape: Shape::Recommendations,
            force_refresh: false,
        }
    }

    pub fn with_shape(mut self, shape: Shape) -> Self {
        self.shape = shape;
        self
    }

    pub fn forced(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    fn key(&self) -> String {
        self.subject.key().cache_key(self.shape)
    }
}

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Local,
    Durable,
    #[default]
    Generated,
}

impl From<CacheTier> for ResultSource {
    fn from(tier: CacheTier) -> Self {
        match tier {
            CacheTier::Local => ResultSource::Local,
            CacheTier::Durable => ResultSource::Durable,
        }
    }
}

/// What callers get back; also the cached payload (minus `source`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationResult {
    pub artist: ArtistProfile,
    pub recommendations: Recommendations,
    pub outcome: NormalizeOutcome,
    pub generated_at: DateTime<Utc>,
    #[serde(skip)]
    pub source: ResultSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    pub cached: bool,
    pub tier: Option<CacheTier>,
    pub in_flight: bool,
    pub last_failure: Option<String>,
}

/// A cached result from a durable row flagged `featured`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeaturedResult {
    pub subject: Subject,
    pub shape: Shape,
    pub result: RecommendationResult,
}

/// Cheap to clone; clones share caches, tickets and failure memory.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

struct Inner {
    settings: PipelineSettings,
    cache: CacheStore,
    quota: QuotaGate,
    catalog: Arc<dyn CatalogService>,
    generator: Arc<dyn TextGenerator>,
    tickets: Arc<TicketBoard>,
    failures: FailureLog,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        local: LocalCache,
        subjects: Arc<dyn SubjectRepository>,
        quotas: Arc<dyn QuotaStore>,
        catalog: Arc<dyn CatalogService>,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        let cache = CacheStore::new(local, subjects, settings.ttl.clone());
        let quota = QuotaGate::new(quotas, settings.generation_limit)
            .with_admins(settings.admin_identities.iter().cloned());
        Self {
            inner: Arc::new(Inner {
                settings,
                cache,
                quota,
                catalog,
                generator,
                tickets: Arc::new(TicketBoard::default()),
                failures: FailureLog::default(),
            }),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn quota(&self) -> &QuotaGate {
        &self.inner.quota
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    /// Cached result, or a freshly generated one when the caller may generate.
    pub async fn get_recommendations(
        &self,
        request: RecommendationRequest,
    ) -> Result<RecommendationResult, PipelineError> {
        if request.subject.is_empty() {
            return Err(PipelineError::EmptySubject);
        }
        let inner = &self.inner;
        let key = request.key();

        // A caller who may not generate gets a plain read, not a wiped cache.
        let refresh = request.force_refresh && inner.quota.can_generate(&request.identity).await;
        if refresh {
            inner.failures.clear(&key);
            inner.cache.invalidate(&request.subject, request.shape).await;
            tracing::info!(subject = %key, "forced refresh");
        } else {
            if let Some(result) = inner.cached(&request.subject, request.shape).await {
                return Ok(result);
            }
            if let Some(failure) = inner.failures.get(&key) {
                return Err(PipelineError::PreviousFailure {
                    subject: request.subject.label().to_string(),
                    reason: failure.reason,
                });
            }
        }

        inner.authorize(&request.identity).await?;

        match inner.tickets.claim(&key) {
            Claim::Follower(rx) => {
                tracing::debug!(subject = %key, "waiting on in-flight generation");
                match wait_for_ticket(rx, inner.settings.in_flight_wait).await {
                    Some(TicketState::Done(result)) => Ok((*result).clone()),
                    Some(TicketState::Failed(reason)) => Err(PipelineError::Generation {
                        subject: request.subject.label().to_string(),
                        reason,
                    }),
                    Some(TicketState::InFlight) | None => Err(PipelineError::NotYetAvailable),
                }
            }
            Claim::Leader(ticket) => {
                // Someone may have finished, or failed, between our miss and our claim.
                if let Some(result) = inner.cached(&request.subject, request.shape).await {
                    ticket.resolve(TicketState::Done(Arc::new(result.clone())));
                    return Ok(result);
                }
                if !refresh {
                    if let Some(failure) = inner.failures.get(&key) {
                        ticket.resolve(TicketState::Failed(failure.reason.clone()));
                        return Err(PipelineError::PreviousFailure {
                            subject: request.subject.label().to_string(),
                            reason: failure.reason,
                        });
                    }
                }
                let subject = request.subject.label().to_string();
                let task_inner = Arc::clone(&self.inner);
                let handle = tokio::spawn(async move { task_inner.generate(request, ticket).await });
                handle.await.unwrap_or_else(|err| {
                    Err(PipelineError::Generation {
                        subject,
                        reason: format!("generation task failed: {err}"),
                    })
                })
            }
        }
    }

    pub async fn check_cache_status(&self, subject: &Subject, shape: Shape) -> CacheStatus {
        let key = subject.key().cache_key(shape);
        let tier = self.inner.cache.get(subject, shape).await.map(|hit| hit.tier);
        CacheStatus {
            cached: tier.is_some(),
            tier,
            in_flight: self.inner.tickets.is_in_flight(&key),
            last_failure: self.inner.failures.get(&key).map(|f| f.reason),
        }
    }

    /// Catalog search for type-ahead, cached under the short TTL class.
    /// Catalog errors give an empty list.
    pub async fn suggest_subjects(&self, query: &str, limit: usize) -> Vec<ArtistProfile> {
        let query = normalize_name(query);
        if query.is_empty() || limit == 0 {
            return Vec::new();
        }
        let key = format!("suggest:{limit}:{query}");
        let local = self.inner.cache.local();
        if let Some(cached) = local.get(&key) {
            if let Ok(profiles) = serde_json::from_value::<Vec<ArtistProfile>>(cached) {
                return profiles;
            }
        }

        match self.inner.catalog.search(&query, limit).await {
            Ok(mut profiles) => {
                profiles.truncate(limit);
                if let Ok(value) = serde_json::to_value(&profiles) {
                    local.set(
                        &key,
                        value,
                        self.inner.cache.ttl().ttl_for(TtlClass::Suggestions),
                    );
                }
                profiles
            }
            Err(err) => {
                tracing::warn!(query = %query, error = %err, "catalog search failed");
                Vec::new()
            }
        }
    }

    /// Store precomputed data without generating or charging quota. Accepts
    /// a full result document or bare list/tree JSON for `shape`.
    pub async fn ingest(
        &self,
        subject: &Subject,
        shape: Shape,
        payload: Value,
        featured: bool,
    ) -> Result<RecommendationResult, PipelineError> {
        if subject.is_empty() {
            return Err(PipelineError::EmptySubject);
        }
        let result = match serde_json::from_value::<RecommendationResult>(payload.clone()) {
            Ok(result) if result.recommendations.shape() == shape => result,
            Ok(result) => {
                return Err(PipelineError::InvalidPayload(format!(
                    "payload holds {} but {} was requested",
                    result.recommendations.shape().as_str(),
                    shape.as_str()
                )))
            }
            Err(_) => {
                let decoded = decode(&payload, shape).map_err(|reason| {
                    PipelineError::InvalidPayload(format!("{reason:?}"))
                })?;
                let artist = ArtistProfile::from_subject(subject);
                RecommendationResult {
                    recommendations: tree::assemble(decoded, shape, &artist),
                    artist,
                    outcome: NormalizeOutcome::Parsed,
                    generated_at: Utc::now(),
                    source: ResultSource::Generated,
                }
            }
        };

        let value = serde_json::to_value(&result)
            .map_err(|e| PipelineError::InvalidPayload(e.to_string()))?;
        self.inner.cache.set(subject, shape, value, featured).await;
        self.inner
            .failures
            .clear(&subject.key().cache_key(shape));
        tracing::info!(subject = subject.label(), shape = shape.as_str(), featured, "ingested");
        Ok(result)
    }

    /// Results for every durable row flagged `featured`.
    pub async fn featured(&self) -> Vec<FeaturedResult> {
        let mut out = Vec::new();
        for record in self.inner.cache.featured().await {
            let subject = Subject {
                name: Some(record.name.clone()).filter(|n| !n.is_empty()),
                catalog_id: record.catalog_id.clone(),
            };
            for (shape, stored) in &record.payloads {
                match serde_json::from_value::<RecommendationResult>(stored.payload.clone()) {
                    Ok(mut result) => {
                        result.source = ResultSource::Durable;
                        out.push(FeaturedResult {
                            subject: subject.clone(),
                            shape: *shape,
                            result,
                        });
                    }
                    Err(err) => {
                        tracing::warn!(subject = %record.name, error = %err, "skipping unreadable featured payload");
                    }
                }
            }
        }
        out.sort_by(|a, b| {
            a.subject
                .label()
                .cmp(b.subject.label())
                .then(a.shape.as_str().cmp(b.shape.as_str()))
        });
        out
    }

    /// Operator retry path: forget the last failure for a subject.
    pub fn clear_failure(&self, subject: &Subject, shape: Shape) -> bool {
        self.inner.failures.clear(&subject.key().cache_key(shape))
    }
}

impl Inner {
    async fn cached(&self, subject: &Subject, shape: Shape) -> Option<RecommendationResult> {
        let hit = self.cache.get(subject, shape).await?;
        match serde_json::from_value::<RecommendationResult>(hit.payload) {
            Ok(mut result) => {
                result.source = hit.tier.into();
                Some(result)
            }
            Err(err) => {
                tracing::warn!(subject = subject.label(), error = %err, "ignoring unreadable cache entry");
                None
            }
        }
    }

    async fn authorize(&self, identity: &Identity) -> Result<(), PipelineError> {
        match self.quota.check(identity).await {
            QuotaDecision::Allowed { .. } => Ok(()),
            QuotaDecision::Denied(DenyReason::Anonymous) => Err(PipelineError::NotCached),
            QuotaDecision::Denied(DenyReason::Exhausted { limit }) => {
                Err(PipelineError::QuotaExceeded { limit })
            }
            QuotaDecision::Denied(DenyReason::BackendUnavailable) => {
                Err(PipelineError::QuotaUnavailable)
            }
        }
    }

    /// Leader's half: runs on its own task and always resolves `ticket`.
    async fn generate(
        &self,
        request: RecommendationRequest,
        ticket: Ticket,
    ) -> Result<RecommendationResult, PipelineError> {
        let started = Instant::now();
        let timeout = self.settings.generation_timeout;
        tracing::info!(subject = ticket.key(), "generation started");

        let attempt = tokio::time::timeout(timeout, self.call_generator(&request)).await;
        let (artist, raw) = match attempt {
            Ok(Ok(done)) => done,
            Ok(Err(err)) => return Err(self.fail(&request, ticket, err.to_string(), started)),
            Err(_) => {
                let err = GenerationError::Timeout(timeout);
                return Err(self.fail(&request, ticket, err.to_string(), started));
            }
        };

        let normalized = normalize::normalize(&raw, request.shape);
        let result = RecommendationResult {
            recommendations: tree::assemble(normalized.decoded, request.shape, &artist),
            outcome: normalized.outcome,
            generated_at: Utc::now(),
            source: ResultSource::Generated,
            artist,
        };

        match serde_json::to_value(&result) {
            Ok(payload) if result.outcome.is_cacheable() => {
                let resolved = Subject {
                    name: request
                        .subject
                        .name
                        .clone()
                        .or_else(|| Some(result.artist.name.clone())),
                    catalog_id: request
                        .subject
                        .catalog_id
                        .clone()
                        .or_else(|| result.artist.id.clone()),
                };
                self.cache
                    .set(&resolved, request.shape, payload.clone(), false)
                    .await;
                if resolved.key() != request.subject.key() {
                    self.cache.set_local(
                        &request.subject,
                        request.shape,
                        payload,
                        TtlClass::for_shape(request.shape),
                    );
                }
                self.quota.record_generation(&request.identity).await;
            }
            Ok(payload) => {
                self.cache
                    .set_local(&request.subject, request.shape, payload, TtlClass::Fallback);
            }
            Err(err) => {
                tracing::warn!(subject = ticket.key(), error = %err, "result not cacheable");
            }
        }

        tracing::info!(
            subject = ticket.key(),
            outcome = ?result.outcome,
            records = result_len(&result.recommendations),
            elapsed_ms = elapsed_ms(started),
            "generation finished"
        );
        ticket.resolve(TicketState::Done(Arc::new(result.clone())));
        Ok(result)
    }

    async fn call_generator(
        &self,
        request: &RecommendationRequest,
    ) -> Result<(ArtistProfile, String), GenerationError> {
        let artist = self.resolve_artist(&request.subject).await;
        let system = prompts::system_prompt(request.shape);
        let user = prompts::user_prompt(request.shape, &artist);
        let raw = self.generator.generate(system, &user).await?;
        Ok((artist, raw))
    }

    /// Catalog profile; a failing or empty catalog degrades to the request.
    async fn resolve_artist(&self, subject: &Subject) -> ArtistProfile {
        let lookup = match subject.catalog_id.as_deref() {
            Some(id) => self.catalog.get_by_id(id).await,
            None => self.catalog.search_by_name(subject.label()).await,
        };
        match lookup {
            Ok(Some(artist)) => artist,
            Ok(None) => {
                tracing::debug!(subject = subject.label(), "artist not in catalog");
                ArtistProfile::from_subject(subject)
            }
            Err(err) => {
                tracing::warn!(subject = subject.label(), error = %err, "catalog lookup failed");
                ArtistProfile::from_subject(subject)
            }
        }
    }

    fn fail(
        &self,
        request: &RecommendationRequest,
        ticket: Ticket,
        reason: String,
        started: Instant,
    ) -> PipelineError {
        tracing::warn!(
            subject = ticket.key(),
            reason = %reason,
            elapsed_ms = elapsed_ms(started),
            "generation failed"
        );
        self.failures.record(ticket.key(), reason.clone());
        ticket.resolve(TicketState::Failed(reason.clone()));
        PipelineError::Generation {
            subject: request.subject.label().to_string(),
            reason,
        }
    }
}

fn result_len(recommendations: &Recommendations) -> usize {
    match recommendations {
        Recommendations::List(items) => items.len(),
        Recommendations::Tree(tree) => tree
            .influences
            .iter()
            .map(|node| node.node_count())
            .sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CatalogError;
    use crate::normalize::{InfluenceNode, RecommendationItem};
    use crate::store::{MemoryStore, QuotaRecord};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGenerator {
        calls: AtomicUsize,
        delay: Duration,
        reply: Result<String, ()>,
    }

    impl CountingGenerator {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                reply: Ok(reply.to_string()),
            })
        }

        fn slow(reply: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                reply: Ok(reply.to_string()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                reply: Err(()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TextGenerator for CountingGenerator {
        async fn generate(&self, _system: &str, _user: &str) -> Result<String, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.reply
                .clone()
                .map_err(|_| GenerationError::RateLimited { retries: 3 })
        }
    }

    #[derive(Default)]
    struct ScriptedCatalog {
        artists: Vec<ArtistProfile>,
        searches: AtomicUsize,
        broken: bool,
    }

    #[async_trait]
    impl CatalogService for ScriptedCatalog {
        async fn search(&self, query: &str, limit: usize) -> Result<Vec<ArtistProfile>, CatalogError> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            if self.broken {
                return Err(CatalogError::InvalidResponse("offline".into()));
            }
            let query = normalize_name(query);
            Ok(self
                .artists
                .iter()
                .filter(|a| normalize_name(&a.name).contains(&query))
                .take(limit)
                .cloned()
                .collect())
        }

        async fn get_by_id(&self, id: &str) -> Result<Option<ArtistProfile>, CatalogError> {
            Ok(self
                .artists
                .iter()
                .find(|a| a.id.as_deref() == Some(id))
                .cloned())
        }
    }

    fn steven_wilson() -> ArtistProfile {
        ArtistProfile {
            id: Some("4X42BfuhWCAZ2swiVze9O0".into()),
            name: "Steven Wilson".into(),
            genres: vec!["progressive rock".into()],
            popularity: Some(58),
            ..ArtistProfile::default()
        }
    }

    fn catalog() -> Arc<ScriptedCatalog> {
        Arc::new(ScriptedCatalog {
            artists: vec![steven_wilson()],
            ..ScriptedCatalog::default()
        })
    }

    const LIST_REPLY: &str = "Here are some picks:\n```json\n[\
        {\"name\": \"Opeth\", \"kind\": \"artist\", \"description\": \"Swedish prog metal\"},\
        {\"name\": \"Hand. Cannot. Erase.\", \"kind\": \"album\", \"description\": \"Concept album\", \"year\": 2015}\
        ]\n```";

    struct Harness {
        pipeline: Pipeline,
        store: Arc<MemoryStore>,
        generator: Arc<CountingGenerator>,
        catalog: Arc<ScriptedCatalog>,
    }

    fn harness_with(
        generator: Arc<CountingGenerator>,
        catalog: Arc<ScriptedCatalog>,
        settings: PipelineSettings,
    ) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::new(
            settings,
            LocalCache::new(),
            store.clone(),
            store.clone(),
            catalog.clone(),
            generator.clone(),
        );
        Harness {
            pipeline,
            store,
            generator,
            catalog,
        }
    }

    fn harness(generator: Arc<CountingGenerator>) -> Harness {
        harness_with(generator, catalog(), PipelineSettings::default())
    }

    fn request(name: &str, user: &str) -> RecommendationRequest {
        RecommendationRequest::new(Subject::named(name), Identity::user(user))
    }

    #[tokio::test]
    async fn end_to_end_generates_caches_and_charges_once() {
        let h = harness(CountingGenerator::replying(LIST_REPLY));

        let result = h
            .pipeline
            .get_recommendations(request("Steven Wilson", "ana"))
            .await
            .unwrap();

        assert_eq!(result.artist.name, "Steven Wilson");
        assert_eq!(result.source, ResultSource::Generated);
        assert_eq!(result.outcome, NormalizeOutcome::Parsed);
        let Recommendations::List(items) = &result.recommendations else {
            panic!("expected list");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(h.catalog.searches.load(Ordering::SeqCst), 1);
        assert_eq!(h.generator.calls(), 1);

        // Both tiers written
        let key = Subject::named("Steven Wilson")
            .key()
            .cache_key(Shape::Recommendations);
        assert!(h.pipeline.cache().local().get(&key).is_some());
        let row = h.store.find_by_name("steven wilson").await.unwrap().unwrap();
        assert!(row.payload(Shape::Recommendations).is_some());
        assert_eq!(row.catalog_id.as_deref(), Some("4X42BfuhWCAZ2swiVze9O0"));

        let quota = h.pipeline.quota().record("ana").await.unwrap().unwrap();
        assert_eq!(quota.count, 1);

        // Second request is a cache hit, no new call or charge
        let again = h
            .pipeline
            .get_recommendations(request(" steven  WILSON ", "ana"))
            .await
            .unwrap();
        assert_eq!(again.source, ResultSource::Local);
        assert_eq!(h.generator.calls(), 1);
        assert_eq!(h.pipeline.quota().record("ana").await.unwrap().unwrap().count, 1);
    }

    #[tokio::test]
    async fn concurrent_requests_call_generator_once() {
        let h = harness(CountingGenerator::slow(LIST_REPLY, Duration::from_millis(50)));

        let (a, b) = tokio::join!(
            h.pipeline.get_recommendations(request("Steven Wilson", "ana")),
            h.pipeline.get_recommendations(request("steven wilson", "bo")),
        );

        assert_eq!(a.unwrap().recommendations, b.unwrap().recommendations);
        assert_eq!(h.generator.calls(), 1);
        assert!(h.pipeline.inner.tickets.is_empty());
    }

    #[tokio::test]
    async fn many_callers_share_one_generation() {
        let h = harness(CountingGenerator::slow(LIST_REPLY, Duration::from_millis(50)));

        let calls = (0..8).map(|i| {
            h.pipeline
                .get_recommendations(request("Porcupine Tree", &format!("user-{i}")))
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(h.generator.calls(), 1);
    }

    #[tokio::test]
    async fn slow_generation_gives_waiters_not_yet_available() {
        let settings = PipelineSettings {
            in_flight_wait: Duration::from_millis(10),
            ..PipelineSettings::default()
        };
        let h = harness_with(
            CountingGenerator::slow(LIST_REPLY, Duration::from_millis(200)),
            catalog(),
            settings,
        );

        let (a, b) = tokio::join!(
            h.pipeline.get_recommendations(request("Steven Wilson", "ana")),
            h.pipeline.get_recommendations(request("Steven Wilson", "bo")),
        );
        assert!(a.is_ok());
        assert_eq!(b.unwrap_err(), PipelineError::NotYetAvailable);
        assert_eq!(h.generator.calls(), 1);
    }

    #[tokio::test]
    async fn anonymous_miss_is_not_cached_but_hit_is_served() {
        let h = harness(CountingGenerator::replying(LIST_REPLY));
        let anon = RecommendationRequest::new(Subject::named("Low"), Identity::Anonymous);

        let err = h.pipeline.get_recommendations(anon.clone()).await.unwrap_err();
        assert_eq!(err, PipelineError::NotCached);
        assert_eq!(err.status_code(), 404);
        assert_eq!(h.generator.calls(), 0);

        h.pipeline
            .ingest(
                &Subject::named("Low"),
                Shape::Recommendations,
                json!([{"name": "Codeine", "kind": "artist", "description": "slowcore"}]),
                false,
            )
            .await
            .unwrap();
        let result = h.pipeline.get_recommendations(anon).await.unwrap();
        assert_eq!(result.source, ResultSource::Local);
    }

    #[tokio::test]
    async fn exhausted_quota_is_forbidden() {
        let h = harness(CountingGenerator::replying(LIST_REPLY));
        let mut record = QuotaRecord::new("ana", 3);
        record.count = 3;
        h.store.save(record).await.unwrap();

        let err = h
            .pipeline
            .get_recommendations(request("Steven Wilson", "ana"))
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::QuotaExceeded { limit: 3 });
        assert_eq!(err.status_code(), 403);
        assert_eq!(h.generator.calls(), 0);
    }

    #[tokio::test]
    async fn failure_is_not_retried_until_forced_or_cleared() {
        let h = harness(CountingGenerator::failing());
        let req = request("Steven Wilson", "ana");

        let first = h.pipeline.get_recommendations(req.clone()).await.unwrap_err();
        assert!(matches!(first, PipelineError::Generation { .. }));
        let second = h.pipeline.get_recommendations(req.clone()).await.unwrap_err();
        assert!(matches!(second, PipelineError::PreviousFailure { .. }));
        assert_eq!(h.generator.calls(), 1);

        let _ = h.pipeline.get_recommendations(req.clone().forced(true)).await;
        assert_eq!(h.generator.calls(), 2);

        assert!(h.pipeline.clear_failure(&req.subject, req.shape));
        let _ = h.pipeline.get_recommendations(req).await;
        assert_eq!(h.generator.calls(), 3);

        // Failures never charge quota
        assert!(h.pipeline.quota().record("ana").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn timeout_resolves_ticket_and_records_failure() {
        let settings = PipelineSettings {
            generation_timeout: Duration::from_millis(30),
            ..PipelineSettings::default()
        };
        let h = harness_with(
            CountingGenerator::slow(LIST_REPLY, Duration::from_secs(30)),
            catalog(),
            settings,
        );
        let req = request("Steven Wilson", "ana");

        match h.pipeline.get_recommendations(req.clone()).await {
            Err(PipelineError::Generation { reason, .. }) => assert!(reason.contains("timed out")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.pipeline.inner.tickets.is_empty());
        let status = h.pipeline.check_cache_status(&req.subject, req.shape).await;
        assert!(!status.cached);
        assert!(status.last_failure.is_some());
    }

    #[tokio::test]
    async fn fallback_stays_local_and_is_free() {
        let h = harness(CountingGenerator::replying("zzkx qwv ## ~~ plorp"));

        let result = h
            .pipeline
            .get_recommendations(request("Steven Wilson", "ana"))
            .await
            .unwrap();
        assert_eq!(result.outcome, NormalizeOutcome::Fallback);
        assert!(!result.recommendations.is_empty());

        assert!(h.store.find_by_name("steven wilson").await.unwrap().is_none());
        assert!(h.pipeline.quota().record("ana").await.unwrap().is_none());

        let again = h
            .pipeline
            .get_recommendations(request("Steven Wilson", "ana"))
            .await
            .unwrap();
        assert_eq!(again.source, ResultSource::Local);
        assert_eq!(h.generator.calls(), 1);
    }

    #[tokio::test]
    async fn influences_become_a_tree_rooted_at_the_subject() {
        let reply = serde_json::to_string(
            &["Pink Floyd", "King Crimson", "Talk Talk", "XTC", "Yes", "Genesis", "Camel"]
                .iter()
                .map(|n| InfluenceNode::named(*n))
                .collect::<Vec<_>>(),
        )
        .unwrap();
        let h = harness(CountingGenerator::replying(&reply));

        let result = h
            .pipeline
            .get_recommendations(request("Steven Wilson", "ana").with_shape(Shape::Influences))
            .await
            .unwrap();
        let Recommendations::Tree(tree) = result.recommendations else {
            panic!("expected tree");
        };
        assert_eq!(tree.root.name, "Steven Wilson");
        assert!((2..=4).contains(&tree.influences.len()));
        let total: usize = tree.influences.iter().map(|n| n.node_count()).sum();
        assert_eq!(total, 7);

        // The flat list for the same subject is a separate entry
        let status = h
            .pipeline
            .check_cache_status(&Subject::named("Steven Wilson"), Shape::Recommendations)
            .await;
        assert!(!status.cached);
    }

    #[tokio::test]
    async fn catalog_outage_still_generates() {
        let broken = Arc::new(ScriptedCatalog {
            broken: true,
            ..ScriptedCatalog::default()
        });
        let h = harness_with(
            CountingGenerator::replying(LIST_REPLY),
            broken,
            PipelineSettings::default(),
        );
        let result = h
            .pipeline
            .get_recommendations(request("Steven Wilson", "ana"))
            .await
            .unwrap();
        assert_eq!(result.artist.name, "Steven Wilson");
        assert!(result.artist.id.is_none());
    }

    #[tokio::test]
    async fn suggestions_are_cached_briefly() {
        let h = harness(CountingGenerator::replying(LIST_REPLY));
        let first = h.pipeline.suggest_subjects("steven", 5).await;
        let second = h.pipeline.suggest_subjects("  Steven ", 5).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
        assert_eq!(h.catalog.searches.load(Ordering::SeqCst), 1);
        assert!(h.pipeline.suggest_subjects("   ", 5).await.is_empty());
    }

    #[tokio::test]
    async fn ingest_validates_and_feeds_featured() {
        let h = harness(CountingGenerator::replying(LIST_REPLY));

        let bad = h
            .pipeline
            .ingest(&Subject::named("Can"), Shape::Recommendations, json!({"answer": 42}), true)
            .await
            .unwrap_err();
        assert_eq!(bad.status_code(), 400);

        let items = vec![RecommendationItem::artist("Neu!", "motorik")];
        h.pipeline
            .ingest(&Subject::named("Can"), Shape::Recommendations, json!(items), true)
            .await
            .unwrap();
        h.pipeline
            .ingest(
                &Subject::named("Low"),
                Shape::Recommendations,
                json!([{"name": "Codeine", "kind": "artist", "description": "slowcore"}]),
                false,
            )
            .await
            .unwrap();

        let featured = h.pipeline.featured().await;
        assert_eq!(featured.len(), 1);
        assert_eq!(featured[0].subject.label(), "Can");
        assert_eq!(featured[0].result.source, ResultSource::Durable);
        assert_eq!(h.generator.calls(), 0);
    }

    #[tokio::test]
    async fn empty_subject_is_rejected() {
        let h = harness(CountingGenerator::replying(LIST_REPLY));
        let err = h
            .pipeline
            .get_recommendations(request("   ", "ana"))
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::EmptySubject);
    }

    /// Quota store whose reads for one identity are slow.
    struct SlowQuotaReads {
        inner: MemoryStore,
        slow_identity: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl QuotaStore for SlowQuotaReads {
        async fn load(&self, identity: &str) -> Result<Option<QuotaRecord>, crate::error::StoreError> {
            if identity == self.slow_identity {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.load(identity).await
        }

        async fn increment(
            &self,
            identity: &str,
            default_limit: u32,
        ) -> Result<QuotaRecord, crate::error::StoreError> {
            self.inner.increment(identity, default_limit).await
        }

        async fn save(&self, record: QuotaRecord) -> Result<(), crate::error::StoreError> {
            self.inner.save(record).await
        }
    }

    #[tokio::test]
    async fn late_claimer_sees_failure_instead_of_regenerating() {
        let generator = Arc::new(CountingGenerator {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(20),
            reply: Err(()),
        });
        let quotas = Arc::new(SlowQuotaReads {
            inner: MemoryStore::new(),
            slow_identity: "bo",
            delay: Duration::from_millis(150),
        });
        let pipeline = Pipeline::new(
            PipelineSettings::default(),
            LocalCache::new(),
            Arc::new(MemoryStore::new()),
            quotas,
            catalog(),
            generator.clone(),
        );

        let (a, b) = tokio::join!(
            pipeline.get_recommendations(request("Steven Wilson", "ana")),
            pipeline.get_recommendations(request("Steven Wilson", "bo")),
        );

        assert!(matches!(a, Err(PipelineError::Generation { .. })));
        assert!(matches!(b, Err(PipelineError::PreviousFailure { .. })));
        assert_eq!(generator.calls(), 1);
        assert!(pipeline.inner.tickets.is_empty());
    }

    #[tokio::test]
    async fn forced_refresh_by_catalog_id_regenerates() {
        let h = harness(CountingGenerator::replying(LIST_REPLY));
        let by_id = Subject::by_catalog_id("4X42BfuhWCAZ2swiVze9O0");
        h.pipeline
            .ingest(
                &by_id,
                Shape::Recommendations,
                json!([{"name": "Blackfield", "kind": "artist", "description": "side project"}]),
                false,
            )
            .await
            .unwrap();

        let refreshed = h
            .pipeline
            .get_recommendations(
                RecommendationRequest::new(by_id.clone(), Identity::user("ana")).forced(true),
            )
            .await
            .unwrap();

        assert_eq!(h.generator.calls(), 1);
        assert_eq!(refreshed.source, ResultSource::Generated);
        assert_eq!(refreshed.artist.name, "Steven Wilson");
    }

    #[tokio::test]
    async fn forced_refresh_by_name_drops_catalog_id_alias() {
        let h = harness(CountingGenerator::replying(LIST_REPLY));
        let by_id = Subject::by_catalog_id("4X42BfuhWCAZ2swiVze9O0");

        let first = h
            .pipeline
            .get_recommendations(RecommendationRequest::new(by_id.clone(), Identity::user("ana")))
            .await
            .unwrap();
        let fresh = h
            .pipeline
            .get_recommendations(request("Steven Wilson", "ana").forced(true))
            .await
            .unwrap();
        assert_eq!(h.generator.calls(), 2);
        assert_ne!(first.generated_at, fresh.generated_at);

        let again = h
            .pipeline
            .get_recommendations(RecommendationRequest::new(by_id, Identity::user("ana")))
            .await
            .unwrap();
        assert_eq!(again.generated_at, fresh.generated_at);
        assert_eq!(h.generator.calls(), 2);
    }
}
