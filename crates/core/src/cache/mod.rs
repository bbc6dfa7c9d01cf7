//! Three-tier response cache.
//!
//! Lookups try L1 (exact text, one conversation), then L2 (pattern, one contact), then L3
//! (semantic, one tenant). Hits on a slower tier are promoted into the faster ones. Backend
//! failures are counted and treated as misses.

pub mod keys;
pub mod semantic;
pub mod store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::domain::cache::{CacheEntry, CacheTier, CachedResponse};
use crate::domain::session::{ContactId, SessionId, TenantId};

pub use keys::{has_volatile_content, normalize_exact, normalize_pattern};
pub use semantic::{cosine_similarity, EmbedError, Embedder, HashingEmbedder, SemanticMatcher};
pub use store::{CacheStore, CacheStoreError, InMemoryCacheStore, InMemoryCacheStoreConfig, TierCounts};

/// Who a cached reply may be served to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheScope {
    pub tenant_id: TenantId,
    pub contact_id: ContactId,
    pub conversation_id: SessionId,
}

/// Tenant-resolved lifetimes and matching threshold.
#[derive(Clone, Debug, PartialEq)]
pub struct CachePolicy {
    pub l1_ttl: Duration,
    pub l2_ttl: Duration,
    pub l3_ttl: Duration,
    pub similarity_threshold: f32,
}

impl CachePolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            l1_ttl: seconds(config.l1_ttl_secs),
            l2_ttl: seconds(config.l2_ttl_secs),
            l3_ttl: seconds(config.l3_ttl_secs),
            similarity_threshold: config.similarity_threshold,
        }
    }

    pub fn ttl(&self, tier: CacheTier) -> Duration {
        match tier {
            CacheTier::L1 => self.l1_ttl,
            CacheTier::L2 => self.l2_ttl,
            CacheTier::L3 => self.l3_ttl,
        }
    }
}

const MAX_TTL_SECS: i64 = 10 * 365 * 24 * 60 * 60;

pub(crate) fn seconds(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(MAX_TTL_SECS).min(MAX_TTL_SECS))
}

#[derive(Clone, Debug, PartialEq)]
pub struct CacheHit {
    pub entry: CacheEntry,
    pub tier: CacheTier,
    pub similarity: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CacheLookup {
    Hit(CacheHit),
    Miss,
}

impl CacheLookup {
    pub fn hit(self) -> Option<CacheHit> {
        match self {
            Self::Hit(hit) => Some(hit),
            Self::Miss => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheStats {
    pub entries: TierCounts,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub hit_rate_percent: f64,
}

#[derive(Debug, Default)]
struct Counters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    l3_hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn hit(&self, tier: CacheTier) {
        let counter = match tier {
            CacheTier::L1 => &self.l1_hits,
            CacheTier::L2 => &self.l2_hits,
            CacheTier::L3 => &self.l3_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    embedder: Arc<dyn Embedder>,
    enabled: bool,
    relaxed_similarity_threshold: f32,
    counters: Arc<Counters>,
}

impl ResponseCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        embedder: Arc<dyn Embedder>,
        enabled: bool,
        relaxed_similarity_threshold: f32,
    ) -> Self {
        Self {
            store,
            embedder,
            enabled,
            relaxed_similarity_threshold,
            counters: Arc::new(Counters::default()),
        }
    }

    /// In-memory store and local hashing embedder sized from config.
    pub fn in_memory(config: &CacheConfig) -> Self {
        let store = InMemoryCacheStore::new(InMemoryCacheStoreConfig {
            l1_max_entries: config.l1_max_entries,
            l2_max_entries: config.l2_max_entries,
            l1_max_ttl: std::time::Duration::from_secs(config.l1_ttl_secs),
            l2_max_ttl: std::time::Duration::from_secs(config.l2_ttl_secs),
            l3_window_size: config.l3_window_size,
        });
        Self::new(
            Arc::new(store),
            Arc::new(HashingEmbedder::new(config.embedding_dimensions)),
            config.enabled,
            config.relaxed_similarity_threshold,
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn lookup(&self, query: &str, scope: &CacheScope, policy: &CachePolicy) -> CacheLookup {
        self.lookup_at(query, scope, policy, Utc::now()).await
    }

    pub async fn lookup_at(
        &self,
        query: &str,
        scope: &CacheScope,
        policy: &CachePolicy,
        now: DateTime<Utc>,
    ) -> CacheLookup {
        if !self.enabled {
            return CacheLookup::Miss;
        }
        let normalized = normalize_exact(query);
        if normalized.is_empty() {
            return self.miss();
        }

        let l1_key = keys::l1_key(&normalized, &scope.tenant_id, &scope.conversation_id);
        if let Some(entry) = self.keyed_entry(CacheTier::L1, &l1_key, now).await {
            return self.hit(entry, CacheTier::L1, 1.0).await;
        }

        let pattern = normalize_pattern(query);
        let l2_key = keys::l2_key(&pattern, &scope.tenant_id, &scope.contact_id);
        if let Some(entry) = self.keyed_entry(CacheTier::L2, &l2_key, now).await {
            self.promote(&entry, CacheTier::L1, l1_key, scope, policy, now).await;
            return self.hit(entry, CacheTier::L2, 1.0).await;
        }

        if let Some(found) = self.semantic(query, scope, policy.similarity_threshold, now).await {
            self.promote(&found.entry, CacheTier::L2, l2_key, scope, policy, now).await;
            self.promote(&found.entry, CacheTier::L1, l1_key, scope, policy, now).await;
            return self.hit(found.entry, CacheTier::L3, found.similarity).await;
        }

        self.miss()
    }

    /// L3-only lookup at the relaxed threshold, for replies while the model is unreachable.
    /// Does not promote and does not count toward hit statistics.
    pub async fn lookup_relaxed(
        &self,
        query: &str,
        scope: &CacheScope,
        now: DateTime<Utc>,
    ) -> Option<CacheHit> {
        if !self.enabled {
            return None;
        }
        self.semantic(query, scope, self.relaxed_similarity_threshold, now).await.map(|found| {
            CacheHit { entry: found.entry, tier: CacheTier::L3, similarity: found.similarity }
        })
    }

    /// Writes a reply into every tier for the given scope.
    pub async fn store(
        &self,
        query: &str,
        scope: &CacheScope,
        response: CachedResponse,
        policy: &CachePolicy,
        now: DateTime<Utc>,
    ) {
        if !self.enabled {
            return;
        }
        let normalized = normalize_exact(query);
        if normalized.is_empty() {
            return;
        }

        let base = |tier: CacheTier, key: String, embedding: Option<Vec<f32>>| CacheEntry {
            tier,
            key,
            tenant_id: scope.tenant_id.clone(),
            contact_id: scope.contact_id.clone(),
            query_text: normalized.clone(),
            embedding,
            payload: response.clone(),
            created_at: now,
            expires_at: now + policy.ttl(tier),
            hit_count: 0,
        };

        let mut entries = vec![
            base(
                CacheTier::L1,
                keys::l1_key(&normalized, &scope.tenant_id, &scope.conversation_id),
                None,
            ),
            base(
                CacheTier::L2,
                keys::l2_key(&normalize_pattern(query), &scope.tenant_id, &scope.contact_id),
                None,
            ),
        ];
        match self.embedder.embed(&normalized) {
            Ok(embedding) => entries.push(base(
                CacheTier::L3,
                keys::l3_key(&normalized, &scope.tenant_id),
                Some(embedding),
            )),
            Err(error) => {
                debug!(event_name = "cache.embed.skipped", tenant_id = %scope.tenant_id, error = %error, "embedding failed; skipping semantic tier");
            }
        }

        for entry in entries {
            let tier = entry.tier;
            if let Err(error) = self.store.put(entry).await {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_name = "cache.store.failed",
                    tier = tier.as_str(),
                    tenant_id = %scope.tenant_id,
                    error = %error,
                    "cache write failed"
                );
            }
        }
    }

    pub async fn invalidate_tenant(&self, tenant_id: &TenantId) -> Result<(), CacheStoreError> {
        self.store.invalidate_tenant(tenant_id).await
    }

    pub async fn invalidate_contact(
        &self,
        tenant_id: &TenantId,
        contact_id: &ContactId,
    ) -> Result<(), CacheStoreError> {
        self.store.invalidate_contact(tenant_id, contact_id).await
    }

    pub async fn stats(&self) -> CacheStats {
        let l1_hits = self.counters.l1_hits.load(Ordering::Relaxed);
        let l2_hits = self.counters.l2_hits.load(Ordering::Relaxed);
        let l3_hits = self.counters.l3_hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let hits = l1_hits + l2_hits + l3_hits;
        let total = hits + misses;

        CacheStats {
            entries: self.store.entry_counts().await,
            l1_hits,
            l2_hits,
            l3_hits,
            misses,
            errors: self.counters.errors.load(Ordering::Relaxed),
            hit_rate_percent: if total > 0 { hits as f64 / total as f64 * 100.0 } else { 0.0 },
        }
    }

    async fn keyed_entry(&self, tier: CacheTier, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        match self.store.get(tier, key).await {
            Ok(Some(entry)) if !entry.is_expired(now) => Some(entry),
            Ok(_) => None,
            Err(error) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(event_name = "cache.lookup.failed", tier = tier.as_str(), error = %error, "cache read failed; treating as miss");
                None
            }
        }
    }

    async fn semantic(
        &self,
        query: &str,
        scope: &CacheScope,
        threshold: f32,
        now: DateTime<Utc>,
    ) -> Option<semantic::SemanticMatch> {
        let embedding = match self.embedder.embed(query) {
            Ok(embedding) => embedding,
            Err(error) => {
                debug!(event_name = "cache.embed.skipped", tenant_id = %scope.tenant_id, error = %error, "embedding failed; skipping semantic tier");
                return None;
            }
        };

        match self.store.semantic_window(&scope.tenant_id).await {
            Ok(window) => SemanticMatcher::best_match(&embedding, &window, threshold, now),
            Err(error) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(event_name = "cache.lookup.failed", tier = "l3", error = %error, "semantic window unavailable; treating as miss");
                None
            }
        }
    }

    async fn promote(
        &self,
        source: &CacheEntry,
        tier: CacheTier,
        key: String,
        scope: &CacheScope,
        policy: &CachePolicy,
        now: DateTime<Utc>,
    ) {
        let promoted = source.promoted(tier, key, &scope.contact_id, policy.ttl(tier), now);
        if let Err(error) = self.store.put(promoted).await {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!(event_name = "cache.promote.failed", tier = tier.as_str(), error = %error, "cache promotion failed");
        }
    }

    async fn hit(&self, entry: CacheEntry, tier: CacheTier, similarity: f32) -> CacheLookup {
        self.counters.hit(tier);
        if let Err(error) = self.store.record_hit(&entry).await {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!(event_name = "cache.hit_count.failed", tier = tier.as_str(), error = %error, "could not record cache hit");
        }
        debug!(event_name = "cache.hit", tier = tier.as_str(), similarity, "cache hit");
        CacheLookup::Hit(CacheHit { entry, tier, similarity })
    }

    fn miss(&self) -> CacheLookup {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        CacheLookup::Miss
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    use super::{
        CacheLookup, CachePolicy, CacheScope, CacheStore, CacheStoreError, HashingEmbedder,
        ResponseCache, TierCounts,
    };
    use crate::config::CacheConfig;
    use crate::domain::cache::{CacheEntry, CacheTier, CachedResponse};
    use crate::domain::classification::{Intent, IntentScore, StoredClassification};
    use crate::domain::session::{ContactId, SessionId, TenantId};

    fn config() -> CacheConfig {
        crate::config::AppConfig::default().cache
    }

    fn scope(contact: &str, session: &str) -> CacheScope {
        CacheScope {
            tenant_id: TenantId("acme".to_owned()),
            contact_id: ContactId(contact.to_owned()),
            conversation_id: SessionId(session.to_owned()),
        }
    }

    fn response(reply: &str) -> CachedResponse {
        CachedResponse {
            reply: reply.to_owned(),
            classification: StoredClassification {
                primary: IntentScore::new(Intent::Qualify, 0.82),
                alternatives: vec![],
            },
        }
    }

    #[tokio::test]
    async fn identical_query_in_same_conversation_hits_l1() {
        let cache = ResponseCache::in_memory(&config());
        let policy = CachePolicy::from_config(&config());
        let scope = scope("C-1", "S-1");
        let now = Utc::now();

        assert_eq!(cache.lookup_at("Are you open Sunday?", &scope, &policy, now).await, CacheLookup::Miss);
        cache.store("Are you open Sunday?", &scope, response("We are."), &policy, now).await;

        let hit = cache
            .lookup_at("are you open  sunday", &scope, &policy, now)
            .await
            .hit()
            .expect("l1 hit");
        assert_eq!(hit.tier, CacheTier::L1);
        assert_eq!(hit.entry.payload.reply, "We are.");
    }

    #[tokio::test]
    async fn same_question_in_new_sessions_hits_l2_for_the_contact() {
        let cache = ResponseCache::in_memory(&config());
        let policy = CachePolicy::from_config(&config());
        let now = Utc::now();
        let question = "What's your return policy?";

        cache.store(question, &scope("C-1", "S-1"), response("30 days."), &policy, now).await;

        for session in ["S-2", "S-3"] {
            let hit = cache
                .lookup_at(question, &scope("C-1", session), &policy, now)
                .await
                .hit()
                .expect("l2 hit");
            assert_eq!(hit.tier, CacheTier::L2);
        }

        let stats = cache.stats().await;
        assert_eq!(stats.l2_hits, 2);
        assert_eq!(stats.misses, 0);
    }

    #[tokio::test]
    async fn semantic_hit_is_promoted_to_faster_tiers() {
        let cache = ResponseCache::in_memory(&config());
        let policy = CachePolicy::from_config(&config());
        let now = Utc::now();

        cache
            .store("do you have three bedroom homes in austin", &scope("C-1", "S-1"), response("Yes."), &policy, now)
            .await;

        let other = scope("C-2", "S-9");
        let hit = cache
            .lookup_at("Do you have three bedroom homes in Austin please", &other, &policy, now)
            .await
            .hit()
            .expect("l3 hit");
        assert_eq!(hit.tier, CacheTier::L3);
        assert!(hit.similarity >= policy.similarity_threshold);
        assert!(hit.entry.expires_at <= now + policy.l3_ttl);

        let again = cache
            .lookup_at("Do you have three bedroom homes in Austin please", &other, &policy, now)
            .await
            .hit()
            .expect("promoted hit");
        assert_eq!(again.tier, CacheTier::L1);
        assert!(again.entry.expires_at <= hit.entry.expires_at);
    }

    #[tokio::test]
    async fn promoted_copies_belong_to_the_requesting_contact() {
        let cache = ResponseCache::in_memory(&config());
        let policy = CachePolicy::from_config(&config());
        let now = Utc::now();
        let question = "Do you have three bedroom homes in Austin please";
        cache
            .store("do you have three bedroom homes in austin", &scope("C-1", "S-1"), response("Yes."), &policy, now)
            .await;

        let other = scope("C-2", "S-9");
        let first = cache.lookup_at(question, &other, &policy, now).await.hit().expect("l3 hit");
        assert_eq!(first.tier, CacheTier::L3);

        cache.invalidate_contact(&other.tenant_id, &other.contact_id).await.expect("invalidate");
        let after = cache.lookup_at(question, &other, &policy, now).await.hit().expect("source still cached");
        assert_eq!(after.tier, CacheTier::L3);
        assert_eq!(after.entry.contact_id, ContactId("C-1".to_owned()));
    }

    #[tokio::test]
    async fn unrelated_query_misses_and_relaxed_lookup_is_broader() {
        let cache = ResponseCache::in_memory(&config());
        let policy = CachePolicy::from_config(&config());
        let now = Utc::now();
        cache.store("what are your office hours", &scope("C-1", "S-1"), response("9-5."), &policy, now).await;

        let other = scope("C-2", "S-2");
        assert_eq!(
            cache.lookup_at("I want to sell my condo", &other, &policy, now).await,
            CacheLookup::Miss
        );
        assert!(cache.lookup_relaxed("what are your office hours", &other, now).await.is_some());
    }

    #[tokio::test]
    async fn expired_entries_are_never_returned() {
        let cache = ResponseCache::in_memory(&config());
        let policy = CachePolicy::from_config(&config());
        let scope = scope("C-1", "S-1");
        let stored_at = Utc::now();
        cache.store("open house times?", &scope, response("Sat 1-3."), &policy, stored_at).await;

        let later = stored_at + policy.l3_ttl + Duration::seconds(1);
        assert_eq!(cache.lookup_at("open house times?", &scope, &policy, later).await, CacheLookup::Miss);
    }

    #[tokio::test]
    async fn disabled_cache_never_stores_or_hits() {
        let mut disabled = config();
        disabled.enabled = false;
        let cache = ResponseCache::in_memory(&disabled);
        let policy = CachePolicy::from_config(&disabled);
        let scope = scope("C-1", "S-1");
        let now = Utc::now();

        cache.store("hello", &scope, response("hi"), &policy, now).await;
        assert_eq!(cache.lookup_at("hello", &scope, &policy, now).await, CacheLookup::Miss);
        assert_eq!(cache.stats().await.entries, TierCounts::default());
    }

    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _: CacheTier, _: &str) -> Result<Option<CacheEntry>, CacheStoreError> {
            Err(CacheStoreError::Unavailable("connection refused".to_owned()))
        }
        async fn put(&self, _: CacheEntry) -> Result<(), CacheStoreError> {
            Err(CacheStoreError::Unavailable("connection refused".to_owned()))
        }
        async fn semantic_window(&self, _: &TenantId) -> Result<Vec<CacheEntry>, CacheStoreError> {
            Err(CacheStoreError::Unavailable("connection refused".to_owned()))
        }
        async fn record_hit(&self, _: &CacheEntry) -> Result<(), CacheStoreError> {
            Ok(())
        }
        async fn invalidate_tenant(&self, _: &TenantId) -> Result<(), CacheStoreError> {
            Ok(())
        }
        async fn invalidate_contact(&self, _: &TenantId, _: &ContactId) -> Result<(), CacheStoreError> {
            Ok(())
        }
        async fn entry_counts(&self) -> TierCounts {
            TierCounts::default()
        }
    }

    #[tokio::test]
    async fn backend_failures_degrade_to_miss_and_are_counted() {
        let cache =
            ResponseCache::new(Arc::new(BrokenStore), Arc::new(HashingEmbedder::new(64)), true, 0.7);
        let policy = CachePolicy::from_config(&config());
        let scope = scope("C-1", "S-1");
        let now = Utc::now();

        cache.store("hello there", &scope, response("hi"), &policy, now).await;
        assert_eq!(cache.lookup_at("hello there", &scope, &policy, now).await, CacheLookup::Miss);

        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.errors, 6);
    }

    #[tokio::test]
    async fn tenant_invalidation_drops_all_tiers() {
        let cache = ResponseCache::in_memory(&config());
        let policy = CachePolicy::from_config(&config());
        let scope = scope("C-1", "S-1");
        let now = Utc::now();
        cache.store("pet policy?", &scope, response("Cats ok."), &policy, now).await;

        cache.invalidate_tenant(&scope.tenant_id).await.expect("invalidate");
        assert_eq!(cache.lookup_at("pet policy?", &scope, &policy, now).await, CacheLookup::Miss);
    }
}
