use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::domain::cache::{CacheEntry, CacheTier};
use crate::domain::session::{ContactId, TenantId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CacheStoreError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cache invalidation failed: {0}")]
    Invalidation(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TierCounts {
    pub l1: u64,
    pub l2: u64,
    pub l3: u64,
}

/// Storage behind the response cache. L1/L2 are key lookups; L3 is a per-tenant
/// window scanned by the semantic matcher.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, tier: CacheTier, key: &str) -> Result<Option<CacheEntry>, CacheStoreError>;
    async fn put(&self, entry: CacheEntry) -> Result<(), CacheStoreError>;
    async fn semantic_window(&self, tenant_id: &TenantId)
        -> Result<Vec<CacheEntry>, CacheStoreError>;
    async fn record_hit(&self, entry: &CacheEntry) -> Result<(), CacheStoreError>;
    async fn invalidate_tenant(&self, tenant_id: &TenantId) -> Result<(), CacheStoreError>;
    async fn invalidate_contact(
        &self,
        tenant_id: &TenantId,
        contact_id: &ContactId,
    ) -> Result<(), CacheStoreError>;
    async fn entry_counts(&self) -> TierCounts;
}

#[derive(Clone, Debug)]
pub struct InMemoryCacheStoreConfig {
    pub l1_max_entries: u64,
    pub l2_max_entries: u64,
    /// Upper bound on residency; per-entry expiry is still checked on read.
    pub l1_max_ttl: Duration,
    pub l2_max_ttl: Duration,
    pub l3_window_size: usize,
}

type SemanticWindow = Arc<Mutex<VecDeque<CacheEntry>>>;

#[derive(Clone)]
pub struct InMemoryCacheStore {
    l1: Cache<String, CacheEntry>,
    l2: Cache<String, CacheEntry>,
    l3: Arc<RwLock<HashMap<TenantId, SemanticWindow>>>,
    l3_window_size: usize,
}

impl InMemoryCacheStore {
    pub fn new(config: InMemoryCacheStoreConfig) -> Self {
        let build = |capacity: u64, ttl: Duration| -> Cache<String, CacheEntry> {
            Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .support_invalidation_closures()
                .build()
        };

        Self {
            l1: build(config.l1_max_entries, config.l1_max_ttl),
            l2: build(config.l2_max_entries, config.l2_max_ttl),
            l3: Arc::new(RwLock::new(HashMap::new())),
            l3_window_size: config.l3_window_size.max(1),
        }
    }

    fn keyed(&self, tier: CacheTier) -> Option<&Cache<String, CacheEntry>> {
        match tier {
            CacheTier::L1 => Some(&self.l1),
            CacheTier::L2 => Some(&self.l2),
            CacheTier::L3 => None,
        }
    }

    async fn window(&self, tenant_id: &TenantId) -> SemanticWindow {
        if let Some(window) = self.l3.read().await.get(tenant_id) {
            return window.clone();
        }
        let mut windows = self.l3.write().await;
        windows.entry(tenant_id.clone()).or_default().clone()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, tier: CacheTier, key: &str) -> Result<Option<CacheEntry>, CacheStoreError> {
        match self.keyed(tier) {
            Some(cache) => Ok(cache.get(key).await),
            None => Err(CacheStoreError::Unavailable("L3 entries are not keyed".to_string())),
        }
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheStoreError> {
        if let Some(cache) = self.keyed(entry.tier) {
            cache.insert(entry.key.clone(), entry).await;
            return Ok(());
        }

        let window = self.window(&entry.tenant_id).await;
        let mut window = window.lock().await;
        window.retain(|existing| existing.key != entry.key);
        window.push_back(entry);
        while window.len() > self.l3_window_size {
            window.pop_front();
        }
        Ok(())
    }

    async fn semantic_window(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<CacheEntry>, CacheStoreError> {
        let Some(window) = self.l3.read().await.get(tenant_id).cloned() else {
            return Ok(Vec::new());
        };
        let window = window.lock().await;
        Ok(window.iter().cloned().collect())
    }

    async fn record_hit(&self, entry: &CacheEntry) -> Result<(), CacheStoreError> {
        if let Some(cache) = self.keyed(entry.tier) {
            if let Some(mut stored) = cache.get(&entry.key).await {
                stored.hit_count = stored.hit_count.saturating_add(1);
                cache.insert(entry.key.clone(), stored).await;
            }
            return Ok(());
        }

        let window = self.window(&entry.tenant_id).await;
        let mut window = window.lock().await;
        if let Some(stored) = window.iter_mut().find(|stored| stored.key == entry.key) {
            stored.hit_count = stored.hit_count.saturating_add(1);
        }
        Ok(())
    }

    async fn invalidate_tenant(&self, tenant_id: &TenantId) -> Result<(), CacheStoreError> {
        for cache in [&self.l1, &self.l2] {
            let tenant = tenant_id.clone();
            cache
                .invalidate_entries_if(move |_, entry| entry.tenant_id == tenant)
                .map_err(|error| CacheStoreError::Invalidation(error.to_string()))?;
        }
        self.l3.write().await.remove(tenant_id);
        Ok(())
    }

    async fn invalidate_contact(
        &self,
        tenant_id: &TenantId,
        contact_id: &ContactId,
    ) -> Result<(), CacheStoreError> {
        for cache in [&self.l1, &self.l2] {
            let tenant = tenant_id.clone();
            let contact = contact_id.clone();
            cache
                .invalidate_entries_if(move |_, entry| {
                    entry.tenant_id == tenant && entry.contact_id == contact
                })
                .map_err(|error| CacheStoreError::Invalidation(error.to_string()))?;
        }

        let window = self.l3.read().await.get(tenant_id).cloned();
        if let Some(window) = window {
            window.lock().await.retain(|entry| &entry.contact_id != contact_id);
        }
        Ok(())
    }

    async fn entry_counts(&self) -> TierCounts {
        self.l1.run_pending_tasks().await;
        self.l2.run_pending_tasks().await;

        let windows: Vec<SemanticWindow> = self.l3.read().await.values().cloned().collect();
        let mut l3 = 0_u64;
        for window in windows {
            l3 += window.lock().await.len() as u64;
        }

        TierCounts { l1: self.l1.entry_count(), l2: self.l2.entry_count(), l3 }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::{CacheStore, InMemoryCacheStore, InMemoryCacheStoreConfig};
    use crate::domain::cache::{CacheEntry, CacheTier, CachedResponse};
    use crate::domain::classification::{Intent, IntentScore, StoredClassification};
    use crate::domain::session::{ContactId, TenantId};

    fn store(window: usize) -> InMemoryCacheStore {
        InMemoryCacheStore::new(InMemoryCacheStoreConfig {
            l1_max_entries: 100,
            l2_max_entries: 100,
            l1_max_ttl: Duration::from_secs(3600),
            l2_max_ttl: Duration::from_secs(3600),
            l3_window_size: window,
        })
    }

    fn entry(tier: CacheTier, key: &str, tenant: &str, contact: &str) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            tier,
            key: key.to_owned(),
            tenant_id: TenantId(tenant.to_owned()),
            contact_id: ContactId(contact.to_owned()),
            query_text: key.to_owned(),
            embedding: (tier == CacheTier::L3).then(|| vec![1.0, 0.0]),
            payload: CachedResponse {
                reply: "We are open 9 to 5.".to_owned(),
                classification: StoredClassification {
                    primary: IntentScore::new(Intent::Qualify, 0.8),
                    alternatives: vec![],
                },
            },
            created_at: now,
            expires_at: now + chrono::Duration::hours(1),
            hit_count: 0,
        }
    }

    #[tokio::test]
    async fn keyed_tiers_round_trip_and_count_hits() {
        let store = store(10);
        let l1 = entry(CacheTier::L1, "k1", "acme", "C-1");
        store.put(l1.clone()).await.expect("put");
        store.record_hit(&l1).await.expect("hit");

        let stored = store.get(CacheTier::L1, "k1").await.expect("get").expect("present");
        assert_eq!(stored.hit_count, 1);
        assert!(store.get(CacheTier::L2, "k1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn semantic_window_is_bounded_per_tenant() {
        let store = store(2);
        for key in ["a", "b", "c"] {
            store.put(entry(CacheTier::L3, key, "acme", "C-1")).await.expect("put");
        }
        store.put(entry(CacheTier::L3, "z", "other", "C-9")).await.expect("put");

        let window = store.semantic_window(&TenantId("acme".to_owned())).await.expect("window");
        let keys: Vec<&str> = window.iter().map(|entry| entry.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert_eq!(store.entry_counts().await.l3, 3);
    }

    #[tokio::test]
    async fn invalidation_scopes_to_tenant_or_contact() {
        let store = store(10);
        store.put(entry(CacheTier::L2, "acme-1", "acme", "C-1")).await.expect("put");
        store.put(entry(CacheTier::L2, "acme-2", "acme", "C-2")).await.expect("put");
        store.put(entry(CacheTier::L2, "other-1", "other", "C-1")).await.expect("put");
        store.put(entry(CacheTier::L3, "acme-sem", "acme", "C-1")).await.expect("put");

        store
            .invalidate_contact(&TenantId("acme".to_owned()), &ContactId("C-1".to_owned()))
            .await
            .expect("invalidate contact");
        assert!(store.get(CacheTier::L2, "acme-1").await.expect("get").is_none());
        assert!(store.get(CacheTier::L2, "acme-2").await.expect("get").is_some());
        assert!(store
            .semantic_window(&TenantId("acme".to_owned()))
            .await
            .expect("window")
            .is_empty());

        store.invalidate_tenant(&TenantId("acme".to_owned())).await.expect("invalidate tenant");
        assert!(store.get(CacheTier::L2, "acme-2").await.expect("get").is_none());
        assert!(store.get(CacheTier::L2, "other-1").await.expect("get").is_some());
    }
}
