use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::classification::StoredClassification;
use crate::domain::session::{ContactId, TenantId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheTier {
    L1,
    L2,
    L3,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
            Self::L3 => "l3",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub reply: String,
    pub classification: StoredClassification,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub tier: CacheTier,
    /// Hex digest for L1/L2. For L3 the digest of the normalized query text.
    pub key: String,
    pub tenant_id: TenantId,
    pub contact_id: ContactId,
    pub query_text: String,
    /// Present only on L3 entries.
    pub embedding: Option<Vec<f32>>,
    pub payload: CachedResponse,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Copy of this entry re-keyed for a faster tier, owned by the contact whose lookup
    /// promoted it. Never outlives the source.
    pub fn promoted(
        &self,
        tier: CacheTier,
        key: String,
        contact_id: &ContactId,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tier,
            key,
            tenant_id: self.tenant_id.clone(),
            contact_id: contact_id.clone(),
            query_text: self.query_text.clone(),
            embedding: None,
            payload: self.payload.clone(),
            created_at: now,
            expires_at: (now + ttl).min(self.expires_at),
            hit_count: 0,
        }
    }
}
