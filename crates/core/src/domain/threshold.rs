use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::handoff::HandoffEdge;
use crate::domain::session::TenantId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThresholdKey {
    pub tenant_id: TenantId,
    pub edge: HandoffEdge,
}

impl ThresholdKey {
    pub fn new(tenant_id: TenantId, edge: HandoffEdge) -> Self {
        Self { tenant_id, edge }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceThreshold {
    pub key: ThresholdKey,
    pub current_value: f64,
    /// Lifetime decisive outcomes recorded for this edge.
    pub sample_count: u64,
    pub success_count: u64,
    /// Outcomes collected since the last adjustment.
    pub window_samples: u32,
    pub window_successes: u32,
    /// Optimistic concurrency token, bumped on every write.
    pub version: u64,
    pub last_updated_at: DateTime<Utc>,
}

impl ConfidenceThreshold {
    pub fn cold_start(key: ThresholdKey, default_value: f64, now: DateTime<Utc>) -> Self {
        Self {
            key,
            current_value: default_value.clamp(0.0, 1.0),
            sample_count: 0,
            success_count: 0,
            window_samples: 0,
            window_successes: 0,
            version: 0,
            last_updated_at: now,
        }
    }

    pub fn lifetime_success_rate(&self) -> Option<f64> {
        (self.sample_count > 0).then(|| self.success_count as f64 / self.sample_count as f64)
    }
}
