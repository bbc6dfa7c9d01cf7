use std::collections::HashMap;

use async_trait::async_trait;

use leadline_core::domain::session::{ContactId, TenantId};

/// Optional lead-quality score in `[0, 1]` from an external scoring service.
#[async_trait]
pub trait LeadSignalProvider: Send + Sync {
    async fn lead_quality(&self, tenant_id: &TenantId, contact_id: &ContactId) -> Option<f64>;
}

#[derive(Clone, Debug, Default)]
pub struct NoLeadSignals;

#[async_trait]
impl LeadSignalProvider for NoLeadSignals {
    async fn lead_quality(&self, _tenant_id: &TenantId, _contact_id: &ContactId) -> Option<f64> {
        None
    }
}

/// Fixed scores, keyed by tenant and contact.
#[derive(Clone, Debug, Default)]
pub struct StaticLeadSignals {
    scores: HashMap<(TenantId, ContactId), f64>,
}

impl StaticLeadSignals {
    pub fn with_score(mut self, tenant_id: TenantId, contact_id: ContactId, score: f64) -> Self {
        self.scores.insert((tenant_id, contact_id), score.clamp(0.0, 1.0));
        self
    }
}

#[async_trait]
impl LeadSignalProvider for StaticLeadSignals {
    async fn lead_quality(&self, tenant_id: &TenantId, contact_id: &ContactId) -> Option<f64> {
        self.scores.get(&(tenant_id.clone(), contact_id.clone())).copied()
    }
}
