//! Per-tenant cache lifetimes and compiled compliance rules.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::cache::{seconds, CachePolicy};
use crate::compliance::{ComplianceGuard, RuleError, RuleSet};
use crate::config::{AppConfig, CacheConfig, ComplianceConfig, TenantOverrides};
use crate::domain::session::TenantId;

#[derive(Clone, Debug)]
pub struct TenantPolicy {
    pub tenant_id: TenantId,
    pub cache: CachePolicy,
    pub guard: ComplianceGuard,
}

impl TenantPolicy {
    pub fn build(
        tenant_id: TenantId,
        cache: &CacheConfig,
        compliance: &ComplianceConfig,
        overrides: Option<&TenantOverrides>,
    ) -> Result<Self, RuleError> {
        let mut cache_policy = CachePolicy::from_config(cache);
        if let Some(overrides) = overrides {
            if let Some(ttl) = overrides.l1_ttl_secs {
                cache_policy.l1_ttl = seconds(ttl);
            }
            if let Some(ttl) = overrides.l2_ttl_secs {
                cache_policy.l2_ttl = seconds(ttl);
            }
            if let Some(ttl) = overrides.l3_ttl_secs {
                cache_policy.l3_ttl = seconds(ttl);
            }
            if let Some(threshold) = overrides.similarity_threshold {
                cache_policy.similarity_threshold = threshold;
            }
        }

        let rules = RuleSet::compile(compliance, overrides)?;
        Ok(Self { tenant_id, cache: cache_policy, guard: ComplianceGuard::new(Arc::new(rules)) })
    }
}

/// Compiles tenant policies on first use and keeps them until the tenant's overrides change.
#[derive(Debug)]
pub struct TenantPolicies {
    cache: CacheConfig,
    compliance: ComplianceConfig,
    overrides: RwLock<BTreeMap<String, TenantOverrides>>,
    compiled: RwLock<HashMap<TenantId, Arc<TenantPolicy>>>,
}

impl TenantPolicies {
    pub fn new(
        cache: CacheConfig,
        compliance: ComplianceConfig,
        overrides: BTreeMap<String, TenantOverrides>,
    ) -> Self {
        Self {
            cache,
            compliance,
            overrides: RwLock::new(overrides),
            compiled: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.cache.clone(), config.compliance.clone(), config.tenants.clone())
    }

    pub fn policy_for(&self, tenant_id: &TenantId) -> Result<Arc<TenantPolicy>, RuleError> {
        let cached = match self.compiled.read() {
            Ok(compiled) => compiled.get(tenant_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(tenant_id).cloned(),
        };
        if let Some(policy) = cached {
            return Ok(policy);
        }

        let overrides = match self.overrides.read() {
            Ok(overrides) => overrides.get(&tenant_id.0).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&tenant_id.0).cloned(),
        };
        let policy = Arc::new(TenantPolicy::build(
            tenant_id.clone(),
            &self.cache,
            &self.compliance,
            overrides.as_ref(),
        )?);

        // A concurrent update may have compiled first; its policy wins.
        let policy = match self.compiled.write() {
            Ok(mut compiled) => compiled.entry(tenant_id.clone()).or_insert(policy).clone(),
            Err(poisoned) => poisoned.into_inner().entry(tenant_id.clone()).or_insert(policy).clone(),
        };
        Ok(policy)
    }

    /// Replaces a tenant's overrides and recompiles its rules. Invalid overrides leave the
    /// current policy in place. Callers should also drop the tenant's cached replies.
    pub fn update_tenant(
        &self,
        tenant_id: &TenantId,
        overrides: TenantOverrides,
    ) -> Result<Arc<TenantPolicy>, RuleError> {
        let policy = Arc::new(TenantPolicy::build(
            tenant_id.clone(),
            &self.cache,
            &self.compliance,
            Some(&overrides),
        )?);

        match self.overrides.write() {
            Ok(mut all) => all.insert(tenant_id.0.clone(), overrides),
            Err(poisoned) => poisoned.into_inner().insert(tenant_id.0.clone(), overrides),
        };
        match self.compiled.write() {
            Ok(mut compiled) => compiled.insert(tenant_id.clone(), policy.clone()),
            Err(poisoned) => poisoned.into_inner().insert(tenant_id.clone(), policy.clone()),
        };
        Ok(policy)
    }
}
