//! Learned handoff thresholds backed by the threshold table.
//!
//! Reads fall back to the configured default for edges that have never been written. Writes go
//! through compare-and-swap on the record version and are retried a bounded number of times
//! when another session wins the race.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use leadline_core::config::{HandoffConfig, LearningConfig};
use leadline_core::domain::bot::ConversationState;
use leadline_core::domain::handoff::HandoffOutcome;
use leadline_core::domain::session::TenantId;
use leadline_core::domain::threshold::{ConfidenceThreshold, ThresholdKey};
use leadline_core::errors::DomainError;
use leadline_core::handoff::{HandoffStateMachine, ThresholdSnapshot};
use leadline_core::learning::{LearningStep, ThresholdLearner};
use leadline_db::repositories::{RepositoryError, ThresholdRepository};

#[derive(Debug, Error)]
pub enum ThresholdError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("threshold {key} still contended after {attempts} attempts")]
    Contended { key: String, attempts: u32 },
}

#[derive(Clone)]
pub struct ThresholdRegistry {
    repository: Arc<dyn ThresholdRepository>,
    learner: ThresholdLearner,
    default_value: f64,
}

impl ThresholdRegistry {
    pub fn new(
        repository: Arc<dyn ThresholdRepository>,
        learning: LearningConfig,
        handoff: &HandoffConfig,
    ) -> Self {
        Self {
            repository,
            learner: ThresholdLearner::new(learning),
            default_value: handoff.default_threshold,
        }
    }

    pub fn default_value(&self) -> f64 {
        self.default_value
    }

    /// Current record, or the cold-start record if the edge has no history yet.
    pub async fn current(&self, key: &ThresholdKey) -> Result<ConfidenceThreshold, RepositoryError> {
        Ok(self
            .repository
            .find(key)
            .await?
            .unwrap_or_else(|| ConfidenceThreshold::cold_start(key.clone(), self.default_value, Utc::now())))
    }

    pub async fn get_threshold(&self, key: &ThresholdKey) -> Result<f64, RepositoryError> {
        Ok(self.current(key).await?.current_value)
    }

    /// Thresholds for every edge leaving `from`, resolved ahead of a handoff evaluation.
    pub async fn snapshot(
        &self,
        tenant_id: &TenantId,
        from: ConversationState,
    ) -> Result<ThresholdSnapshot, RepositoryError> {
        let mut snapshot = ThresholdSnapshot::uniform(self.default_value);
        for edge in HandoffStateMachine::edges_from(from) {
            let key = ThresholdKey::new(tenant_id.clone(), edge);
            if let Some(stored) = self.repository.find(&key).await? {
                snapshot = snapshot.with(edge, stored.current_value);
            }
        }
        Ok(snapshot)
    }

    pub async fn list(&self, tenant_id: &TenantId) -> Result<Vec<ConfidenceThreshold>, RepositoryError> {
        self.repository.list_for_tenant(tenant_id).await
    }

    pub async fn record_outcome(
        &self,
        key: &ThresholdKey,
        threshold_used: f64,
        outcome: HandoffOutcome,
        now: DateTime<Utc>,
    ) -> Result<LearningStep, ThresholdError> {
        if !outcome.is_decisive() {
            return Ok(LearningStep::Ignored);
        }

        self.update(key, |current| Ok(self.learner.apply_outcome(current, threshold_used, outcome, now)))
            .await
            .map(|step| {
                if let LearningStep::Adjusted { threshold, previous_value, observed_rate } = &step {
                    info!(
                        event_name = "threshold.adjusted",
                        tenant_id = %key.tenant_id,
                        edge = %key.edge,
                        previous_value,
                        current_value = threshold.current_value,
                        observed_rate,
                        "handoff threshold adjusted"
                    );
                }
                step
            })
    }

    pub async fn admin_override(
        &self,
        key: &ThresholdKey,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<ConfidenceThreshold, ThresholdError> {
        let step = self
            .update(key, |current| {
                let next = self.learner.override_value(current, value, now)?;
                Ok(LearningStep::Adjusted {
                    previous_value: current.current_value,
                    observed_rate: current.lifetime_success_rate().unwrap_or(0.0),
                    threshold: next,
                })
            })
            .await?;

        let threshold = step.threshold().cloned().ok_or_else(|| {
            DomainError::InvariantViolation("override produced no threshold".to_string())
        })?;
        info!(
            event_name = "threshold.overridden",
            tenant_id = %key.tenant_id,
            edge = %key.edge,
            current_value = threshold.current_value,
            "handoff threshold overridden by operator"
        );
        Ok(threshold)
    }

    async fn update<F>(&self, key: &ThresholdKey, apply: F) -> Result<LearningStep, ThresholdError>
    where
        F: Fn(&ConfidenceThreshold) -> Result<LearningStep, DomainError>,
    {
        let attempts = self.learner.config().cas_max_attempts.max(1);
        for attempt in 1..=attempts {
            let current = self.current(key).await?;
            let step = apply(&current)?;
            let Some(next) = step.threshold() else {
                return Ok(step);
            };

            if self.repository.compare_and_swap(next.clone(), current.version).await? {
                return Ok(step);
            }
            debug!(
                event_name = "threshold.cas.conflict",
                tenant_id = %key.tenant_id,
                edge = %key.edge,
                attempt,
                "threshold version moved; retrying"
            );
            tokio::task::yield_now().await;
        }

        warn!(
            event_name = "threshold.cas.exhausted",
            tenant_id = %key.tenant_id,
            edge = %key.edge,
            attempts,
            "giving up on threshold update"
        );
        Err(ThresholdError::Contended { key: format!("{}:{}", key.tenant_id, key.edge), attempts })
    }
}
