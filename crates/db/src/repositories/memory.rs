use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use leadline_core::audit::AuditEvent;
use leadline_core::domain::compliance::{ComplianceViolation, OptOutRecord};
use leadline_core::domain::handoff::{HandoffEvent, HandoffEventId, HandoffOutcome};
use leadline_core::domain::session::{ContactId, ConversationSession, SessionId, TenantId};
use leadline_core::domain::threshold::{ConfidenceThreshold, ThresholdKey};

use super::{
    AuditEventRepository, ComplianceViolationRepository, HandoffEventRepository,
    OptOutRepository, RepositoryError, SessionRepository, ThresholdRepository,
};

/// Sessions with their handoff events inline. Also serves as the handoff event store, so an
/// outcome set here shows up on the next session load.
#[derive(Default)]
pub struct InMemorySessionRepository {
    sessions: RwLock<HashMap<String, ConversationSession>>,
}

impl InMemorySessionRepository {
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn find_by_id(
        &self,
        id: &SessionId,
    ) -> Result<Option<ConversationSession>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&id.0).cloned())
    }

    async fn save(&self, mut session: ConversationSession) -> Result<(), RepositoryError> {
        let mut sessions = self.sessions.write().await;
        if let Some(stored) = sessions.get(&session.id.0) {
            // Stored events only change through `set_outcome`; saves append the rest.
            let kept = stored.handoff_history.len().min(session.handoff_history.len());
            let appended = session.handoff_history.split_off(kept);
            session.handoff_history = stored.handoff_history.iter().cloned().chain(appended).collect();
        }
        sessions.insert(session.id.0.clone(), session);
        Ok(())
    }

    async fn list_inactive(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<SessionId>, RepositoryError> {
        let sessions = self.sessions.read().await;
        let mut inactive: Vec<&ConversationSession> = sessions
            .values()
            .filter(|session| session.archived_at.is_none() && session.last_activity_at < before)
            .collect();
        inactive.sort_by(|a, b| {
            a.last_activity_at.cmp(&b.last_activity_at).then_with(|| a.id.cmp(&b.id))
        });
        Ok(inactive.into_iter().take(limit as usize).map(|session| session.id.clone()).collect())
    }
}

#[async_trait::async_trait]
impl HandoffEventRepository for InMemorySessionRepository {
    async fn find_by_id(
        &self,
        id: &HandoffEventId,
    ) -> Result<Option<HandoffEvent>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .flat_map(|session| session.handoff_history.iter())
            .find(|event| &event.id == id)
            .cloned())
    }

    async fn set_outcome(
        &self,
        id: &HandoffEventId,
        outcome: HandoffOutcome,
    ) -> Result<bool, RepositoryError> {
        let mut sessions = self.sessions.write().await;
        let event = sessions
            .values_mut()
            .flat_map(|session| session.handoff_history.iter_mut())
            .find(|event| &event.id == id);
        match event {
            Some(event) if !event.outcome.is_decisive() => {
                event.outcome = outcome;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<HandoffEvent>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&session_id.0).map(|session| session.handoff_history.clone()).unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryThresholdRepository {
    thresholds: RwLock<HashMap<ThresholdKey, ConfidenceThreshold>>,
}

#[async_trait::async_trait]
impl ThresholdRepository for InMemoryThresholdRepository {
    async fn find(
        &self,
        key: &ThresholdKey,
    ) -> Result<Option<ConfidenceThreshold>, RepositoryError> {
        let thresholds = self.thresholds.read().await;
        Ok(thresholds.get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        threshold: ConfidenceThreshold,
        expected_version: u64,
    ) -> Result<bool, RepositoryError> {
        let mut thresholds = self.thresholds.write().await;
        let stored_version = thresholds.get(&threshold.key).map_or(0, |stored| stored.version);
        if stored_version != expected_version {
            return Ok(false);
        }
        thresholds.insert(threshold.key.clone(), threshold);
        Ok(true)
    }

    async fn list_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<ConfidenceThreshold>, RepositoryError> {
        let thresholds = self.thresholds.read().await;
        let mut listed: Vec<ConfidenceThreshold> = thresholds
            .values()
            .filter(|threshold| &threshold.key.tenant_id == tenant_id)
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listed)
    }
}

#[derive(Default)]
pub struct InMemoryComplianceViolationRepository {
    violations: RwLock<Vec<ComplianceViolation>>,
}

impl InMemoryComplianceViolationRepository {
    pub async fn all(&self) -> Vec<ComplianceViolation> {
        self.violations.read().await.clone()
    }
}

#[async_trait::async_trait]
impl ComplianceViolationRepository for InMemoryComplianceViolationRepository {
    async fn save(&self, violation: ComplianceViolation) -> Result<(), RepositoryError> {
        let mut violations = self.violations.write().await;
        if !violations.iter().any(|existing| existing.id == violation.id) {
            violations.push(violation);
        }
        Ok(())
    }

    async fn list_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ComplianceViolation>, RepositoryError> {
        let violations = self.violations.read().await;
        Ok(violations.iter().filter(|violation| &violation.session_id == session_id).cloned().collect())
    }
}

#[derive(Default)]
pub struct InMemoryAuditEventRepository {
    events: RwLock<Vec<AuditEvent>>,
}

impl InMemoryAuditEventRepository {
    pub async fn all(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait::async_trait]
impl AuditEventRepository for InMemoryAuditEventRepository {
    async fn save(&self, event: AuditEvent) -> Result<(), RepositoryError> {
        let mut events = self.events.write().await;
        if !events.iter().any(|existing| existing.event_id == event.event_id) {
            events.push(event);
        }
        Ok(())
    }

    async fn list_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<AuditEvent>, RepositoryError> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|event| event.session_id.as_ref() == Some(session_id))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryOptOutRepository {
    records: RwLock<HashMap<(TenantId, ContactId), OptOutRecord>>,
}

#[async_trait::async_trait]
impl OptOutRepository for InMemoryOptOutRepository {
    async fn record(&self, record: OptOutRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        records
            .entry((record.tenant_id.clone(), record.contact_id.clone()))
            .or_insert(record);
        Ok(())
    }

    async fn find(
        &self,
        tenant_id: &TenantId,
        contact_id: &ContactId,
    ) -> Result<Option<OptOutRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.get(&(tenant_id.clone(), contact_id.clone())).cloned())
    }
}
