//! Inbound message pipeline.
//!
//! One message at a time per session (see [`SessionLanes`]): resolve the session, honour
//! opt-outs and terminal states, answer from cache or the model, route between bots, gate the
//! outbound text through compliance, then persist. Infrastructure failures degrade the reply
//! rather than failing the call.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use leadline_core::audit::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink,
};
use leadline_core::cache::{has_volatile_content, CachePolicy, CacheScope, CacheStats, ResponseCache};
use leadline_core::compliance::ComplianceDecision;
use leadline_core::config::{AppConfig, PersistenceConfig, TenantOverrides};
use leadline_core::domain::bot::{Channel, ConversationState};
use leadline_core::domain::cache::{CacheTier, CachedResponse};
use leadline_core::domain::classification::{Classification, ClassificationSource};
use leadline_core::domain::compliance::{ComplianceViolation, OptOutRecord};
use leadline_core::domain::handoff::{HandoffEdge, HandoffEventId, HandoffOutcome};
use leadline_core::domain::session::{ContactId, ConversationSession, SessionId, TenantId};
use leadline_core::domain::threshold::{ConfidenceThreshold, ThresholdKey};
use leadline_core::errors::{ApplicationError, DomainError, ErrorClass};
use leadline_core::handoff::{HandoffStateMachine, ThresholdSnapshot, Transition};
use leadline_core::learning::LearningStep;
use leadline_core::policy::{TenantPolicies, TenantPolicy};
use leadline_db::repositories::{
    AuditEventRepository, ComplianceViolationRepository, HandoffEventRepository,
    InMemoryAuditEventRepository, InMemoryComplianceViolationRepository,
    InMemoryOptOutRepository, InMemorySessionRepository, InMemoryThresholdRepository,
    OptOutRepository, RepositoryError, SessionRepository, SqlAuditEventRepository,
    SqlComplianceViolationRepository, SqlHandoffEventRepository, SqlOptOutRepository,
    SqlSessionRepository, SqlThresholdRepository, ThresholdRepository,
};
use leadline_db::DbPool;

use crate::lanes::SessionLanes;
use crate::llm::{GuardedLlm, LlmClient, LlmContext, LlmError};
use crate::persistence::retry_write;
use crate::signals::{LeadSignalProvider, NoLeadSignals};
use crate::thresholds::{ThresholdError, ThresholdRegistry};

const ACTOR: &str = "orchestrator";
const ARCHIVE_BATCH: u32 = 200;
const CACHE_QUEUE_DEPTH: usize = 1_024;
const MAX_INACTIVITY_SECS: i64 = 100 * 365 * 24 * 60 * 60;

#[derive(Clone)]
pub struct Repositories {
    pub sessions: Arc<dyn SessionRepository>,
    pub handoff_events: Arc<dyn HandoffEventRepository>,
    pub thresholds: Arc<dyn ThresholdRepository>,
    pub violations: Arc<dyn ComplianceViolationRepository>,
    pub audit_events: Arc<dyn AuditEventRepository>,
    pub opt_outs: Arc<dyn OptOutRepository>,
}

impl Repositories {
    pub fn sqlite(pool: DbPool) -> Self {
        Self {
            sessions: Arc::new(SqlSessionRepository::new(pool.clone())),
            handoff_events: Arc::new(SqlHandoffEventRepository::new(pool.clone())),
            thresholds: Arc::new(SqlThresholdRepository::new(pool.clone())),
            violations: Arc::new(SqlComplianceViolationRepository::new(pool.clone())),
            audit_events: Arc::new(SqlAuditEventRepository::new(pool.clone())),
            opt_outs: Arc::new(SqlOptOutRepository::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        let sessions = Arc::new(InMemorySessionRepository::default());
        Self {
            sessions: sessions.clone(),
            handoff_events: sessions,
            thresholds: Arc::new(InMemoryThresholdRepository::default()),
            violations: Arc::new(InMemoryComplianceViolationRepository::default()),
            audit_events: Arc::new(InMemoryAuditEventRepository::default()),
            opt_outs: Arc::new(InMemoryOptOutRepository::default()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub session_id: SessionId,
    pub tenant_id: TenantId,
    pub contact_id: ContactId,
    pub channel: Channel,
    pub text: String,
    pub correlation_id: String,
}

impl InboundMessage {
    pub fn new(
        session_id: SessionId,
        tenant_id: TenantId,
        contact_id: ContactId,
        channel: Channel,
        text: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            tenant_id,
            contact_id,
            channel,
            text: text.into(),
            correlation_id: Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplySource {
    Llm,
    Cache(CacheTier),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SuppressReason {
    OptedOut { keyword: String },
    Terminal(ConversationState),
}

#[derive(Clone, Debug, PartialEq)]
pub enum OutboundResult {
    Delivered { text: String, source: ReplySource, transition: Transition },
    /// Model unreachable; the reply is a relaxed cache match or the hold message.
    Degraded { text: String, error_class: ErrorClass },
    /// A human takes over. `text` is the compliant hold message, if one could be sent.
    Escalated { text: Option<String>, error_class: ErrorClass },
    Suppressed { text: Option<String>, reason: SuppressReason },
}

impl OutboundResult {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Delivered { text, .. } | Self::Degraded { text, .. } => Some(text),
            Self::Escalated { text, .. } | Self::Suppressed { text, .. } => text.as_deref(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered { .. } => "delivered",
            Self::Degraded { .. } => "degraded",
            Self::Escalated { .. } => "escalated",
            Self::Suppressed { .. } => "suppressed",
        }
    }
}

struct PendingCacheWrite {
    query: String,
    scope: CacheScope,
    response: CachedResponse,
    policy: CachePolicy,
    at: DateTime<Utc>,
}

enum CacheCommand {
    Store(Box<PendingCacheWrite>),
    Flush(oneshot::Sender<()>),
}

/// What a message resolved to, before anything is written.
struct Reply {
    result: OutboundResult,
    violations: Vec<ComplianceViolation>,
    cache_write: Option<PendingCacheWrite>,
}

impl Reply {
    fn new(result: OutboundResult) -> Self {
        Self { result, violations: Vec::new(), cache_write: None }
    }
}

pub struct Orchestrator {
    repositories: Repositories,
    cache: ResponseCache,
    policies: Arc<TenantPolicies>,
    llm: GuardedLlm,
    state_machine: HandoffStateMachine,
    thresholds: ThresholdRegistry,
    signals: Arc<dyn LeadSignalProvider>,
    lanes: SessionLanes,
    persistence: PersistenceConfig,
    inactivity: Duration,
    hold_message: String,
    escalation_message: String,
    cache_writes: mpsc::Sender<CacheCommand>,
}

impl Orchestrator {
    /// Must be called inside a tokio runtime; the cache writer runs as a background task.
    pub fn new(
        config: &AppConfig,
        repositories: Repositories,
        cache: ResponseCache,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let thresholds =
            ThresholdRegistry::new(repositories.thresholds.clone(), config.learning.clone(), &config.handoff);
        let inactivity_secs = i64::try_from(config.session.inactivity_archive_secs)
            .unwrap_or(MAX_INACTIVITY_SECS)
            .min(MAX_INACTIVITY_SECS);

        Self {
            cache_writes: spawn_cache_writer(cache.clone()),
            repositories,
            cache,
            policies: Arc::new(TenantPolicies::from_config(config)),
            llm: GuardedLlm::new(llm, &config.llm),
            state_machine: HandoffStateMachine::new(config.handoff.clone()),
            thresholds,
            signals: Arc::new(NoLeadSignals),
            lanes: SessionLanes::new(),
            persistence: config.persistence.clone(),
            inactivity: Duration::seconds(inactivity_secs),
            hold_message: config.compliance.hold_message.clone(),
            escalation_message: config.compliance.escalation_message.clone(),
        }
    }

    pub fn with_lead_signals(mut self, signals: Arc<dyn LeadSignalProvider>) -> Self {
        self.signals = signals;
        self
    }

    pub fn thresholds(&self) -> &ThresholdRegistry {
        &self.thresholds
    }

    pub async fn handle_inbound(
        &self,
        message: InboundMessage,
    ) -> Result<OutboundResult, ApplicationError> {
        let policy = self
            .policies
            .policy_for(&message.tenant_id)
            .map_err(|error| ApplicationError::Configuration(error.to_string()))?;
        let _lane = self.lanes.acquire(&message.session_id).await;
        let now = Utc::now();

        info!(
            event_name = "message.received",
            correlation_id = %message.correlation_id,
            session_id = %message.session_id,
            tenant_id = %message.tenant_id,
            channel = message.channel.as_str(),
            active_lanes = self.lanes.active_lanes(),
            "inbound message"
        );

        let sink = InMemoryAuditSink::default();
        let audit = AuditContext::new(
            Some(message.tenant_id.clone()),
            Some(message.session_id.clone()),
            message.correlation_id.clone(),
            ACTOR,
        );

        let mut session = match self.resolve_session(&message, now, &sink, &audit).await {
            Ok(session) => session,
            Err(error) => {
                error!(
                    event_name = "session.load.failed",
                    correlation_id = %message.correlation_id,
                    session_id = %message.session_id,
                    error = %error,
                    "session could not be loaded; replying with hold message"
                );
                return Ok(OutboundResult::Degraded {
                    text: self.hold_message.clone(),
                    error_class: ErrorClass::PersistenceWriteFailure,
                });
            }
        };

        let reply = self.respond(&message, &mut session, &policy, now, &sink, &audit).await;

        if let Some(write) = reply.cache_write {
            self.queue_cache_write(write);
        }
        self.persist(&message.correlation_id, session, reply.violations, &sink).await;

        info!(
            event_name = "message.handled",
            correlation_id = %message.correlation_id,
            session_id = %message.session_id,
            tenant_id = %message.tenant_id,
            result = reply.result.label(),
            "inbound message handled"
        );
        Ok(reply.result)
    }

    pub async fn get_session_state(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ConversationSession>, ApplicationError> {
        self.repositories.sessions.find_by_id(session_id).await.map_err(persistence_error)
    }

    pub async fn admin_override_threshold(
        &self,
        tenant_id: &TenantId,
        edge: HandoffEdge,
        value: f64,
    ) -> Result<ConfidenceThreshold, ApplicationError> {
        if edge.from.is_terminal() || edge.from.active_bot() == Some(edge.to) {
            return Err(DomainError::InvalidHandoff { from: edge.from, to: edge.to.into() }.into());
        }

        let key = ThresholdKey::new(tenant_id.clone(), edge);
        let threshold =
            self.thresholds.admin_override(&key, value, Utc::now()).await.map_err(threshold_error)?;

        let event = AuditContext::new(Some(tenant_id.clone()), None, Uuid::new_v4().to_string(), "operator")
            .event("threshold.overridden", AuditCategory::Learning, AuditOutcome::Success)
            .with_metadata("edge", edge.to_string())
            .with_metadata("value", format!("{:.3}", threshold.current_value))
            .with_metadata("version", threshold.version.to_string());
        self.save_audit_events(vec![event]).await;
        Ok(threshold)
    }

    /// Records how a handoff turned out and feeds the edge's threshold learner. An outcome can
    /// be set once per event.
    pub async fn record_handoff_outcome(
        &self,
        event_id: &HandoffEventId,
        outcome: HandoffOutcome,
    ) -> Result<LearningStep, ApplicationError> {
        if !outcome.is_decisive() {
            return Err(DomainError::InvariantViolation(
                "handoff outcome must be success or failure".to_string(),
            )
            .into());
        }

        let event = self
            .repositories
            .handoff_events
            .find_by_id(event_id)
            .await
            .map_err(persistence_error)?
            .ok_or_else(|| ApplicationError::NotFound(format!("handoff event {event_id}")))?;
        let _lane = self.lanes.acquire(&event.session_id).await;

        let events = self.repositories.handoff_events.clone();
        let updated = retry_write(&self.persistence, "handoff_event.set_outcome", || {
            let events = events.clone();
            let event_id = event_id.clone();
            async move { events.set_outcome(&event_id, outcome).await }
        })
        .await
        .map_err(persistence_error)?;
        if !updated {
            return Err(DomainError::OutcomeAlreadyRecorded(event_id.0.clone()).into());
        }

        let step = match (event.is_threshold_gated(), event.edge()) {
            (true, Some(edge)) => {
                let key = ThresholdKey::new(event.tenant_id.clone(), edge);
                self.thresholds
                    .record_outcome(&key, event.threshold_used, outcome, Utc::now())
                    .await
                    .map_err(threshold_error)?
            }
            _ => LearningStep::Ignored,
        };

        let audit = AuditContext::new(
            Some(event.tenant_id.clone()),
            Some(event.session_id.clone()),
            Uuid::new_v4().to_string(),
            ACTOR,
        );
        let mut recorded = audit
            .event("handoff.outcome_recorded", AuditCategory::Learning, AuditOutcome::Success)
            .with_metadata("event_id", event_id.0.clone())
            .with_metadata("outcome", outcome.as_str());
        if let LearningStep::Adjusted { threshold, previous_value, .. } = &step {
            recorded = recorded
                .with_metadata("previous_threshold", format!("{previous_value:.3}"))
                .with_metadata("threshold", format!("{:.3}", threshold.current_value));
        }
        self.save_audit_events(vec![recorded]).await;
        Ok(step)
    }

    /// Closes the session on a CRM signal. Closing twice is a no-op.
    pub async fn close_session(
        &self,
        session_id: &SessionId,
    ) -> Result<ConversationState, ApplicationError> {
        let _lane = self.lanes.acquire(session_id).await;
        let mut session = self
            .repositories
            .sessions
            .find_by_id(session_id)
            .await
            .map_err(persistence_error)?
            .ok_or_else(|| ApplicationError::NotFound(format!("session {session_id}")))?;

        let sink = InMemoryAuditSink::default();
        let audit = AuditContext::new(
            Some(session.tenant_id.clone()),
            Some(session.id.clone()),
            Uuid::new_v4().to_string(),
            "crm",
        );
        let now = Utc::now();
        if self.state_machine.close_with_audit(&mut session, now, &sink, &audit)?.is_none() {
            return Ok(session.state);
        }
        session.touch(now);

        let state = session.state;
        self.save_session(&audit.correlation_id, session).await?;
        self.save_audit_events(sink.drain()).await;
        Ok(state)
    }

    /// Archives sessions idle longer than the configured window. Returns how many were archived.
    pub async fn archive_inactive_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<usize, ApplicationError> {
        let cutoff = now - self.inactivity;
        let mut archived = 0;
        loop {
            let batch = self
                .repositories
                .sessions
                .list_inactive(cutoff, ARCHIVE_BATCH)
                .await
                .map_err(persistence_error)?;
            let batch_len = batch.len();

            for session_id in batch {
                let _lane = self.lanes.acquire(&session_id).await;
                let Some(mut session) = self
                    .repositories
                    .sessions
                    .find_by_id(&session_id)
                    .await
                    .map_err(persistence_error)?
                else {
                    continue;
                };
                if session.is_archived() || session.last_activity_at >= cutoff {
                    continue;
                }
                session.archived_at = Some(now);
                self.save_session("archive", session).await?;
                archived += 1;
            }

            if batch_len < ARCHIVE_BATCH as usize {
                break;
            }
        }

        info!(event_name = "session.archive.completed", archived, cutoff = %cutoff, "inactivity sweep finished");
        Ok(archived)
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn invalidate_tenant_cache(&self, tenant_id: &TenantId) -> Result<(), ApplicationError> {
        self.cache
            .invalidate_tenant(tenant_id)
            .await
            .map_err(|error| ApplicationError::CacheUnavailable(error.to_string()))?;
        info!(event_name = "cache.tenant.invalidated", tenant_id = %tenant_id, "tenant cache invalidated");
        Ok(())
    }

    /// Swaps a tenant's policy overrides at runtime and drops replies cached under the old rules.
    pub async fn update_tenant_policy(
        &self,
        tenant_id: &TenantId,
        overrides: TenantOverrides,
    ) -> Result<(), ApplicationError> {
        self.policies
            .update_tenant(tenant_id, overrides)
            .map_err(|error| ApplicationError::Configuration(error.to_string()))?;
        info!(event_name = "tenant.policy.updated", tenant_id = %tenant_id, "tenant policy replaced");
        self.invalidate_tenant_cache(tenant_id).await
    }

    /// Waits until every cache write queued so far has been applied.
    pub async fn flush_cache_writes(&self) {
        let (ack, done) = oneshot::channel();
        if self.cache_writes.send(CacheCommand::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    async fn resolve_session(
        &self,
        message: &InboundMessage,
        now: DateTime<Utc>,
        sink: &InMemoryAuditSink,
        audit: &AuditContext,
    ) -> Result<ConversationSession, RepositoryError> {
        let mut session = match self.repositories.sessions.find_by_id(&message.session_id).await? {
            Some(mut session) => {
                if session.archived_at.take().is_some() {
                    debug!(
                        event_name = "session.reactivated",
                        correlation_id = %message.correlation_id,
                        session_id = %session.id,
                        "archived session reactivated"
                    );
                    sink.emit(audit.event("session.reactivated", AuditCategory::Ingress, AuditOutcome::Success));
                }
                session
            }
            None => {
                sink.emit(audit.event("session.created", AuditCategory::Ingress, AuditOutcome::Success));
                ConversationSession::new(
                    message.session_id.clone(),
                    message.tenant_id.clone(),
                    message.contact_id.clone(),
                    message.channel,
                    now,
                )
            }
        };

        if !session.compliance.opted_out {
            session.compliance.opted_out = match self
                .repositories
                .opt_outs
                .is_opted_out(&session.tenant_id, &session.contact_id)
                .await
            {
                Ok(opted_out) => opted_out,
                Err(error) => {
                    warn!(
                        event_name = "opt_out.lookup.failed",
                        correlation_id = %message.correlation_id,
                        error = %error,
                        "opt-out lookup failed; treating contact as opted out"
                    );
                    true
                }
            };
        }
        session.touch(now);
        Ok(session)
    }

    async fn respond(
        &self,
        message: &InboundMessage,
        session: &mut ConversationSession,
        policy: &TenantPolicy,
        now: DateTime<Utc>,
        sink: &InMemoryAuditSink,
        audit: &AuditContext,
    ) -> Reply {
        if let Some(keyword) = policy.guard.rules().opt_out_keyword(&message.text) {
            return self.opt_out(message, session, keyword.to_string(), policy, now, sink, audit).await;
        }
        if session.state.is_terminal() {
            debug!(
                event_name = "message.suppressed",
                correlation_id = %message.correlation_id,
                session_id = %session.id,
                state = session.state.as_str(),
                "session is closed or escalated"
            );
            return Reply::new(OutboundResult::Suppressed {
                text: None,
                reason: SuppressReason::Terminal(session.state),
            });
        }

        let scope = CacheScope {
            tenant_id: session.tenant_id.clone(),
            contact_id: session.contact_id.clone(),
            conversation_id: session.id.clone(),
        };

        let (classification, draft, source, cacheable) =
            match self.cache.lookup_at(&message.text, &scope, &policy.cache, now).await.hit() {
                Some(hit) => {
                    sink.emit(
                        audit
                            .event("cache.hit", AuditCategory::Cache, AuditOutcome::Success)
                            .with_metadata("tier", hit.tier.as_str())
                            .with_metadata("similarity", format!("{:.3}", hit.similarity)),
                    );
                    let classification = Classification::from_stored(
                        &hit.entry.payload.classification,
                        ClassificationSource::Cached { tier: hit.tier, similarity: hit.similarity },
                    );
                    (classification, hit.entry.payload.reply, ReplySource::Cache(hit.tier), false)
                }
                None => {
                    let context = LlmContext {
                        tenant_id: session.tenant_id.clone(),
                        session_id: session.id.clone(),
                        channel: message.channel,
                        state: session.state,
                        active_bot: session.active_bot(),
                        correlation_id: message.correlation_id.clone(),
                        model: self.llm.model().to_string(),
                    };
                    match self.llm.call(&message.text, &context).await {
                        Ok(reply) => {
                            let cacheable = reply.cacheable
                                && !has_volatile_content(&message.text)
                                && !has_volatile_content(&reply.draft_reply);
                            (
                                Classification::fresh(reply.intent, reply.alternatives),
                                reply.draft_reply,
                                ReplySource::Llm,
                                cacheable,
                            )
                        }
                        Err(error) => {
                            return self.degrade(message, session, &scope, policy, error, now, sink, audit).await;
                        }
                    }
                }
            };

        let lead_quality = self.signals.lead_quality(&session.tenant_id, &session.contact_id).await;
        let snapshot = match self.thresholds.snapshot(&session.tenant_id, session.state).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(
                    event_name = "threshold.lookup.failed",
                    correlation_id = %message.correlation_id,
                    error = %error,
                    "falling back to default thresholds"
                );
                ThresholdSnapshot::uniform(self.thresholds.default_value())
            }
        };
        let decision = self.state_machine.evaluate_with_audit(
            session,
            &classification,
            &snapshot,
            lead_quality,
            now,
            sink,
            audit,
        );

        if let Transition::Escalated { from, attempted, handoffs_in_window } = decision.transition {
            warn!(
                event_name = "handoff.loop_limit",
                correlation_id = %message.correlation_id,
                session_id = %session.id,
                from = from.as_str(),
                attempted = attempted.as_str(),
                handoffs_in_window,
                "handoff loop limit reached; escalating to a human"
            );
            let mut violations = Vec::new();
            let text = self.send_fallback(
                &self.escalation_message,
                message.channel,
                session,
                policy,
                now,
                &mut violations,
            );
            return Reply {
                result: OutboundResult::Escalated { text, error_class: ErrorClass::HandoffLoopLimitExceeded },
                violations,
                cache_write: None,
            };
        }

        let compliance = policy.guard.validate_at(&draft, message.channel, session, now);
        compliance.apply_to(session);
        let mut violations: Vec<ComplianceViolation> =
            compliance.violations().into_iter().cloned().collect();

        match compliance {
            ComplianceDecision::Allowed { text, .. } => {
                let cache_write = cacheable.then(|| PendingCacheWrite {
                    query: message.text.clone(),
                    scope,
                    response: CachedResponse { reply: draft, classification: classification.to_stored() },
                    policy: policy.cache.clone(),
                    at: now,
                });
                Reply {
                    result: OutboundResult::Delivered { text, source, transition: decision.transition },
                    violations,
                    cache_write,
                }
            }
            ComplianceDecision::Blocked(violation) => {
                session.needs_human_review = true;
                warn!(
                    event_name = "compliance.blocked",
                    correlation_id = %message.correlation_id,
                    session_id = %session.id,
                    tenant_id = %session.tenant_id,
                    violation_type = violation.violation_type.as_str(),
                    rule = %violation.rule,
                    "outbound draft blocked"
                );
                sink.emit(
                    audit
                        .event("compliance.blocked", AuditCategory::Compliance, AuditOutcome::Rejected)
                        .with_metadata("violation_type", violation.violation_type.as_str())
                        .with_metadata("rule", violation.rule.clone()),
                );
                let text = self.send_fallback(
                    &self.escalation_message,
                    message.channel,
                    session,
                    policy,
                    now,
                    &mut violations,
                );
                Reply {
                    result: OutboundResult::Escalated { text, error_class: ErrorClass::ComplianceBlocked },
                    violations,
                    cache_write: None,
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn opt_out(
        &self,
        message: &InboundMessage,
        session: &mut ConversationSession,
        keyword: String,
        policy: &TenantPolicy,
        now: DateTime<Utc>,
        sink: &InMemoryAuditSink,
        audit: &AuditContext,
    ) -> Reply {
        let record = OptOutRecord {
            tenant_id: session.tenant_id.clone(),
            contact_id: session.contact_id.clone(),
            keyword: keyword.clone(),
            recorded_at: now,
        };
        let opt_outs = self.repositories.opt_outs.clone();
        let stored = retry_write(&self.persistence, "opt_out.record", || {
            let opt_outs = opt_outs.clone();
            let record = record.clone();
            async move { opt_outs.record(record).await }
        })
        .await;
        if let Err(error) = stored {
            error!(
                event_name = "opt_out.persist.failed",
                correlation_id = %message.correlation_id,
                tenant_id = %session.tenant_id,
                contact_id = %session.contact_id,
                error = %error,
                "opt-out could not be stored; session flag still set"
            );
        }

        if let Err(error) = self.cache.invalidate_contact(&session.tenant_id, &session.contact_id).await {
            warn!(
                event_name = "cache.contact.invalidate_failed",
                correlation_id = %message.correlation_id,
                contact_id = %session.contact_id,
                error = %error,
                "cached replies for opted-out contact could not be dropped"
            );
        }

        session.compliance.opted_out = true;
        info!(
            event_name = "opt_out.recorded",
            correlation_id = %message.correlation_id,
            session_id = %session.id,
            keyword = %keyword,
            "contact opted out"
        );
        sink.emit(
            audit
                .event("contact.opted_out", AuditCategory::Compliance, AuditOutcome::Success)
                .with_metadata("keyword", keyword.clone()),
        );

        Reply::new(OutboundResult::Suppressed {
            text: Some(policy.guard.rules().opt_out_confirmation.clone()),
            reason: SuppressReason::OptedOut { keyword },
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn degrade(
        &self,
        message: &InboundMessage,
        session: &mut ConversationSession,
        scope: &CacheScope,
        policy: &TenantPolicy,
        error: LlmError,
        now: DateTime<Utc>,
        sink: &InMemoryAuditSink,
        audit: &AuditContext,
    ) -> Reply {
        let error_class = match error {
            LlmError::Timeout { .. } => ErrorClass::LlmTimeout,
            LlmError::Unavailable(_) | LlmError::InvalidResponse(_) => ErrorClass::LlmUnavailable,
        };
        session.needs_human_review = true;

        let relaxed = self.cache.lookup_relaxed(&message.text, scope, now).await;
        let fallback = relaxed.as_ref().map_or(self.hold_message.as_str(), |hit| hit.entry.payload.reply.as_str());
        warn!(
            event_name = "llm.degraded",
            correlation_id = %message.correlation_id,
            session_id = %session.id,
            error_class = error_class.as_str(),
            relaxed_hit = relaxed.is_some(),
            "model unavailable; replying on the degraded path"
        );
        sink.emit(
            audit
                .event("llm.degraded", AuditCategory::Llm, AuditOutcome::Failed)
                .with_metadata("error_class", error_class.as_str())
                .with_metadata("error", error.to_string())
                .with_metadata("relaxed_hit", relaxed.is_some().to_string()),
        );

        let mut violations = Vec::new();
        let fallback = fallback.to_string();
        let mut text =
            self.send_fallback(&fallback, message.channel, session, policy, now, &mut violations);
        if text.is_none() && relaxed.is_some() {
            text = self.send_fallback(&self.hold_message, message.channel, session, policy, now, &mut violations);
        }
        let result = match text {
            Some(text) => OutboundResult::Degraded { text, error_class },
            None => OutboundResult::Escalated { text: None, error_class: ErrorClass::ComplianceBlocked },
        };
        Reply { result, violations, cache_write: None }
    }

    /// Runs a canned or cached fallback through compliance. Returns the text to send, or
    /// `None` when even the fallback was blocked.
    fn send_fallback(
        &self,
        text: &str,
        channel: Channel,
        session: &mut ConversationSession,
        policy: &TenantPolicy,
        now: DateTime<Utc>,
        violations: &mut Vec<ComplianceViolation>,
    ) -> Option<String> {
        let decision = policy.guard.validate_at(text, channel, session, now);
        decision.apply_to(session);
        violations.extend(decision.violations().into_iter().cloned());
        match decision {
            ComplianceDecision::Allowed { text, .. } => Some(text),
            ComplianceDecision::Blocked(_) => {
                session.needs_human_review = true;
                None
            }
        }
    }

    fn queue_cache_write(&self, write: PendingCacheWrite) {
        if let Err(error) = self.cache_writes.try_send(CacheCommand::Store(Box::new(write))) {
            warn!(event_name = "cache.write.dropped", error = %error, "cache write queue unavailable");
        }
    }

    async fn persist(
        &self,
        correlation_id: &str,
        session: ConversationSession,
        violations: Vec<ComplianceViolation>,
        sink: &InMemoryAuditSink,
    ) {
        let repository = self.repositories.violations.clone();
        for violation in violations {
            let stored = retry_write(&self.persistence, "compliance_violation.save", || {
                let repository = repository.clone();
                let violation = violation.clone();
                async move { repository.save(violation).await }
            })
            .await;
            if let Err(error) = stored {
                error!(
                    event_name = "compliance_violation.persist.failed",
                    correlation_id,
                    violation_id = %violation.id.0,
                    violation_type = violation.violation_type.as_str(),
                    error = %error,
                    "compliance violation could not be stored"
                );
            }
        }

        if let Err(error) = self.save_session(correlation_id, session).await {
            debug!(event_name = "session.persist.skipped", correlation_id, error = %error, "reply already decided");
        }
        self.save_audit_events(sink.drain()).await;
    }

    async fn save_session(
        &self,
        correlation_id: &str,
        session: ConversationSession,
    ) -> Result<(), ApplicationError> {
        let sessions = self.repositories.sessions.clone();
        let session_id = session.id.clone();
        retry_write(&self.persistence, "session.save", || {
            let sessions = sessions.clone();
            let session = session.clone();
            async move { sessions.save(session).await }
        })
        .await
        .map_err(|error| {
            error!(
                event_name = "session.persist.failed",
                correlation_id,
                session_id = %session_id,
                error = %error,
                "session could not be stored"
            );
            persistence_error(error)
        })
    }

    /// Best effort: a failed audit write is logged with the event content and dropped.
    async fn save_audit_events(&self, events: Vec<AuditEvent>) {
        let repository = self.repositories.audit_events.clone();
        for event in events {
            let stored = retry_write(&self.persistence, "audit_event.save", || {
                let repository = repository.clone();
                let event = event.clone();
                async move { repository.save(event).await }
            })
            .await;
            if let Err(error) = stored {
                warn!(
                    event_name = "audit.persist.failed",
                    correlation_id = %event.correlation_id,
                    audit_event_type = %event.event_type,
                    audit_event_id = %event.event_id,
                    metadata = ?event.metadata,
                    error = %error,
                    "audit event dropped"
                );
            }
        }
    }
}

fn spawn_cache_writer(cache: ResponseCache) -> mpsc::Sender<CacheCommand> {
    let (sender, mut receiver) = mpsc::channel::<CacheCommand>(CACHE_QUEUE_DEPTH);
    tokio::spawn(async move {
        while let Some(command) = receiver.recv().await {
            match command {
                CacheCommand::Store(write) => {
                    let PendingCacheWrite { query, scope, response, policy, at } = *write;
                    cache.store(&query, &scope, response, &policy, at).await;
                    debug!(event_name = "cache.write.applied", tenant_id = %scope.tenant_id, "cached reply stored");
                }
                CacheCommand::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    });
    sender
}

fn persistence_error(error: RepositoryError) -> ApplicationError {
    ApplicationError::Persistence(error.to_string())
}

fn threshold_error(error: ThresholdError) -> ApplicationError {
    match error {
        ThresholdError::Domain(error) => ApplicationError::Domain(error),
        ThresholdError::Repository(error) => persistence_error(error),
        contended @ ThresholdError::Contended { .. } => ApplicationError::Persistence(contended.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use leadline_core::cache::{CacheLookup, CachePolicy, CacheScope, ResponseCache};
    use leadline_core::config::{AppConfig, TenantOverrides};
    use leadline_core::domain::bot::{BotKind, Channel, ConversationState};
    use leadline_core::domain::cache::CacheTier;
    use leadline_core::domain::classification::{Intent, IntentScore};
    use leadline_core::domain::compliance::ViolationType;
    use leadline_core::domain::handoff::{HandoffEdge, HandoffOutcome};
    use leadline_core::domain::session::{ContactId, SessionId, TenantId};
    use leadline_core::errors::{ApplicationError, DomainError, ErrorClass};
    use leadline_core::handoff::Transition;
    use leadline_core::learning::LearningStep;

    use super::{InboundMessage, Orchestrator, OutboundResult, ReplySource, Repositories, SuppressReason};
    use crate::classifier::KeywordClassifier;
    use crate::llm::{LlmClient, LlmContext, LlmError, LlmReply};

    const DISCLOSURE: &str = "This message is from an AI assistant.";

    struct CountingClient {
        inner: KeywordClassifier,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmClient for CountingClient {
        async fn classify_and_respond(
            &self,
            text: &str,
            context: &LlmContext,
        ) -> Result<LlmReply, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.classify_and_respond(text, context).await
        }
    }

    /// Replies with queued intents and drafts, never cacheable.
    struct ScriptedClient {
        replies: Mutex<VecDeque<(Intent, &'static str)>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<(Intent, &'static str)>) -> Self {
            Self { replies: Mutex::new(replies.into()) }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn classify_and_respond(
            &self,
            _text: &str,
            _context: &LlmContext,
        ) -> Result<LlmReply, LlmError> {
            let (intent, draft) = self
                .replies
                .lock()
                .expect("script lock")
                .pop_front()
                .ok_or_else(|| LlmError::Unavailable("script exhausted".to_string()))?;
            Ok(LlmReply {
                intent: IntentScore::new(intent, 0.9),
                alternatives: vec![],
                draft_reply: draft.to_string(),
                cacheable: false,
            })
        }
    }

    /// Always answers with the same cacheable draft.
    struct FixedClient {
        draft: &'static str,
        calls: AtomicU32,
    }

    impl FixedClient {
        fn new(draft: &'static str) -> Self {
            Self { draft, calls: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl LlmClient for FixedClient {
        async fn classify_and_respond(
            &self,
            _text: &str,
            _context: &LlmContext,
        ) -> Result<LlmReply, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(LlmReply {
                intent: IntentScore::new(Intent::Buy, 0.9),
                alternatives: vec![],
                draft_reply: self.draft.to_string(),
                cacheable: true,
            })
        }
    }

    struct SlowClient;

    #[async_trait]
    impl LlmClient for SlowClient {
        async fn classify_and_respond(
            &self,
            _text: &str,
            _context: &LlmContext,
        ) -> Result<LlmReply, LlmError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Err(LlmError::Unavailable("unreachable".to_string()))
        }
    }

    fn orchestrator(config: &AppConfig, client: Arc<dyn LlmClient>) -> (Orchestrator, Repositories) {
        let repositories = Repositories::in_memory();
        let orchestrator = Orchestrator::new(
            config,
            repositories.clone(),
            ResponseCache::in_memory(&config.cache),
            client,
        );
        (orchestrator, repositories)
    }

    fn sms(session: &str, text: &str) -> InboundMessage {
        InboundMessage::new(
            SessionId(session.to_string()),
            TenantId("acme".to_string()),
            ContactId("C-1".to_string()),
            Channel::Sms,
            text,
        )
    }

    #[tokio::test]
    async fn repeated_question_across_sessions_calls_the_model_once() {
        let config = AppConfig::default();
        let client = Arc::new(CountingClient { inner: KeywordClassifier::new(), calls: AtomicU32::new(0) });
        let (orchestrator, _) = orchestrator(&config, client.clone());

        let mut sources = Vec::new();
        for session in ["S-1", "S-2", "S-3"] {
            let result = orchestrator
                .handle_inbound(sms(session, "What's your return policy?"))
                .await
                .expect("handled");
            match result {
                OutboundResult::Delivered { text, source, .. } => {
                    assert!(text.starts_with(DISCLOSURE));
                    sources.push(source);
                }
                other => panic!("expected delivery, got {other:?}"),
            }
            orchestrator.flush_cache_writes().await;
        }

        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            sources,
            vec![ReplySource::Llm, ReplySource::Cache(CacheTier::L2), ReplySource::Cache(CacheTier::L2)]
        );
        let stats = orchestrator.cache_stats().await;
        assert_eq!(stats.l2_hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn disclosure_is_sent_once_per_session() {
        let config = AppConfig::default();
        let client = Arc::new(ScriptedClient::new(vec![
            (Intent::Sell, "What is the property address?"),
            (Intent::Sell, "When would you like to list?"),
        ]));
        let (orchestrator, _) = orchestrator(&config, client);

        let first = orchestrator.handle_inbound(sms("S-1", "I want to sell")).await.expect("first");
        let second = orchestrator.handle_inbound(sms("S-1", "123 Main St")).await.expect("second");

        let first_text = first.text().expect("first reply");
        assert_eq!(first_text.matches(DISCLOSURE).count(), 1);
        assert!(matches!(
            first,
            OutboundResult::Delivered { transition: Transition::Assigned(BotKind::Seller), .. }
        ));
        assert_eq!(second.text(), Some("When would you like to list?"));

        let session = orchestrator
            .get_session_state(&SessionId("S-1".to_string()))
            .await
            .expect("load")
            .expect("exists");
        assert!(session.compliance.ai_disclosure_sent);
        assert_eq!(session.automated_messages_sent, 2);
        assert_eq!(session.state, ConversationState::Seller);
    }

    #[tokio::test]
    async fn fair_housing_draft_is_never_delivered() {
        let config = AppConfig::default();
        let client = Arc::new(ScriptedClient::new(vec![(
            Intent::Buy,
            "Great news, this one is perfect for christian families.",
        )]));
        let (orchestrator, repositories) = orchestrator(&config, client);

        let result = orchestrator.handle_inbound(sms("S-1", "Any homes near the park?")).await.expect("handled");

        assert_eq!(
            result,
            OutboundResult::Escalated {
                text: Some(format!("{DISCLOSURE} {}", config.compliance.escalation_message)),
                error_class: ErrorClass::ComplianceBlocked,
            }
        );
        let session_id = SessionId("S-1".to_string());
        let session = orchestrator.get_session_state(&session_id).await.expect("load").expect("exists");
        assert!(session.needs_human_review);
        assert!(session.compliance_flags.contains(&ViolationType::FairHousingRisk));

        let violations = repositories.violations.list_for_session(&session_id).await.expect("violations");
        assert!(violations.iter().any(|violation| violation.violation_type == ViolationType::FairHousingRisk));
        let audit = repositories.audit_events.list_for_session(&session_id).await.expect("audit");
        assert!(audit.iter().any(|event| event.event_type == "compliance.blocked"));
    }

    #[tokio::test]
    async fn cached_reply_is_screened_against_tenant_fair_housing_rules() {
        let config = AppConfig::default();
        let client = Arc::new(FixedClient::new("The building is quiet and mostly retirees."));
        let (orchestrator, repositories) = orchestrator(&config, client.clone());
        let question = "Is the building quiet?";

        let first = orchestrator.handle_inbound(sms("S-1", question)).await.expect("handled");
        assert!(matches!(first, OutboundResult::Delivered { source: ReplySource::Llm, .. }));
        orchestrator.flush_cache_writes().await;

        // Rules change underneath an entry that is already cached.
        orchestrator
            .policies
            .update_tenant(
                &TenantId("acme".to_string()),
                TenantOverrides {
                    fair_housing_patterns: vec![r"\bmostly\s+retirees\b".to_string()],
                    ..TenantOverrides::default()
                },
            )
            .expect("valid overrides");

        let second = orchestrator.handle_inbound(sms("S-2", question)).await.expect("handled");
        assert!(matches!(
            second,
            OutboundResult::Escalated { error_class: ErrorClass::ComplianceBlocked, .. }
        ));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert!(second.text().is_some_and(|text| !text.contains("retirees")));

        let session_id = SessionId("S-2".to_string());
        let violations = repositories.violations.list_for_session(&session_id).await.expect("violations");
        assert!(violations.iter().any(|violation| violation.violation_type == ViolationType::FairHousingRisk));
    }

    #[tokio::test]
    async fn tenant_policy_update_drops_cached_replies() {
        let config = AppConfig::default();
        let client = Arc::new(FixedClient::new("Yes, it is a quiet street."));
        let (orchestrator, _) = orchestrator(&config, client.clone());
        let tenant = TenantId("acme".to_string());
        let question = "Is the street quiet?";

        orchestrator.handle_inbound(sms("S-1", question)).await.expect("handled");
        orchestrator.flush_cache_writes().await;

        let invalid = orchestrator
            .update_tenant_policy(
                &tenant,
                TenantOverrides { fair_housing_patterns: vec!["(".to_string()], ..TenantOverrides::default() },
            )
            .await;
        assert!(matches!(invalid, Err(ApplicationError::Configuration(_))));

        orchestrator
            .update_tenant_policy(
                &tenant,
                TenantOverrides { blocked_phrases: vec!["cash only".to_string()], ..TenantOverrides::default() },
            )
            .await
            .expect("update");

        let again = orchestrator.handle_inbound(sms("S-2", question)).await.expect("handled");
        assert!(matches!(again, OutboundResult::Delivered { source: ReplySource::Llm, .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn opting_out_drops_the_contacts_cached_replies() {
        let config = AppConfig::default();
        let client = Arc::new(FixedClient::new("Parking is included with every unit."));
        let (orchestrator, _) = orchestrator(&config, client);
        let question = "Is parking included?";

        orchestrator.handle_inbound(sms("S-1", question)).await.expect("handled");
        orchestrator.flush_cache_writes().await;

        let result = orchestrator.handle_inbound(sms("S-2", "Stop texting me")).await.expect("handled");
        assert!(matches!(
            result,
            OutboundResult::Suppressed { reason: SuppressReason::OptedOut { ref keyword }, .. } if keyword == "STOP"
        ));

        let scope = CacheScope {
            tenant_id: TenantId("acme".to_string()),
            contact_id: ContactId("C-1".to_string()),
            conversation_id: SessionId("S-3".to_string()),
        };
        let lookup = orchestrator
            .cache
            .lookup_at(question, &scope, &CachePolicy::from_config(&config.cache), Utc::now())
            .await;
        assert_eq!(lookup, CacheLookup::Miss);
    }

    #[tokio::test]
    async fn llm_timeout_degrades_and_flags_the_session() {
        let mut config = AppConfig::default();
        config.llm.timeout_ms = 20;
        let (orchestrator, _) = orchestrator(&config, Arc::new(SlowClient));

        let result = orchestrator.handle_inbound(sms("S-1", "Is anyone there?")).await.expect("never errors");

        assert_eq!(
            result,
            OutboundResult::Degraded {
                text: format!("{DISCLOSURE} {}", config.compliance.hold_message),
                error_class: ErrorClass::LlmTimeout,
            }
        );
        let session = orchestrator
            .get_session_state(&SessionId("S-1".to_string()))
            .await
            .expect("load")
            .expect("exists");
        assert!(session.needs_human_review);
        assert_eq!(session.state, ConversationState::Unassigned);
    }

    #[tokio::test]
    async fn ping_pong_handoffs_escalate_at_the_loop_limit() {
        let config = AppConfig::default();
        let client = Arc::new(ScriptedClient::new(vec![
            (Intent::Sell, "Tell me about your home."),
            (Intent::Buy, "What area are you looking in?"),
            (Intent::Sell, "When do you want to list?"),
            (Intent::Buy, "What is your budget?"),
            (Intent::Sell, "Let's talk about selling."),
        ]));
        let (orchestrator, _) = orchestrator(&config, client);

        let mut results = Vec::new();
        for turn in 0..5 {
            results.push(orchestrator.handle_inbound(sms("S-1", &format!("turn {turn}"))).await.expect("handled"));
        }

        assert!(matches!(results[1], OutboundResult::Delivered { transition: Transition::HandedOff { .. }, .. }));
        assert!(matches!(
            results[4],
            OutboundResult::Escalated { error_class: ErrorClass::HandoffLoopLimitExceeded, .. }
        ));
        let session = orchestrator
            .get_session_state(&SessionId("S-1".to_string()))
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(session.state, ConversationState::HumanEscalation);
        assert!(session.needs_human_review);

        let after = orchestrator.handle_inbound(sms("S-1", "hello?")).await.expect("handled");
        assert_eq!(
            after,
            OutboundResult::Suppressed {
                text: None,
                reason: SuppressReason::Terminal(ConversationState::HumanEscalation),
            }
        );
    }

    #[tokio::test]
    async fn opt_out_skips_the_model_and_carries_to_new_sessions() {
        let config = AppConfig::default();
        let client = Arc::new(CountingClient { inner: KeywordClassifier::new(), calls: AtomicU32::new(0) });
        let (orchestrator, repositories) = orchestrator(&config, client.clone());

        let result = orchestrator.handle_inbound(sms("S-1", "Stop")).await.expect("handled");
        assert_eq!(
            result,
            OutboundResult::Suppressed {
                text: Some(config.compliance.opt_out_confirmation.clone()),
                reason: SuppressReason::OptedOut { keyword: "STOP".to_string() },
            }
        );
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert!(repositories
            .opt_outs
            .is_opted_out(&TenantId("acme".to_string()), &ContactId("C-1".to_string()))
            .await
            .expect("lookup"));

        orchestrator.handle_inbound(sms("S-2", "What's your timeline?")).await.expect("handled");
        let session = orchestrator
            .get_session_state(&SessionId("S-2".to_string()))
            .await
            .expect("load")
            .expect("exists");
        assert!(session.compliance.opted_out);
    }

    #[tokio::test]
    async fn handoff_outcomes_are_recorded_once_and_feed_the_learner() {
        let config = AppConfig::default();
        let client = Arc::new(ScriptedClient::new(vec![(Intent::Sell, "Tell me about your home.")]));
        let (orchestrator, _) = orchestrator(&config, client);

        orchestrator.handle_inbound(sms("S-1", "I want to sell")).await.expect("handled");
        let session = orchestrator
            .get_session_state(&SessionId("S-1".to_string()))
            .await
            .expect("load")
            .expect("exists");
        let event_id = session.handoff_history[0].id.clone();

        let step = orchestrator
            .record_handoff_outcome(&event_id, HandoffOutcome::Success)
            .await
            .expect("recorded");
        assert!(matches!(step, LearningStep::Recorded(ref threshold) if threshold.sample_count == 1));

        let again = orchestrator.record_handoff_outcome(&event_id, HandoffOutcome::Failure).await;
        assert!(matches!(again, Err(ApplicationError::Domain(DomainError::OutcomeAlreadyRecorded(_)))));
    }

    #[tokio::test]
    async fn lead_fallback_outcomes_leave_thresholds_alone() {
        let config = AppConfig::default();
        let client = Arc::new(ScriptedClient::new(vec![(Intent::Unknown, "How can I help today?")]));
        let (orchestrator, repositories) = orchestrator(&config, client);

        let result = orchestrator.handle_inbound(sms("S-1", "hmm")).await.expect("handled");
        assert!(matches!(
            result,
            OutboundResult::Delivered { transition: Transition::Assigned(BotKind::Lead), .. }
        ));
        let session = orchestrator
            .get_session_state(&SessionId("S-1".to_string()))
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(session.handoff_history.len(), 1);
        let event = session.handoff_history[0].clone();
        assert!(event.fallback);

        let step = orchestrator
            .record_handoff_outcome(&event.id, HandoffOutcome::Failure)
            .await
            .expect("recorded");
        assert_eq!(step, LearningStep::Ignored);
        let stored = repositories.handoff_events.find_by_id(&event.id).await.expect("find").expect("exists");
        assert_eq!(stored.outcome, HandoffOutcome::Failure);
    }

    #[tokio::test]
    async fn override_rejects_self_edges_and_applies_to_routing() {
        let config = AppConfig::default();
        let (orchestrator, _) = orchestrator(&config, Arc::new(KeywordClassifier::new()));
        let tenant = TenantId("acme".to_string());

        let invalid = orchestrator
            .admin_override_threshold(&tenant, HandoffEdge::new(ConversationState::Seller, BotKind::Seller), 0.8)
            .await;
        assert!(matches!(invalid, Err(ApplicationError::Domain(DomainError::InvalidHandoff { .. }))));

        let edge = HandoffEdge::new(ConversationState::Unassigned, BotKind::Seller);
        let threshold = orchestrator.admin_override_threshold(&tenant, edge, 0.99).await.expect("override");
        assert_eq!(threshold.current_value, 0.99);

        // 0.75 no longer clears Unassigned -> Seller, so the lead bot takes the conversation.
        let result = orchestrator
            .handle_inbound(sms("S-1", "I want to sell, what is my home worth?"))
            .await
            .expect("handled");
        assert!(matches!(
            result,
            OutboundResult::Delivered { transition: Transition::Assigned(BotKind::Lead), .. }
        ));
    }

    #[tokio::test]
    async fn close_and_archive_manage_session_lifecycle() {
        let mut config = AppConfig::default();
        config.session.inactivity_archive_secs = 60;
        let (orchestrator, _) = orchestrator(&config, Arc::new(KeywordClassifier::new()));

        orchestrator.handle_inbound(sms("S-1", "looking to buy a 3 bedroom")).await.expect("handled");
        orchestrator.handle_inbound(sms("S-2", "What's your return policy?")).await.expect("handled");

        let closed = orchestrator.close_session(&SessionId("S-1".to_string())).await.expect("close");
        assert_eq!(closed, ConversationState::Closed);
        assert_eq!(
            orchestrator.close_session(&SessionId("S-1".to_string())).await.expect("close again"),
            ConversationState::Closed
        );

        assert_eq!(orchestrator.archive_inactive_sessions(Utc::now()).await.expect("sweep"), 0);
        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(orchestrator.archive_inactive_sessions(later).await.expect("sweep"), 2);

        let result = orchestrator.handle_inbound(sms("S-2", "Are you still there?")).await.expect("handled");
        assert!(matches!(result, OutboundResult::Delivered { .. }));
        let session = orchestrator
            .get_session_state(&SessionId("S-2".to_string()))
            .await
            .expect("load")
            .expect("exists");
        assert!(!session.is_archived());
    }
}
