//! Routing between the seller, buyer and lead bots.
//!
//! A candidate bot is taken only when its adjusted confidence clears the learned threshold
//! for `(current state -> candidate)`. Every attempt is recorded on the session, rejected or
//! not, and accepted bot-to-bot handoffs are capped per rolling window.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use crate::config::HandoffConfig;
use crate::domain::bot::{BotKind, ConversationState};
use crate::domain::classification::{Classification, ClassificationSource, HandoffCandidate};
use crate::domain::handoff::{HandoffEdge, HandoffEvent, HandoffEventId};
use crate::domain::session::ConversationSession;
use crate::errors::DomainError;

const MAX_WINDOW_SECS: i64 = 365 * 24 * 60 * 60;

/// Current threshold for an edge.
pub trait ThresholdSource {
    fn threshold(&self, edge: HandoffEdge) -> f64;
}

/// Thresholds resolved ahead of an evaluation; edges not present use the default.
#[derive(Clone, Debug, PartialEq)]
pub struct ThresholdSnapshot {
    pub default_value: f64,
    pub values: BTreeMap<HandoffEdge, f64>,
}

impl ThresholdSnapshot {
    pub fn uniform(default_value: f64) -> Self {
        Self { default_value, values: BTreeMap::new() }
    }

    pub fn with(mut self, edge: HandoffEdge, value: f64) -> Self {
        self.values.insert(edge, value);
        self
    }
}

impl ThresholdSource for ThresholdSnapshot {
    fn threshold(&self, edge: HandoffEdge) -> f64 {
        self.values.get(&edge).copied().unwrap_or(self.default_value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Transition {
    /// Terminal session; the classification was not considered.
    Ignored,
    Assigned(BotKind),
    Stayed,
    HandedOff { from: BotKind, to: BotKind },
    Escalated { from: BotKind, attempted: BotKind, handoffs_in_window: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct HandoffDecision {
    pub transition: Transition,
    /// Events appended to the session by this evaluation, in order.
    pub events: Vec<HandoffEvent>,
}

impl HandoffDecision {
    pub fn rejected(&self) -> impl Iterator<Item = &HandoffEvent> {
        self.events.iter().filter(|event| event.rejected)
    }
}

#[derive(Clone, Debug)]
pub struct HandoffStateMachine {
    config: HandoffConfig,
}

impl HandoffStateMachine {
    pub fn new(config: HandoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HandoffConfig {
        &self.config
    }

    /// Edges whose thresholds an evaluation from `state` may consult.
    pub fn edges_from(state: ConversationState) -> Vec<HandoffEdge> {
        if state.is_terminal() {
            return Vec::new();
        }
        BotKind::ALL
            .into_iter()
            .filter(|bot| state.active_bot() != Some(*bot))
            .map(|bot| HandoffEdge::new(state, bot))
            .collect()
    }

    /// Confidence as the state machine sees it: cached scores are discounted by similarity and
    /// a fixed penalty, and an optional lead-quality signal is blended in.
    pub fn adjust_confidence(&self, classification: &Classification, lead_quality: Option<f64>) -> Classification {
        let mut adjusted = classification.clone();
        if let ClassificationSource::Cached { similarity, .. } = classification.source {
            let penalty = self.config.cached_confidence_penalty;
            adjusted = adjusted.map_confidence(|value| value * f64::from(similarity) - penalty);
        }

        let weight = self.config.lead_signal_weight;
        if let Some(quality) = lead_quality.filter(|_| weight > 0.0) {
            let quality = quality.clamp(0.0, 1.0);
            adjusted = adjusted.map_confidence(|value| (1.0 - weight) * value + weight * quality);
        }
        adjusted
    }

    pub fn evaluate(
        &self,
        session: &mut ConversationSession,
        classification: &Classification,
        thresholds: &dyn ThresholdSource,
        lead_quality: Option<f64>,
        now: DateTime<Utc>,
    ) -> HandoffDecision {
        let from = session.state;
        if from.is_terminal() {
            return HandoffDecision { transition: Transition::Ignored, events: Vec::new() };
        }

        let adjusted = self.adjust_confidence(classification, lead_quality);
        let engaged = session.engaged_bots();
        let mut events = Vec::new();
        let mut qualifying: Vec<(HandoffCandidate, f64)> = Vec::new();

        for candidate in adjusted.candidates() {
            if session.active_bot() == Some(candidate.target) {
                continue;
            }
            let threshold = thresholds.threshold(HandoffEdge::new(from, candidate.target));
            if candidate.confidence >= threshold {
                qualifying.push((candidate, threshold));
            } else {
                events.push(new_event(
                    session,
                    from,
                    candidate.target.into(),
                    candidate.confidence,
                    threshold,
                    true,
                    now,
                ));
            }
        }

        qualifying.sort_by(|(left, _), (right, _)| {
            right
                .confidence
                .total_cmp(&left.confidence)
                .then_with(|| engaged.contains(&left.target).cmp(&engaged.contains(&right.target)))
                .then_with(|| bot_rank(left.target).cmp(&bot_rank(right.target)))
        });
        let best = qualifying.first().copied();

        let transition = match (from.active_bot(), best) {
            (None, Some((candidate, threshold))) => {
                events.push(new_event(
                    session,
                    from,
                    candidate.target.into(),
                    candidate.confidence,
                    threshold,
                    false,
                    now,
                ));
                session.state = candidate.target.into();
                Transition::Assigned(candidate.target)
            }
            (None, None) => {
                let fallback = BotKind::Lead;
                let confidence = adjusted
                    .candidates()
                    .into_iter()
                    .find(|candidate| candidate.target == fallback)
                    .map_or(0.0, |candidate| candidate.confidence);
                let threshold = thresholds.threshold(HandoffEdge::new(from, fallback));
                // The assignment itself stands in for the below-threshold lead attempt.
                events.retain(|event| event.to_state != ConversationState::Lead);
                events.push(
                    new_event(session, from, fallback.into(), confidence, threshold, false, now).as_fallback(),
                );
                session.state = fallback.into();
                Transition::Assigned(fallback)
            }
            (Some(_), None) => Transition::Stayed,
            (Some(current), Some((candidate, threshold))) => {
                let window_start = now - Duration::seconds(self.window_secs());
                let recent = session.handoffs_since(window_start);
                if recent >= self.config.max_handoffs_per_window {
                    events.push(new_event(
                        session,
                        from,
                        ConversationState::HumanEscalation,
                        candidate.confidence,
                        threshold,
                        false,
                        now,
                    ));
                    session.state = ConversationState::HumanEscalation;
                    session.needs_human_review = true;
                    Transition::Escalated {
                        from: current,
                        attempted: candidate.target,
                        handoffs_in_window: recent,
                    }
                } else {
                    events.push(new_event(
                        session,
                        from,
                        candidate.target.into(),
                        candidate.confidence,
                        threshold,
                        false,
                        now,
                    ));
                    session.state = candidate.target.into();
                    Transition::HandedOff { from: current, to: candidate.target }
                }
            }
        };

        session.handoff_history.extend(events.iter().cloned());
        HandoffDecision { transition, events }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn evaluate_with_audit<S>(
        &self,
        session: &mut ConversationSession,
        classification: &Classification,
        thresholds: &dyn ThresholdSource,
        lead_quality: Option<f64>,
        now: DateTime<Utc>,
        sink: &S,
        audit: &AuditContext,
    ) -> HandoffDecision
    where
        S: AuditSink + ?Sized,
    {
        let decision = self.evaluate(session, classification, thresholds, lead_quality, now);

        for event in &decision.events {
            let (event_type, outcome) = if event.rejected {
                ("handoff.rejected", AuditOutcome::Rejected)
            } else {
                match (event.from_state, event.to_state) {
                    _ if event.fallback => ("handoff.fallback", AuditOutcome::Success),
                    (_, ConversationState::HumanEscalation) => ("handoff.escalated", AuditOutcome::Success),
                    (ConversationState::Unassigned, _) => ("handoff.assigned", AuditOutcome::Success),
                    _ => ("handoff.accepted", AuditOutcome::Success),
                }
            };
            sink.emit(
                audit
                    .event(event_type, AuditCategory::Handoff, outcome)
                    .with_metadata("event_id", event.id.0.clone())
                    .with_metadata("from", event.from_state.as_str())
                    .with_metadata("to", event.to_state.as_str())
                    .with_metadata("confidence", format!("{:.3}", event.confidence))
                    .with_metadata("threshold", format!("{:.3}", event.threshold_used)),
            );
        }
        decision
    }

    /// Closes the session. Returns `None` when it was already closed.
    pub fn close(
        &self,
        session: &mut ConversationSession,
        now: DateTime<Utc>,
    ) -> Result<Option<HandoffEvent>, DomainError> {
        match session.state {
            ConversationState::Closed => Ok(None),
            from => {
                let event = new_event(session, from, ConversationState::Closed, 1.0, 0.0, false, now);
                session.state = ConversationState::Closed;
                session.handoff_history.push(event.clone());
                Ok(Some(event))
            }
        }
    }

    pub fn close_with_audit<S>(
        &self,
        session: &mut ConversationSession,
        now: DateTime<Utc>,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<Option<HandoffEvent>, DomainError>
    where
        S: AuditSink + ?Sized,
    {
        let from = session.state;
        let closed = self.close(session, now)?;
        if closed.is_some() {
            sink.emit(
                audit
                    .event("session.closed", AuditCategory::Handoff, AuditOutcome::Success)
                    .with_metadata("from", from.as_str()),
            );
        }
        Ok(closed)
    }

    fn window_secs(&self) -> i64 {
        i64::try_from(self.config.loop_window_secs).unwrap_or(MAX_WINDOW_SECS).min(MAX_WINDOW_SECS)
    }
}

fn bot_rank(bot: BotKind) -> usize {
    BotKind::ALL.iter().position(|candidate| *candidate == bot).unwrap_or(BotKind::ALL.len())
}

fn new_event(
    session: &ConversationSession,
    from: ConversationState,
    to: ConversationState,
    confidence: f64,
    threshold: f64,
    rejected: bool,
    now: DateTime<Utc>,
) -> HandoffEvent {
    HandoffEvent::new(
        HandoffEventId(Uuid::new_v4().to_string()),
        session,
        from,
        to,
        confidence,
        threshold,
        rejected,
        now,
    )
}
