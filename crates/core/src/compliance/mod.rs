//! Outbound message gate.
//!
//! Rules run in order. Injection rules rewrite the text and continue; the first blocking rule
//! ends evaluation and the draft is never delivered.

pub mod rules;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::bot::Channel;
use crate::domain::compliance::{ComplianceAction, ComplianceViolation, ViolationId, ViolationType};
use crate::domain::session::ConversationSession;

pub use rules::{ComplianceRule, RuleError, RuleSet, RuleSpec};

#[derive(Clone, Debug, PartialEq)]
pub enum ComplianceDecision {
    Allowed { text: String, notes: Vec<ComplianceViolation> },
    Blocked(ComplianceViolation),
}

impl ComplianceDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Every violation record this decision produced.
    pub fn violations(&self) -> Vec<&ComplianceViolation> {
        match self {
            Self::Allowed { notes, .. } => notes.iter().collect(),
            Self::Blocked(violation) => vec![violation],
        }
    }

    /// Records the decision on the session. Disclosure state only changes when the message
    /// actually goes out; a block is still remembered as an observed violation kind.
    pub fn apply_to(&self, session: &mut ConversationSession) {
        match self {
            Self::Allowed { notes, .. } => {
                for note in notes {
                    match note.violation_type {
                        ViolationType::BotDisclosureMissing => {
                            session.compliance.ai_disclosure_sent = true
                        }
                        ViolationType::RecordingConsentMissing => {
                            session.compliance.recording_notice_sent = true
                        }
                        _ => {}
                    }
                    session.compliance_flags.insert(note.violation_type);
                }
                session.automated_messages_sent = session.automated_messages_sent.saturating_add(1);
            }
            Self::Blocked(violation) => {
                session.compliance_flags.insert(violation.violation_type);
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct ComplianceGuard {
    rules: Arc<RuleSet>,
}

impl ComplianceGuard {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn validate(
        &self,
        outbound_text: &str,
        channel: Channel,
        session: &ConversationSession,
    ) -> ComplianceDecision {
        self.validate_at(outbound_text, channel, session, Utc::now())
    }

    pub fn validate_at(
        &self,
        outbound_text: &str,
        channel: Channel,
        session: &ConversationSession,
        now: DateTime<Utc>,
    ) -> ComplianceDecision {
        let mut text = outbound_text.trim().to_string();
        let mut notes = Vec::new();

        for rule in &self.rules.rules {
            match rule {
                ComplianceRule::RecordingNotice { text: notice } => {
                    if channel.is_voice()
                        && !session.compliance.recording_notice_sent
                        && !contains_ignore_case(&text, notice)
                    {
                        text = format!("{notice} {text}");
                        notes.push(self.violation(rule, session, ComplianceAction::Injected, notice, now));
                    }
                }
                ComplianceRule::AiDisclosure { text: disclosure } => {
                    if !session.compliance.ai_disclosure_sent && !contains_ignore_case(&text, disclosure) {
                        text = format!("{disclosure} {text}");
                        notes.push(self.violation(
                            rule,
                            session,
                            ComplianceAction::Injected,
                            disclosure,
                            now,
                        ));
                    }
                }
                ComplianceRule::FairHousing { patterns } => {
                    if let Some(found) = patterns.iter().find_map(|pattern| pattern.find(&text)) {
                        let evidence = format!("matched `{}` in: {text}", found.as_str());
                        return ComplianceDecision::Blocked(
                            self.violation(rule, session, ComplianceAction::Blocked, &evidence, now)
                                .with_remediation(rules::FAIR_HOUSING_REMEDIATION),
                        );
                    }
                }
                ComplianceRule::OptOutPromotional { markers } => {
                    if session.compliance.opted_out {
                        let lowered = text.to_lowercase();
                        if let Some(marker) = markers.iter().find(|marker| lowered.contains(marker.as_str())) {
                            let evidence = format!("promotional marker `{marker}` in: {text}");
                            return ComplianceDecision::Blocked(
                                self.violation(rule, session, ComplianceAction::Blocked, &evidence, now)
                                    .with_remediation(rules::OPT_OUT_REMEDIATION),
                            );
                        }
                    }
                }
                ComplianceRule::BlockedPhrase { phrase } => {
                    if text.to_lowercase().contains(phrase.as_str()) {
                        let evidence = format!("blocked phrase `{phrase}` in: {text}");
                        return ComplianceDecision::Blocked(
                            self.violation(rule, session, ComplianceAction::Blocked, &evidence, now)
                                .with_remediation(format!("Remove the phrase `{phrase}`.")),
                        );
                    }
                }
            }
        }

        if channel == Channel::Sms {
            text = truncate_chars(&text, self.rules.sms_max_chars);
        }
        ComplianceDecision::Allowed { text, notes }
    }

    fn violation(
        &self,
        rule: &ComplianceRule,
        session: &ConversationSession,
        action: ComplianceAction,
        evidence: &str,
        now: DateTime<Utc>,
    ) -> ComplianceViolation {
        ComplianceViolation {
            id: ViolationId(Uuid::new_v4().to_string()),
            session_id: session.id.clone(),
            tenant_id: session.tenant_id.clone(),
            violation_type: rule.violation_type(),
            severity: rule.severity(),
            action,
            rule: rule.name().to_string(),
            evidence: evidence.to_string(),
            remediation: None,
            occurred_at: now,
        }
    }
}

trait WithRemediation {
    fn with_remediation(self, remediation: impl Into<String>) -> Self;
}

impl WithRemediation for ComplianceViolation {
    fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    let needle = needle.trim().to_lowercase();
    !needle.is_empty() && haystack.to_lowercase().contains(&needle)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    truncated.push('…');
    truncated
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::{ComplianceDecision, ComplianceGuard, RuleSet};
    use crate::config::{ComplianceConfig, TenantOverrides};
    use crate::domain::bot::Channel;
    use crate::domain::compliance::{ComplianceAction, Severity, ViolationType};
    use crate::domain::session::{ContactId, ConversationSession, SessionId, TenantId};

    fn guard() -> ComplianceGuard {
        ComplianceGuard::new(Arc::new(
            RuleSet::compile(&ComplianceConfig::default(), None).expect("default rules compile"),
        ))
    }

    fn session(channel: Channel) -> ConversationSession {
        ConversationSession::new(
            SessionId("S-1".to_owned()),
            TenantId("acme".to_owned()),
            ContactId("C-1".to_owned()),
            channel,
            Utc::now(),
        )
    }

    #[test]
    fn first_message_gets_disclosure_exactly_once() {
        let guard = guard();
        let mut session = session(Channel::Sms);
        let disclosure = ComplianceConfig::default().ai_disclosure_text;

        let first = guard.validate("Happy to help you find a home.", Channel::Sms, &session);
        let ComplianceDecision::Allowed { text, notes } = &first else {
            panic!("expected allowed, got {first:?}");
        };
        assert_eq!(text.matches(disclosure.as_str()).count(), 1);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].action, ComplianceAction::Injected);
        first.apply_to(&mut session);
        assert!(session.compliance.ai_disclosure_sent);
        assert_eq!(session.automated_messages_sent, 1);

        let second = guard.validate("What is your budget?", Channel::Sms, &session);
        assert_eq!(
            second,
            ComplianceDecision::Allowed { text: "What is your budget?".to_owned(), notes: vec![] }
        );
    }

    #[test]
    fn disclosure_already_present_is_not_duplicated() {
        let guard = guard();
        let session = session(Channel::Chat);
        let disclosure = ComplianceConfig::default().ai_disclosure_text;
        let draft = format!("{disclosure} How can I help?");

        let ComplianceDecision::Allowed { text, notes } = guard.validate(&draft, Channel::Chat, &session) else {
            panic!("expected allowed");
        };
        assert_eq!(text, draft);
        assert!(notes.is_empty());
    }

    #[test]
    fn voice_channel_gets_recording_notice() {
        let guard = guard();
        let session = session(Channel::Voice);

        let decision = guard.validate("Thanks for calling.", Channel::Voice, &session);
        let types: Vec<ViolationType> = decision.violations().iter().map(|v| v.violation_type).collect();
        assert_eq!(
            types,
            vec![ViolationType::RecordingConsentMissing, ViolationType::BotDisclosureMissing]
        );
    }

    #[test]
    fn fair_housing_risk_is_blocked_and_flags_are_not_applied() {
        let guard = guard();
        let mut session = session(Channel::Sms);

        let decision = guard.validate(
            "This is a quiet building, perfect for Christians, and there are no kids next door.",
            Channel::Sms,
            &session,
        );
        let ComplianceDecision::Blocked(violation) = &decision else {
            panic!("expected block, got {decision:?}");
        };
        assert_eq!(violation.violation_type, ViolationType::FairHousingRisk);
        assert_eq!(violation.severity, Severity::Critical);
        assert!(violation.remediation.is_some());

        decision.apply_to(&mut session);
        assert!(!session.compliance.ai_disclosure_sent);
        assert!(session.compliance_flags.contains(&ViolationType::FairHousingRisk));
        assert_eq!(session.automated_messages_sent, 0);
    }

    #[test]
    fn promotional_message_to_opted_out_recipient_is_blocked() {
        let guard = guard();
        let mut session = session(Channel::Sms);
        session.compliance.ai_disclosure_sent = true;

        let promo = "Join our open house this Saturday!";
        assert!(guard.validate(promo, Channel::Sms, &session).is_allowed());

        session.compliance.opted_out = true;
        let decision = guard.validate(promo, Channel::Sms, &session);
        assert!(matches!(
            decision,
            ComplianceDecision::Blocked(ref v)
                if v.violation_type == ViolationType::OptOutIgnored && v.severity == Severity::High
        ));
        assert!(guard.validate("Your showing is confirmed.", Channel::Sms, &session).is_allowed());
    }

    #[test]
    fn tenant_blocked_phrase_and_sms_length() {
        let overrides = TenantOverrides {
            blocked_phrases: vec!["guaranteed appreciation".to_owned()],
            ..TenantOverrides::default()
        };
        let guard = ComplianceGuard::new(Arc::new(
            RuleSet::compile(&ComplianceConfig::default(), Some(&overrides)).expect("compile"),
        ));
        let mut session = session(Channel::Sms);
        session.compliance.ai_disclosure_sent = true;

        assert!(matches!(
            guard.validate("Guaranteed appreciation in 2 years!", Channel::Sms, &session),
            ComplianceDecision::Blocked(ref v) if v.violation_type == ViolationType::Other
        ));

        let long = "a".repeat(500);
        let ComplianceDecision::Allowed { text, .. } = guard.validate(&long, Channel::Sms, &session) else {
            panic!("expected allowed");
        };
        assert_eq!(text.chars().count(), 320);
        let ComplianceDecision::Allowed { text, .. } = guard.validate(&long, Channel::Chat, &session) else {
            panic!("expected allowed");
        };
        assert_eq!(text.len(), 500);
    }
}
