use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::bot::{BotKind, Channel, ConversationState};
use crate::domain::compliance::ViolationType;
use crate::domain::handoff::HandoffEvent;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceState {
    pub ai_disclosure_sent: bool,
    pub recording_notice_sent: bool,
    pub opted_out: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: SessionId,
    pub tenant_id: TenantId,
    pub contact_id: ContactId,
    pub channel: Channel,
    pub state: ConversationState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub handoff_history: Vec<HandoffEvent>,
    pub compliance_flags: BTreeSet<ViolationType>,
    pub compliance: ComplianceState,
    pub automated_messages_sent: u32,
    pub needs_human_review: bool,
    pub archived_at: Option<DateTime<Utc>>,
}

impl ConversationSession {
    pub fn new(
        id: SessionId,
        tenant_id: TenantId,
        contact_id: ContactId,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tenant_id,
            contact_id,
            channel,
            state: ConversationState::Unassigned,
            created_at: now,
            last_activity_at: now,
            handoff_history: Vec::new(),
            compliance_flags: BTreeSet::new(),
            compliance: ComplianceState::default(),
            automated_messages_sent: 0,
            needs_human_review: false,
            archived_at: None,
        }
    }

    pub fn active_bot(&self) -> Option<BotKind> {
        self.state.active_bot()
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
    }

    /// Bots that have held this conversation at any point, including the current one.
    pub fn engaged_bots(&self) -> BTreeSet<BotKind> {
        let mut engaged: BTreeSet<BotKind> = self
            .handoff_history
            .iter()
            .filter(|event| !event.rejected)
            .filter_map(|event| event.to_state.active_bot())
            .collect();
        if let Some(bot) = self.active_bot() {
            engaged.insert(bot);
        }
        engaged
    }

    /// Accepted bot-to-bot handoffs at or after `since`.
    pub fn handoffs_since(&self, since: DateTime<Utc>) -> usize {
        self.handoff_history
            .iter()
            .filter(|event| event.counts_toward_loop_limit() && event.occurred_at >= since)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{ContactId, ConversationSession, SessionId, TenantId};
    use crate::domain::bot::{BotKind, Channel, ConversationState};
    use crate::domain::handoff::{HandoffEvent, HandoffEventId};

    fn session() -> ConversationSession {
        ConversationSession::new(
            SessionId("S-1".to_owned()),
            TenantId("acme".to_owned()),
            ContactId("C-1".to_owned()),
            Channel::Sms,
            Utc::now(),
        )
    }

    #[test]
    fn new_session_starts_unassigned() {
        let session = session();
        assert_eq!(session.state, ConversationState::Unassigned);
        assert!(session.engaged_bots().is_empty());
        assert!(!session.is_archived());
    }

    #[test]
    fn loop_counter_ignores_rejected_and_initial_assignment() {
        let mut session = session();
        let now = Utc::now();
        session.handoff_history.push(HandoffEvent::new(
            HandoffEventId("H-1".to_owned()),
            &session,
            ConversationState::Unassigned,
            ConversationState::Lead,
            0.9,
            0.7,
            false,
            now,
        ));
        session.state = ConversationState::Lead;
        session.handoff_history.push(HandoffEvent::new(
            HandoffEventId("H-2".to_owned()),
            &session,
            ConversationState::Lead,
            ConversationState::Seller,
            0.5,
            0.7,
            true,
            now,
        ));
        session.handoff_history.push(HandoffEvent::new(
            HandoffEventId("H-3".to_owned()),
            &session,
            ConversationState::Lead,
            ConversationState::Buyer,
            0.8,
            0.7,
            false,
            now,
        ));

        assert_eq!(session.handoffs_since(now - Duration::minutes(10)), 1);
        assert!(session.engaged_bots().contains(&BotKind::Buyer));
        assert!(!session.engaged_bots().contains(&BotKind::Seller));
    }
}
