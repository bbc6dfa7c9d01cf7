use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::bot::{BotKind, ConversationState};
use crate::domain::session::{ConversationSession, SessionId, TenantId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandoffEventId(pub String);

impl fmt::Display for HandoffEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffOutcome {
    Pending,
    Success,
    Failure,
}

impl HandoffOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }

    pub fn is_decisive(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Directed routing edge. Thresholds are learned per tenant and edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandoffEdge {
    pub from: ConversationState,
    pub to: BotKind,
}

impl HandoffEdge {
    pub fn new(from: ConversationState, to: BotKind) -> Self {
        Self { from, to }
    }
}

impl fmt::Display for HandoffEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandoffEvent {
    pub id: HandoffEventId,
    pub session_id: SessionId,
    pub tenant_id: TenantId,
    pub from_state: ConversationState,
    pub to_state: ConversationState,
    pub confidence: f64,
    pub threshold_used: f64,
    pub rejected: bool,
    /// Default assignment taken because no candidate cleared its threshold.
    #[serde(default)]
    pub fallback: bool,
    pub outcome: HandoffOutcome,
    pub occurred_at: DateTime<Utc>,
}

impl HandoffEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: HandoffEventId,
        session: &ConversationSession,
        from_state: ConversationState,
        to_state: ConversationState,
        confidence: f64,
        threshold_used: f64,
        rejected: bool,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            session_id: session.id.clone(),
            tenant_id: session.tenant_id.clone(),
            from_state,
            to_state,
            confidence,
            threshold_used,
            rejected,
            fallback: false,
            outcome: HandoffOutcome::Pending,
            occurred_at,
        }
    }

    pub fn as_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    /// Whether a downstream outcome may move the threshold of this event's edge.
    pub fn is_threshold_gated(&self) -> bool {
        !self.rejected && !self.fallback
    }

    /// Learning edge for this event; escalations and closures have none.
    pub fn edge(&self) -> Option<HandoffEdge> {
        self.to_state.active_bot().map(|to| HandoffEdge::new(self.from_state, to))
    }

    pub fn counts_toward_loop_limit(&self) -> bool {
        !self.rejected
            && self.from_state.active_bot().is_some()
            && self.to_state.active_bot().is_some()
    }
}
