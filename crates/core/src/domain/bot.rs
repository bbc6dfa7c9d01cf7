use std::fmt;

use serde::{Deserialize, Serialize};

/// Specialized conversational agents a session can be routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotKind {
    Seller,
    Buyer,
    Lead,
}

impl BotKind {
    /// Stable order used as the last tie-breaker between equally scored candidates.
    pub const ALL: [BotKind; 3] = [BotKind::Seller, BotKind::Buyer, BotKind::Lead];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seller => "seller",
            Self::Buyer => "buyer",
            Self::Lead => "lead",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "seller" => Some(Self::Seller),
            "buyer" => Some(Self::Buyer),
            "lead" => Some(Self::Lead),
            _ => None,
        }
    }
}

impl fmt::Display for BotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Unassigned,
    Seller,
    Buyer,
    Lead,
    HumanEscalation,
    Closed,
}

impl ConversationState {
    pub fn active_bot(&self) -> Option<BotKind> {
        match self {
            Self::Seller => Some(BotKind::Seller),
            Self::Buyer => Some(BotKind::Buyer),
            Self::Lead => Some(BotKind::Lead),
            Self::Unassigned | Self::HumanEscalation | Self::Closed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::HumanEscalation | Self::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unassigned => "unassigned",
            Self::Seller => "seller",
            Self::Buyer => "buyer",
            Self::Lead => "lead",
            Self::HumanEscalation => "human_escalation",
            Self::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "unassigned" => Some(Self::Unassigned),
            "seller" => Some(Self::Seller),
            "buyer" => Some(Self::Buyer),
            "lead" => Some(Self::Lead),
            "human_escalation" => Some(Self::HumanEscalation),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl From<BotKind> for ConversationState {
    fn from(bot: BotKind) -> Self {
        match bot {
            BotKind::Seller => Self::Seller,
            BotKind::Buyer => Self::Buyer,
            BotKind::Lead => Self::Lead,
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Chat,
    Email,
    Voice,
    AutomatedDial,
}

impl Channel {
    /// Channels where the lead hears the agent and call recording rules apply.
    pub fn is_voice(&self) -> bool {
        matches!(self, Self::Voice | Self::AutomatedDial)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Chat => "chat",
            Self::Email => "email",
            Self::Voice => "voice",
            Self::AutomatedDial => "automated_dial",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sms" => Some(Self::Sms),
            "chat" => Some(Self::Chat),
            "email" => Some(Self::Email),
            "voice" => Some(Self::Voice),
            "automated_dial" => Some(Self::AutomatedDial),
            _ => None,
        }
    }
}
