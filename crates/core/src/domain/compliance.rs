use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::session::{ContactId, SessionId, TenantId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    BotDisclosureMissing,
    OptOutIgnored,
    FairHousingRisk,
    RecordingConsentMissing,
    Other,
}

impl ViolationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BotDisclosureMissing => "bot_disclosure_missing",
            Self::OptOutIgnored => "opt_out_ignored",
            Self::FairHousingRisk => "fair_housing_risk",
            Self::RecordingConsentMissing => "recording_consent_missing",
            Self::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bot_disclosure_missing" => Some(Self::BotDisclosureMissing),
            "opt_out_ignored" => Some(Self::OptOutIgnored),
            "fair_housing_risk" => Some(Self::FairHousingRisk),
            "recording_consent_missing" => Some(Self::RecordingConsentMissing),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Self::Info),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceAction {
    /// Required text was added and the message went out.
    Injected,
    /// The message was never delivered.
    Blocked,
}

impl ComplianceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Injected => "injected",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "injected" => Some(Self::Injected),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViolationId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceViolation {
    pub id: ViolationId,
    pub session_id: SessionId,
    pub tenant_id: TenantId,
    pub violation_type: ViolationType,
    pub severity: Severity,
    pub action: ComplianceAction,
    pub rule: String,
    pub evidence: String,
    pub remediation: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Contact-level opt-out. Outlives any single session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptOutRecord {
    pub tenant_id: TenantId,
    pub contact_id: ContactId,
    pub keyword: String,
    pub recorded_at: DateTime<Utc>,
}
