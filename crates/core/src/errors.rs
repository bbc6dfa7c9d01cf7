use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::bot::ConversationState;
use crate::domain::compliance::ViolationType;

/// Stable failure labels carried into audit metadata and CLI output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    CacheUnavailable,
    LlmUnavailable,
    LlmTimeout,
    ComplianceBlocked,
    HandoffLoopLimitExceeded,
    PersistenceWriteFailure,
    Configuration,
    Domain,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheUnavailable => "cache_unavailable",
            Self::LlmUnavailable => "llm_unavailable",
            Self::LlmTimeout => "llm_timeout",
            Self::ComplianceBlocked => "compliance_blocked",
            Self::HandoffLoopLimitExceeded => "handoff_loop_limit_exceeded",
            Self::PersistenceWriteFailure => "persistence_write_failure",
            Self::Configuration => "configuration",
            Self::Domain => "domain",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum DomainError {
    #[error("invalid handoff from {from} to {to}")]
    InvalidHandoff { from: ConversationState, to: ConversationState },
    #[error("session is in terminal state {0}")]
    SessionTerminal(ConversationState),
    #[error("confidence threshold {value} is outside 0.0..=1.0")]
    ThresholdOutOfRange { value: f64 },
    #[error("handoff outcome was already recorded for event `{0}`")]
    OutcomeAlreadyRecorded(String),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),
    #[error("llm unavailable: {0}")]
    LlmUnavailable(String),
    #[error("llm call timed out after {timeout_ms}ms")]
    LlmTimeout { timeout_ms: u64 },
    #[error("outbound message blocked by compliance rule ({})", .violation_type.as_str())]
    ComplianceBlocked { violation_type: ViolationType },
    #[error("handoff loop limit exceeded: {handoffs} handoffs within {window_secs}s")]
    HandoffLoopLimitExceeded { handoffs: usize, window_secs: u64 },
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Domain(_) | Self::NotFound(_) => ErrorClass::Domain,
            Self::CacheUnavailable(_) => ErrorClass::CacheUnavailable,
            Self::LlmUnavailable(_) => ErrorClass::LlmUnavailable,
            Self::LlmTimeout { .. } => ErrorClass::LlmTimeout,
            Self::ComplianceBlocked { .. } => ErrorClass::ComplianceBlocked,
            Self::HandoffLoopLimitExceeded { .. } => ErrorClass::HandoffLoopLimitExceeded,
            Self::Persistence(_) => ErrorClass::PersistenceWriteFailure,
            Self::Configuration(_) => ErrorClass::Configuration,
        }
    }

    /// Infrastructure failures that degrade a conversation instead of failing it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CacheUnavailable(_)
                | Self::LlmUnavailable(_)
                | Self::LlmTimeout { .. }
                | Self::Persistence(_)
        )
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The requested record does not exist.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Domain(error) => {
                Self::BadRequest { message: error.to_string(), correlation_id }
            }
            ApplicationError::ComplianceBlocked { .. }
            | ApplicationError::HandoffLoopLimitExceeded { .. } => {
                Self::BadRequest { message: value.to_string(), correlation_id }
            }
            ApplicationError::NotFound(message) => Self::NotFound { message, correlation_id },
            ApplicationError::CacheUnavailable(message)
            | ApplicationError::LlmUnavailable(message)
            | ApplicationError::Persistence(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::LlmTimeout { .. } => {
                Self::ServiceUnavailable { message: value.to_string(), correlation_id }
            }
            ApplicationError::Configuration(message) => Self::Internal { message, correlation_id },
        }
    }
}
