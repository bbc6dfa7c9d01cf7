pub mod audit;
pub mod cache;
pub mod compliance;
pub mod config;
pub mod domain;
pub mod errors;
pub mod handoff;
pub mod learning;
pub mod policy;

pub use cache::{CacheHit, CacheLookup, CachePolicy, CacheScope, CacheStats, ResponseCache};
pub use compliance::{ComplianceDecision, ComplianceGuard, RuleSet};
pub use domain::bot::{BotKind, Channel, ConversationState};
pub use domain::classification::{Classification, Intent, IntentScore};
pub use domain::compliance::{ComplianceViolation, OptOutRecord, Severity, ViolationType};
pub use domain::handoff::{HandoffEdge, HandoffEvent, HandoffEventId, HandoffOutcome};
pub use domain::session::{ContactId, ConversationSession, SessionId, TenantId};
pub use domain::threshold::{ConfidenceThreshold, ThresholdKey};
pub use errors::{ApplicationError, DomainError, ErrorClass, InterfaceError};
pub use handoff::{HandoffDecision, HandoffStateMachine, ThresholdSnapshot, ThresholdSource, Transition};
pub use learning::{LearningStep, ThresholdLearner};
pub use policy::{TenantPolicies, TenantPolicy};
