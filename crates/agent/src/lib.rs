//! Conversation runtime for the lead bots.
//!
//! The [`orchestrator`] drives one inbound message through cache, model, handoff routing and
//! compliance, serialized per session by [`lanes`]. Model access goes through [`llm`] with a
//! timeout and bounded retries; learned thresholds live behind [`thresholds`].
//!
//! The model classifies and drafts. Routing, thresholds and what may be sent are decided by
//! deterministic code in `leadline-core`.

pub mod classifier;
pub mod lanes;
pub mod llm;
pub mod orchestrator;
pub mod persistence;
pub mod signals;
pub mod thresholds;

pub use classifier::KeywordClassifier;
pub use llm::{GuardedLlm, LlmClient, LlmContext, LlmError, LlmReply};
pub use orchestrator::{
    InboundMessage, Orchestrator, OutboundResult, ReplySource, Repositories, SuppressReason,
};
pub use signals::{LeadSignalProvider, NoLeadSignals, StaticLeadSignals};
pub use thresholds::{ThresholdError, ThresholdRegistry};
