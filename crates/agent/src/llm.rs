use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use leadline_core::config::LlmConfig;
use leadline_core::domain::bot::{BotKind, Channel, ConversationState};
use leadline_core::domain::classification::IntentScore;
use leadline_core::domain::session::{SessionId, TenantId};

/// What the model is told about the conversation besides the message text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LlmContext {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub channel: Channel,
    pub state: ConversationState,
    pub active_bot: Option<BotKind>,
    pub correlation_id: String,
    /// Configured `llm.model`; clients address this model.
    pub model: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LlmReply {
    pub intent: IntentScore,
    pub alternatives: Vec<IntentScore>,
    pub draft_reply: String,
    /// The model's own judgement that the reply does not depend on who asked or when.
    pub cacheable: bool,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("llm unavailable: {0}")]
    Unavailable(String),
    #[error("llm call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("llm returned an invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn classify_and_respond(
        &self,
        text: &str,
        context: &LlmContext,
    ) -> Result<LlmReply, LlmError>;
}

/// Wraps a client with a per-attempt timeout and bounded retries. Only `Unavailable` is
/// retried; a timeout or malformed reply ends the call.
#[derive(Clone)]
pub struct GuardedLlm {
    client: Arc<dyn LlmClient>,
    model: String,
    timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

impl GuardedLlm {
    pub fn new(client: Arc<dyn LlmClient>, config: &LlmConfig) -> Self {
        Self {
            client,
            model: config.model.clone(),
            timeout: Duration::from_millis(config.timeout_ms.max(1)),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn call(&self, text: &str, context: &LlmContext) -> Result<LlmReply, LlmError> {
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result =
                match tokio::time::timeout(self.timeout, self.client.classify_and_respond(text, context))
                    .await
                {
                    Ok(result) => result.and_then(validate_reply),
                    Err(_) => Err(LlmError::Timeout { timeout_ms }),
                };

            match result {
                Err(LlmError::Unavailable(reason)) if attempt <= self.max_retries => {
                    debug!(
                        event_name = "llm.retry",
                        correlation_id = %context.correlation_id,
                        attempt,
                        reason = %reason,
                        "llm unavailable; retrying"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(error) => {
                    warn!(
                        event_name = "llm.failed",
                        correlation_id = %context.correlation_id,
                        model = %context.model,
                        session_id = %context.session_id,
                        attempts = attempt,
                        error = %error,
                        "llm call failed"
                    );
                    return Err(error);
                }
                Ok(reply) => return Ok(reply),
            }
        }
    }
}

fn validate_reply(reply: LlmReply) -> Result<LlmReply, LlmError> {
    if reply.draft_reply.trim().is_empty() {
        return Err(LlmError::InvalidResponse("empty draft reply".to_string()));
    }
    let scores = std::iter::once(&reply.intent).chain(reply.alternatives.iter());
    for score in scores {
        if !(0.0..=1.0).contains(&score.confidence) {
            return Err(LlmError::InvalidResponse(format!(
                "confidence {} outside 0..=1",
                score.confidence
            )));
        }
    }
    Ok(reply)
}
