//! Offline intent classifier.
//!
//! Scores seller, buyer and qualification intent by keyword hits and drafts a canned reply per
//! intent. Deterministic, so it backs the smoke command and tests where no model is reachable.

use async_trait::async_trait;

use leadline_core::cache::has_volatile_content;
use leadline_core::domain::classification::{Intent, IntentScore};

use crate::llm::{LlmClient, LlmContext, LlmError, LlmReply};

const SELL_PHRASES: &[&str] = &[
    "sell",
    "selling",
    "list my",
    "listing my",
    "home worth",
    "house worth",
    "home value",
    "appraisal",
    "cma",
    "market my",
];

const BUY_PHRASES: &[&str] = &[
    "buy",
    "buying",
    "purchase",
    "looking for a",
    "pre-approved",
    "preapproved",
    "mortgage",
    "bedroom",
    "showing",
    "tour",
    "move in",
];

const QUALIFY_PHRASES: &[&str] =
    &["timeline", "budget", "interested", "more info", "questions", "how does", "agent"];

const BASE_CONFIDENCE: f64 = 0.35;
const PER_HIT: f64 = 0.2;
const MAX_CONFIDENCE: f64 = 0.95;
const UNKNOWN_CONFIDENCE: f64 = 0.3;

#[derive(Clone, Debug, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Primary intent first, then the remaining intents that had at least one hit.
    pub fn score(&self, text: &str) -> Vec<IntentScore> {
        let normalized = normalize_text(text);
        let mut scores: Vec<IntentScore> = [
            (Intent::Sell, SELL_PHRASES),
            (Intent::Buy, BUY_PHRASES),
            (Intent::Qualify, QUALIFY_PHRASES),
        ]
        .into_iter()
        .filter_map(|(intent, phrases)| {
            let hits = count_hits(&normalized, phrases);
            (hits > 0).then(|| {
                IntentScore::new(intent, (BASE_CONFIDENCE + PER_HIT * hits as f64).min(MAX_CONFIDENCE))
            })
        })
        .collect();

        // Stable sort keeps sell, buy, qualify order among equal scores.
        scores.sort_by(|left, right| right.confidence.total_cmp(&left.confidence));
        if scores.is_empty() {
            scores.push(IntentScore::new(Intent::Unknown, UNKNOWN_CONFIDENCE));
        }
        scores
    }
}

#[async_trait]
impl LlmClient for KeywordClassifier {
    async fn classify_and_respond(
        &self,
        text: &str,
        _context: &LlmContext,
    ) -> Result<LlmReply, LlmError> {
        let mut scores = self.score(text).into_iter();
        let intent = scores.next().ok_or_else(|| LlmError::InvalidResponse("no intent".to_string()))?;

        Ok(LlmReply {
            intent,
            alternatives: scores.collect(),
            draft_reply: draft_for(intent.intent).to_string(),
            cacheable: !has_volatile_content(text),
        })
    }
}

fn draft_for(intent: Intent) -> &'static str {
    match intent {
        Intent::Sell => {
            "Thanks for reaching out about selling. What is the property address, and when would you like to list?"
        }
        Intent::Buy => {
            "Happy to help you find a home. What area and price range are you considering?"
        }
        Intent::Qualify => {
            "Glad to help. Are you thinking about buying, selling, or both, and what is your timeline?"
        }
        Intent::Unknown => {
            "Thanks for your message. A member of our team can answer that; is there anything about buying or selling a home I can help with?"
        }
    }
}

fn normalize_text(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len());
    for character in text.chars() {
        if character.is_alphanumeric() || matches!(character, '-' | '\'') {
            normalized.extend(character.to_lowercase());
        } else {
            normalized.push(' ');
        }
    }
    format!(" {} ", normalized.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Counts phrases present as whole words. `normalized` is padded with spaces on both ends.
fn count_hits(normalized: &str, phrases: &[&str]) -> usize {
    phrases.iter().filter(|phrase| normalized.contains(&format!(" {phrase} "))).count()
}
