use serde::{Deserialize, Serialize};

use crate::domain::bot::BotKind;
use crate::domain::cache::CacheTier;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Sell,
    Buy,
    Qualify,
    Unknown,
}

impl Intent {
    pub fn target_bot(&self) -> Option<BotKind> {
        match self {
            Self::Sell => Some(BotKind::Seller),
            Self::Buy => Some(BotKind::Buyer),
            Self::Qualify => Some(BotKind::Lead),
            Self::Unknown => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sell => "sell",
            Self::Buy => "buy",
            Self::Qualify => "qualify",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntentScore {
    pub intent: Intent,
    pub confidence: f64,
}

impl IntentScore {
    pub fn new(intent: Intent, confidence: f64) -> Self {
        Self { intent, confidence: confidence.clamp(0.0, 1.0) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClassificationSource {
    Fresh,
    Cached { tier: CacheTier, similarity: f32 },
}

/// Intent scores as they are stored alongside a cached reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredClassification {
    pub primary: IntentScore,
    pub alternatives: Vec<IntentScore>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandoffCandidate {
    pub target: BotKind,
    pub confidence: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub primary: IntentScore,
    pub alternatives: Vec<IntentScore>,
    pub source: ClassificationSource,
}

impl Classification {
    pub fn fresh(primary: IntentScore, alternatives: Vec<IntentScore>) -> Self {
        Self { primary, alternatives, source: ClassificationSource::Fresh }
    }

    pub fn from_stored(stored: &StoredClassification, source: ClassificationSource) -> Self {
        Self { primary: stored.primary, alternatives: stored.alternatives.clone(), source }
    }

    pub fn to_stored(&self) -> StoredClassification {
        StoredClassification { primary: self.primary, alternatives: self.alternatives.clone() }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self.source, ClassificationSource::Cached { .. })
    }

    /// Maps intent scores onto bot candidates, keeping the best score per bot.
    pub fn candidates(&self) -> Vec<HandoffCandidate> {
        let mut best: Vec<HandoffCandidate> = Vec::new();
        for score in std::iter::once(&self.primary).chain(self.alternatives.iter()) {
            let Some(target) = score.intent.target_bot() else {
                continue;
            };
            match best.iter_mut().find(|candidate| candidate.target == target) {
                Some(existing) if existing.confidence < score.confidence => {
                    existing.confidence = score.confidence;
                }
                Some(_) => {}
                None => best.push(HandoffCandidate { target, confidence: score.confidence }),
            }
        }
        best
    }

    /// Applies a transform to every confidence score, clamping into `[0, 1]`.
    pub fn map_confidence(mut self, adjust: impl Fn(f64) -> f64) -> Self {
        self.primary.confidence = adjust(self.primary.confidence).clamp(0.0, 1.0);
        for score in &mut self.alternatives {
            score.confidence = adjust(score.confidence).clamp(0.0, 1.0);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{Classification, Intent, IntentScore};
    use crate::domain::bot::BotKind;

    #[test]
    fn candidates_keep_highest_score_per_bot_and_skip_unknown() {
        let classification = Classification::fresh(
            IntentScore::new(Intent::Sell, 0.6),
            vec![
                IntentScore::new(Intent::Sell, 0.8),
                IntentScore::new(Intent::Unknown, 0.9),
                IntentScore::new(Intent::Buy, 0.4),
            ],
        );

        let candidates = classification.candidates();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].target, BotKind::Seller);
        assert!((candidates[0].confidence - 0.8).abs() < f64::EPSILON);
        assert_eq!(candidates[1].target, BotKind::Buyer);
    }

    #[test]
    fn confidence_adjustments_are_clamped() {
        let classification = Classification::fresh(IntentScore::new(Intent::Buy, 0.03), vec![])
            .map_confidence(|value| value - 0.05);
        assert_eq!(classification.primary.confidence, 0.0);
    }
}
