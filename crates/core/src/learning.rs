//! Outcome-driven threshold adjustment.
//!
//! Each `(tenant, edge)` threshold collects decisive outcomes into a window. Once the window
//! holds `min_samples` outcomes the threshold moves toward the target success rate by at most
//! `max_step`, stays within `[floor, ceiling]`, and the window starts over.

use chrono::{DateTime, Utc};

use crate::config::LearningConfig;
use crate::domain::handoff::HandoffOutcome;
use crate::domain::threshold::ConfidenceThreshold;
use crate::errors::DomainError;

const STEP_TOLERANCE: f64 = 1e-9;

#[derive(Clone, Debug, PartialEq)]
pub enum LearningStep {
    /// Nothing to record (pending outcome).
    Ignored,
    /// Counted; the threshold value did not change.
    Recorded(ConfidenceThreshold),
    Adjusted { threshold: ConfidenceThreshold, previous_value: f64, observed_rate: f64 },
}

impl LearningStep {
    pub fn threshold(&self) -> Option<&ConfidenceThreshold> {
        match self {
            Self::Ignored => None,
            Self::Recorded(threshold) | Self::Adjusted { threshold, .. } => Some(threshold),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ThresholdLearner {
    config: LearningConfig,
}

impl ThresholdLearner {
    pub fn new(config: LearningConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    /// Folds one outcome into `current`, returning the next version of the record.
    pub fn apply_outcome(
        &self,
        current: &ConfidenceThreshold,
        threshold_used: f64,
        outcome: HandoffOutcome,
        now: DateTime<Utc>,
    ) -> LearningStep {
        let success = match outcome {
            HandoffOutcome::Pending => return LearningStep::Ignored,
            HandoffOutcome::Success => true,
            HandoffOutcome::Failure => false,
        };

        let mut next = current.clone();
        next.sample_count = next.sample_count.saturating_add(1);
        next.success_count = next.success_count.saturating_add(u64::from(success));
        next.version = next.version.saturating_add(1);
        next.last_updated_at = now;

        let stale = (threshold_used - current.current_value).abs() > self.config.max_step + STEP_TOLERANCE;
        if stale {
            return LearningStep::Recorded(next);
        }

        next.window_samples = next.window_samples.saturating_add(1);
        next.window_successes = next.window_successes.saturating_add(u32::from(success));
        if next.window_samples < self.config.min_samples {
            return LearningStep::Recorded(next);
        }

        let observed_rate = f64::from(next.window_successes) / f64::from(next.window_samples);
        let delta = ((self.config.target_success_rate - observed_rate) * self.config.adjustment_gain)
            .clamp(-self.config.max_step, self.config.max_step);
        let previous_value = next.current_value;
        // An override can leave the value outside the band; it walks back one step at a time.
        let max_step = self.config.max_step;
        next.current_value = (previous_value + delta)
            .clamp(self.config.floor, self.config.ceiling)
            .clamp(previous_value - max_step, previous_value + max_step)
            .clamp(0.0, 1.0);
        next.window_samples = 0;
        next.window_successes = 0;

        LearningStep::Adjusted { threshold: next, previous_value, observed_rate }
    }

    /// Operator-set value. Bypasses floor and ceiling but must stay within `[0, 1]`; the
    /// adjustment window restarts from the new value.
    pub fn override_value(
        &self,
        current: &ConfidenceThreshold,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<ConfidenceThreshold, DomainError> {
        if !(0.0..=1.0).contains(&value) || value.is_nan() {
            return Err(DomainError::ThresholdOutOfRange { value });
        }

        let mut next = current.clone();
        next.current_value = value;
        next.window_samples = 0;
        next.window_successes = 0;
        next.version = next.version.saturating_add(1);
        next.last_updated_at = now;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{LearningStep, ThresholdLearner};
    use crate::config::AppConfig;
    use crate::domain::bot::{BotKind, ConversationState};
    use crate::domain::handoff::{HandoffEdge, HandoffOutcome};
    use crate::domain::session::TenantId;
    use crate::domain::threshold::{ConfidenceThreshold, ThresholdKey};
    use crate::errors::DomainError;

    fn learner() -> ThresholdLearner {
        ThresholdLearner::new(AppConfig::default().learning)
    }

    fn seller_to_buyer(value: f64) -> ConfidenceThreshold {
        ConfidenceThreshold::cold_start(
            ThresholdKey::new(
                TenantId("acme".to_owned()),
                HandoffEdge::new(ConversationState::Seller, BotKind::Buyer),
            ),
            value,
            Utc::now(),
        )
    }

    fn feed(
        learner: &ThresholdLearner,
        mut threshold: ConfidenceThreshold,
        successes: usize,
        failures: usize,
    ) -> (ConfidenceThreshold, Vec<LearningStep>) {
        let outcomes = std::iter::repeat(HandoffOutcome::Success)
            .take(successes)
            .chain(std::iter::repeat(HandoffOutcome::Failure).take(failures));
        let mut steps = Vec::new();
        for outcome in outcomes {
            let used = threshold.current_value;
            let step = learner.apply_outcome(&threshold, used, outcome, Utc::now());
            threshold = step.threshold().cloned().expect("decisive outcome is recorded");
            steps.push(step);
        }
        (threshold, steps)
    }

    #[test]
    fn fourteen_of_fifteen_successes_lowers_threshold_by_one_step() {
        let learner = learner();
        let (threshold, steps) = feed(&learner, seller_to_buyer(0.70), 14, 1);

        assert!((threshold.current_value - 0.65).abs() < 1e-9);
        assert_eq!(threshold.sample_count, 15);
        assert_eq!(threshold.window_samples, 0);
        assert_eq!(
            steps.iter().filter(|step| matches!(step, LearningStep::Adjusted { .. })).count(),
            1
        );
        assert!(matches!(steps.last(), Some(LearningStep::Adjusted { .. })));
    }

    #[test]
    fn cold_start_keeps_default_until_batch_is_full() {
        let learner = learner();
        let (threshold, _) = feed(&learner, seller_to_buyer(0.70), 0, 14);

        assert_eq!(threshold.current_value, 0.70);
        assert_eq!(threshold.window_samples, 14);
    }

    #[test]
    fn poor_outcomes_raise_threshold_within_step_and_ceiling() {
        let learner = learner();
        let (threshold, steps) = feed(&learner, seller_to_buyer(0.93), 0, 15);

        assert!((threshold.current_value - 0.95).abs() < 1e-9);
        for step in steps {
            if let LearningStep::Adjusted { threshold, previous_value, .. } = step {
                assert!((threshold.current_value - previous_value).abs() <= 0.05 + 1e-9);
            }
        }
    }

    #[test]
    fn floor_bounds_repeated_lowering() {
        let learner = learner();
        let mut threshold = seller_to_buyer(0.55);
        for _ in 0..3 {
            threshold = feed(&learner, threshold, 15, 0).0;
        }
        assert!((threshold.current_value - 0.50).abs() < 1e-9);
    }

    #[test]
    fn pending_and_stale_outcomes_do_not_move_the_window() {
        let learner = learner();
        let threshold = seller_to_buyer(0.70);

        assert_eq!(
            learner.apply_outcome(&threshold, 0.70, HandoffOutcome::Pending, Utc::now()),
            LearningStep::Ignored
        );

        let LearningStep::Recorded(next) =
            learner.apply_outcome(&threshold, 0.85, HandoffOutcome::Failure, Utc::now())
        else {
            panic!("stale outcome should only be recorded");
        };
        assert_eq!(next.sample_count, 1);
        assert_eq!(next.window_samples, 0);
        assert_eq!(next.version, threshold.version + 1);
    }

    #[test]
    fn overridden_value_below_floor_returns_one_step_per_batch() {
        let learner = learner();
        let overridden =
            learner.override_value(&seller_to_buyer(0.70), 0.20, Utc::now()).expect("in range");

        let (threshold, steps) = feed(&learner, overridden, 0, 15);
        assert!((threshold.current_value - 0.25).abs() < 1e-9, "got {}", threshold.current_value);
        for step in steps {
            if let LearningStep::Adjusted { threshold, previous_value, .. } = step {
                assert!((threshold.current_value - previous_value).abs() <= 0.05 + 1e-9);
            }
        }

        let (above, _) = feed(
            &learner,
            learner.override_value(&seller_to_buyer(0.70), 1.0, Utc::now()).expect("in range"),
            15,
            0,
        );
        assert!((above.current_value - 0.95).abs() < 1e-9, "got {}", above.current_value);
    }

    #[test]
    fn override_validates_range_and_resets_window() {
        let learner = learner();
        let (threshold, _) = feed(&learner, seller_to_buyer(0.70), 5, 0);

        let overridden = learner.override_value(&threshold, 0.99, Utc::now()).expect("in range");
        assert_eq!(overridden.current_value, 0.99);
        assert_eq!(overridden.window_samples, 0);
        assert_eq!(overridden.sample_count, 5);

        assert_eq!(
            learner.override_value(&threshold, 1.2, Utc::now()),
            Err(DomainError::ThresholdOutOfRange { value: 1.2 })
        );
    }
}
