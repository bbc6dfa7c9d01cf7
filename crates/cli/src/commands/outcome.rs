use leadline_core::domain::handoff::{HandoffEventId, HandoffOutcome};
use leadline_core::learning::LearningStep;

use crate::commands::{build_orchestrator, invalid_argument, open_database, prepare, CommandResult};

/// Records how a handoff turned out and reports whether the edge's threshold moved.
pub fn record(event_id: &str, outcome: &str) -> CommandResult {
    let outcome = match HandoffOutcome::parse(outcome) {
        Some(outcome) if outcome.is_decisive() => outcome,
        _ => {
            return invalid_argument(
                "outcome.record",
                format!("outcome must be `success` or `failure`, got `{outcome}`"),
            )
        }
    };
    let (config, runtime) = match prepare("outcome.record") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    runtime.block_on(async {
        let pool = match open_database("outcome.record", &config).await {
            Ok(pool) => pool,
            Err(failure) => return failure,
        };
        let orchestrator = build_orchestrator(&config, pool.clone());

        let result = match orchestrator
            .record_handoff_outcome(&HandoffEventId(event_id.to_string()), outcome)
            .await
        {
            Ok(LearningStep::Adjusted { threshold, previous_value, .. }) => CommandResult::success(
                "outcome.record",
                format!(
                    "recorded {} for {event_id}; threshold moved {previous_value:.3} -> {:.3}",
                    outcome.as_str(),
                    threshold.current_value
                ),
            ),
            Ok(_) => CommandResult::success(
                "outcome.record",
                format!("recorded {} for {event_id}", outcome.as_str()),
            ),
            Err(error) => CommandResult::from_application_error("outcome.record", &error),
        };
        pool.close().await;
        result
    })
}
