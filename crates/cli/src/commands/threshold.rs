use leadline_core::domain::bot::{BotKind, ConversationState};
use leadline_core::domain::handoff::HandoffEdge;
use leadline_core::domain::session::TenantId;
use leadline_core::domain::threshold::ThresholdKey;
use serde_json::json;

use crate::commands::{
    build_orchestrator, invalid_argument, open_database, prepare, to_details, CommandResult,
    EXIT_PERSISTENCE,
};

pub fn parse_edge(from: &str, to: &str) -> Result<HandoffEdge, String> {
    let from_state = ConversationState::parse(from)
        .ok_or_else(|| format!("unknown conversation state `{from}`"))?;
    let to_bot = BotKind::parse(to).ok_or_else(|| format!("unknown bot `{to}`"))?;
    Ok(HandoffEdge::new(from_state, to_bot))
}

/// Shows one edge, or every stored edge for the tenant when no edge is given.
pub fn show(tenant: &str, edge: Option<(&str, &str)>) -> CommandResult {
    let edge = match edge.map(|(from, to)| parse_edge(from, to)).transpose() {
        Ok(edge) => edge,
        Err(message) => return invalid_argument("threshold.show", message),
    };
    let (config, runtime) = match prepare("threshold.show") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    runtime.block_on(async {
        let pool = match open_database("threshold.show", &config).await {
            Ok(pool) => pool,
            Err(failure) => return failure,
        };
        let orchestrator = build_orchestrator(&config, pool.clone());
        let registry = orchestrator.thresholds();
        let tenant_id = TenantId(tenant.to_string());

        let result = match edge {
            Some(edge) => match registry.current(&ThresholdKey::new(tenant_id, edge)).await {
                Ok(threshold) => CommandResult::success_with(
                    "threshold.show",
                    format!(
                        "{edge} = {:.3} after {} outcomes (version {})",
                        threshold.current_value, threshold.sample_count, threshold.version
                    ),
                    to_details(&threshold),
                ),
                Err(error) => persistence_failure("threshold.show", error),
            },
            None => match registry.list(&tenant_id).await {
                Ok(thresholds) => CommandResult::success_with(
                    "threshold.show",
                    format!(
                        "{} learned edges for tenant {tenant_id}; others use the default {:.3}",
                        thresholds.len(),
                        registry.default_value()
                    ),
                    json!({ "thresholds": to_details(&thresholds) }),
                ),
                Err(error) => persistence_failure("threshold.show", error),
            },
        };
        pool.close().await;
        result
    })
}

pub fn set(tenant: &str, from: &str, to: &str, value: f64) -> CommandResult {
    let edge = match parse_edge(from, to) {
        Ok(edge) => edge,
        Err(message) => return invalid_argument("threshold.set", message),
    };
    let (config, runtime) = match prepare("threshold.set") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    runtime.block_on(async {
        let pool = match open_database("threshold.set", &config).await {
            Ok(pool) => pool,
            Err(failure) => return failure,
        };
        let orchestrator = build_orchestrator(&config, pool.clone());

        let result = match orchestrator
            .admin_override_threshold(&TenantId(tenant.to_string()), edge, value)
            .await
        {
            Ok(threshold) => CommandResult::success_with(
                "threshold.set",
                format!("{edge} set to {:.3} (version {})", threshold.current_value, threshold.version),
                to_details(&threshold),
            ),
            Err(error) => CommandResult::from_application_error("threshold.set", &error),
        };
        pool.close().await;
        result
    })
}

fn persistence_failure(command: &str, error: impl std::fmt::Display) -> CommandResult {
    CommandResult::failure(command, "persistence_write_failure", error.to_string(), EXIT_PERSISTENCE)
}

#[cfg(test)]
mod tests {
    use leadline_core::domain::bot::{BotKind, ConversationState};

    use super::parse_edge;

    #[test]
    fn edges_parse_case_insensitively() {
        let edge = parse_edge("Unassigned", "SELLER").expect("edge");
        assert_eq!(edge.from, ConversationState::Unassigned);
        assert_eq!(edge.to, BotKind::Seller);

        assert!(parse_edge("nowhere", "seller").is_err());
        assert!(parse_edge("seller", "human_escalation").is_err());
    }
}
