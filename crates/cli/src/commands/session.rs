use leadline_core::domain::session::SessionId;

use crate::commands::{
    build_orchestrator, open_database, prepare, to_details, CommandResult, EXIT_NOT_FOUND,
};

pub fn show(session_id: &str) -> CommandResult {
    let (config, runtime) = match prepare("session.show") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    runtime.block_on(async {
        let pool = match open_database("session.show", &config).await {
            Ok(pool) => pool,
            Err(failure) => return failure,
        };
        let orchestrator = build_orchestrator(&config, pool.clone());
        let session_id = SessionId(session_id.to_string());

        let result = match orchestrator.get_session_state(&session_id).await {
            Ok(Some(session)) => {
                let archived = if session.is_archived() { " (archived)" } else { "" };
                CommandResult::success_with(
                    "session.show",
                    format!(
                        "session {} is in state {}{archived} after {} handoffs",
                        session.id,
                        session.state,
                        session.handoff_history.len()
                    ),
                    to_details(&session),
                )
            }
            Ok(None) => CommandResult::failure(
                "session.show",
                "not_found",
                format!("session {session_id} does not exist"),
                EXIT_NOT_FOUND,
            ),
            Err(error) => CommandResult::from_application_error("session.show", &error),
        };
        pool.close().await;
        result
    })
}

pub fn close(session_id: &str) -> CommandResult {
    let (config, runtime) = match prepare("session.close") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    runtime.block_on(async {
        let pool = match open_database("session.close", &config).await {
            Ok(pool) => pool,
            Err(failure) => return failure,
        };
        let orchestrator = build_orchestrator(&config, pool.clone());

        let result = match orchestrator.close_session(&SessionId(session_id.to_string())).await {
            Ok(state) => CommandResult::success(
                "session.close",
                format!("session {session_id} is {state}"),
            ),
            Err(error) => CommandResult::from_application_error("session.close", &error),
        };
        pool.close().await;
        result
    })
}
