use chrono::Utc;
use serde_json::json;

use crate::commands::{build_orchestrator, open_database, prepare, CommandResult};

/// One inactivity sweep. Meant to be scheduled externally (cron or a systemd timer).
pub fn run() -> CommandResult {
    let (config, runtime) = match prepare("archive") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    runtime.block_on(async {
        let pool = match open_database("archive", &config).await {
            Ok(pool) => pool,
            Err(failure) => return failure,
        };
        let orchestrator = build_orchestrator(&config, pool.clone());

        let result = match orchestrator.archive_inactive_sessions(Utc::now()).await {
            Ok(archived) => CommandResult::success_with(
                "archive",
                format!(
                    "archived {archived} sessions idle for more than {}s",
                    config.session.inactivity_archive_secs
                ),
                json!({ "archived": archived }),
            ),
            Err(error) => CommandResult::from_application_error("archive", &error),
        };
        pool.close().await;
        result
    })
}
