pub mod archive;
pub mod config;
pub mod doctor;
pub mod migrate;
pub mod outcome;
pub mod session;
pub mod smoke;
pub mod threshold;

use std::sync::Arc;

use leadline_agent::{KeywordClassifier, Orchestrator, Repositories};
use leadline_core::cache::ResponseCache;
use leadline_core::config::{AppConfig, LoadOptions};
use leadline_core::errors::ApplicationError;
use leadline_db::{connect_with_settings, migrations, DbPool};
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Runtime;

pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_RUNTIME: u8 = 3;
pub const EXIT_DB_CONNECTIVITY: u8 = 4;
pub const EXIT_MIGRATION: u8 = 5;
pub const EXIT_SMOKE: u8 = 6;
pub const EXIT_INVALID_ARGUMENT: u8 = 7;
pub const EXIT_NOT_FOUND: u8 = 8;
pub const EXIT_PERSISTENCE: u8 = 9;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::ok(command, message.into(), None)
    }

    pub fn success_with(command: &str, message: impl Into<String>, details: Value) -> Self {
        Self::ok(command, message.into(), Some(details))
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            details: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    /// Maps a runtime error onto the CLI's exit-code contract.
    pub fn from_application_error(command: &str, error: &ApplicationError) -> Self {
        let exit_code = match error {
            ApplicationError::NotFound(_) => EXIT_NOT_FOUND,
            ApplicationError::Persistence(_) => EXIT_PERSISTENCE,
            ApplicationError::Configuration(_) => EXIT_CONFIG,
            _ => EXIT_INVALID_ARGUMENT,
        };
        let error_class =
            if matches!(error, ApplicationError::NotFound(_)) { "not_found" } else { error.class().as_str() };
        Self::failure(command, error_class, error.to_string(), exit_code)
    }

    fn ok(command: &str, message: String, details: Option<Value>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message,
            details,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }
}

pub(crate) fn load_config(command: &str) -> Result<AppConfig, CommandResult> {
    AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            EXIT_CONFIG,
        )
    })
}

pub(crate) fn build_runtime(command: &str) -> Result<Runtime, CommandResult> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            EXIT_RUNTIME,
        )
    })
}

pub(crate) fn prepare(command: &str) -> Result<(AppConfig, Runtime), CommandResult> {
    let config = load_config(command)?;
    let runtime = build_runtime(command)?;
    Ok((config, runtime))
}

/// Connects and brings the schema up to date.
pub(crate) async fn open_database(
    command: &str,
    config: &AppConfig,
) -> Result<DbPool, CommandResult> {
    let pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(|error| {
        CommandResult::failure(command, "db_connectivity", error.to_string(), EXIT_DB_CONNECTIVITY)
    })?;
    if let Err(error) = migrations::run_pending(&pool).await {
        pool.close().await;
        return Err(CommandResult::failure(command, "migration", error.to_string(), EXIT_MIGRATION));
    }
    Ok(pool)
}

/// Operator commands never draft replies, so the keyword classifier stands in for the model.
/// Must be called inside the runtime.
pub(crate) fn build_orchestrator(config: &AppConfig, pool: DbPool) -> Orchestrator {
    Orchestrator::new(
        config,
        Repositories::sqlite(pool),
        ResponseCache::in_memory(&config.cache),
        Arc::new(KeywordClassifier::new()),
    )
}

pub(crate) fn invalid_argument(command: &str, message: impl Into<String>) -> CommandResult {
    CommandResult::failure(command, "invalid_argument", message, EXIT_INVALID_ARGUMENT)
}

pub(crate) fn to_details<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}
