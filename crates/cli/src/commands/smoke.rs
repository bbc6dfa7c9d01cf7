use std::sync::Arc;
use std::time::Instant;

use crate::commands::{CommandResult, EXIT_SMOKE};
use leadline_agent::{
    InboundMessage, KeywordClassifier, Orchestrator, OutboundResult, ReplySource, Repositories,
    SuppressReason,
};
use leadline_core::cache::ResponseCache;
use leadline_core::config::{AppConfig, LoadOptions};
use leadline_core::domain::bot::Channel;
use leadline_core::domain::session::{ContactId, SessionId, TenantId};
use leadline_db::{connect_with_settings, migrations};
use serde::Serialize;

const SMOKE_TENANT: &str = "smoke";
const SMOKE_CONTACT: &str = "smoke-contact";
const SMOKE_QUESTION: &str = "What's your return policy?";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum SmokeStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: SmokeStatus,
    elapsed_ms: u64,
    message: String,
}

impl SmokeCheck {
    fn from_result(name: &'static str, started: Instant, result: Result<String, String>) -> Self {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(message) => Self { name, status: SmokeStatus::Pass, elapsed_ms, message },
            Err(message) => Self { name, status: SmokeStatus::Fail, elapsed_ms, message },
        }
    }
}

#[derive(Debug, Serialize)]
struct SmokeReport {
    command: &'static str,
    status: SmokeStatus,
    summary: String,
    total_elapsed_ms: u64,
    checks: Vec<SmokeCheck>,
}

pub fn run() -> CommandResult {
    let started = Instant::now();
    let mut checks = Vec::new();

    let config = match timed_check(|| AppConfig::load(LoadOptions::default())) {
        Ok((elapsed_ms, config)) => {
            checks.push(SmokeCheck {
                name: "config_validation",
                status: SmokeStatus::Pass,
                elapsed_ms,
                message: "configuration loaded and validated".to_string(),
            });
            config
        }
        Err((elapsed_ms, error)) => {
            checks.push(SmokeCheck {
                name: "config_validation",
                status: SmokeStatus::Fail,
                elapsed_ms,
                message: error.to_string(),
            });
            checks.push(skipped("db_connectivity"));
            checks.push(skipped("migration_visibility"));
            checks.push(skipped("conversation_pipeline"));
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            checks.push(SmokeCheck {
                name: "db_connectivity",
                status: SmokeStatus::Fail,
                elapsed_ms: 0,
                message: format!("failed to initialize async runtime: {error}"),
            });
            checks.push(skipped("migration_visibility"));
            checks.push(skipped("conversation_pipeline"));
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    let db_started = Instant::now();
    let db_result = runtime.block_on(async {
        connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
    });

    match db_result {
        Ok(pool) => {
            checks.push(SmokeCheck {
                name: "db_connectivity",
                status: SmokeStatus::Pass,
                elapsed_ms: db_started.elapsed().as_millis() as u64,
                message: format!("connected using `{}`", config.database.url),
            });

            let migration_started = Instant::now();
            let migration_result = runtime.block_on(async {
                let result = migrations::run_pending(&pool).await;
                pool.close().await;
                result
            });
            checks.push(SmokeCheck::from_result(
                "migration_visibility",
                migration_started,
                migration_result
                    .map(|()| "migrations are visible and executable".to_string())
                    .map_err(|error| format!("migration execution failed: {error}")),
            ));
        }
        Err(error) => {
            checks.push(SmokeCheck {
                name: "db_connectivity",
                status: SmokeStatus::Fail,
                elapsed_ms: db_started.elapsed().as_millis() as u64,
                message: format!("failed to connect: {error}"),
            });
            checks.push(skipped("migration_visibility"));
        }
    }

    let pipeline_started = Instant::now();
    let pipeline_result = runtime.block_on(exercise_pipeline(&config));
    checks.push(SmokeCheck::from_result("conversation_pipeline", pipeline_started, pipeline_result));

    finalize_report(checks, started.elapsed().as_millis() as u64)
}

/// Scripted exchange against in-memory storage. The repeat question must come from cache once
/// the first answer is written; the opt-out must never reach the model.
async fn exercise_pipeline(config: &AppConfig) -> Result<String, String> {
    let orchestrator = Orchestrator::new(
        config,
        Repositories::in_memory(),
        ResponseCache::in_memory(&config.cache),
        Arc::new(KeywordClassifier::new()),
    );

    let first = send(&orchestrator, "smoke-1", SMOKE_QUESTION).await?;
    if !matches!(first, OutboundResult::Delivered { source: ReplySource::Llm, .. }) {
        return Err(format!("first reply should come from the model, got {}", first.label()));
    }
    orchestrator.flush_cache_writes().await;

    let second = send(&orchestrator, "smoke-2", SMOKE_QUESTION).await?;
    let reused = matches!(second, OutboundResult::Delivered { source: ReplySource::Cache(_), .. });
    if config.cache.enabled && !reused {
        return Err(format!("repeat question should be served from cache, got {}", second.label()));
    }

    let opt_out = send(&orchestrator, "smoke-3", "STOP").await?;
    if !matches!(opt_out, OutboundResult::Suppressed { reason: SuppressReason::OptedOut { .. }, .. }) {
        return Err(format!("opt-out keyword should suppress replies, got {}", opt_out.label()));
    }

    Ok(format!(
        "model reply, {} repeat, opt-out honoured",
        if reused { "cached" } else { "uncached" }
    ))
}

async fn send(
    orchestrator: &Orchestrator,
    session: &str,
    text: &str,
) -> Result<OutboundResult, String> {
    let message = InboundMessage::new(
        SessionId(session.to_string()),
        TenantId(SMOKE_TENANT.to_string()),
        ContactId(SMOKE_CONTACT.to_string()),
        Channel::Chat,
        text,
    );
    orchestrator.handle_inbound(message).await.map_err(|error| error.to_string())
}

fn timed_check<T, E>(check: impl FnOnce() -> Result<T, E>) -> Result<(u64, T), (u64, E)> {
    let started = Instant::now();
    match check() {
        Ok(value) => Ok((started.elapsed().as_millis() as u64, value)),
        Err(error) => Err((started.elapsed().as_millis() as u64, error)),
    }
}

fn skipped(name: &'static str) -> SmokeCheck {
    SmokeCheck {
        name,
        status: SmokeStatus::Skipped,
        elapsed_ms: 0,
        message: "skipped due previous failure".to_string(),
    }
}

fn finalize_report(checks: Vec<SmokeCheck>, total_elapsed_ms: u64) -> CommandResult {
    let passed = checks.iter().filter(|check| check.status == SmokeStatus::Pass).count();
    let total = checks.len();
    let failed = checks.iter().any(|check| check.status == SmokeStatus::Fail);

    let report = SmokeReport {
        command: "smoke",
        status: if failed { SmokeStatus::Fail } else { SmokeStatus::Pass },
        summary: format!("smoke: {passed}/{total} checks passed in {total_elapsed_ms}ms"),
        total_elapsed_ms,
        checks,
    };

    let human = report.summary.clone();
    let machine = serde_json::to_string(&report).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"smoke\",\"status\":\"fail\",\"summary\":\"serialization failed\",\"error\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    });

    CommandResult {
        exit_code: if failed { EXIT_SMOKE } else { 0 },
        output: format!("{human}\n{machine}"),
    }
}
