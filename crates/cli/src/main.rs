use std::process::ExitCode;

use anyhow::Context;
use leadline_core::config::{AppConfig, LoadOptions, LogFormat, LoggingConfig};
use tracing::Level;

fn main() -> ExitCode {
    // A broken config still gets logs; the command itself reports the config error.
    let logging = match logging_config() {
        Ok(logging) => logging,
        Err(error) => {
            eprintln!("{error:#}; logging with defaults");
            AppConfig::default().logging
        }
    };
    init_logging(&logging);

    leadline_cli::run()
}

fn logging_config() -> anyhow::Result<LoggingConfig> {
    let config =
        AppConfig::load(LoadOptions::default()).context("failed to load logging configuration")?;
    Ok(config.logging)
}

/// Logs go to stderr so command payloads on stdout stay machine-readable.
fn init_logging(config: &LoggingConfig) {
    let level = match config.level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .with_writer(std::io::stderr);
    let _ = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
