use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use leadline_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

struct Field {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

impl Field {
    fn new(key: &'static str, value: impl ToString, env_keys: &'static [&'static str]) -> Self {
        Self { key, value: value.to_string(), env_keys }
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source = field_source(
            field.key,
            field.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key, &field.value, source));
    }

    let tenants: Vec<&str> = config.tenants.keys().map(String::as_str).collect();
    if !tenants.is_empty() {
        lines.push(format!("- tenants = {} (source: file)", tenants.join(", ")));
    }

    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let llm_api_key = config
        .llm
        .api_key
        .as_ref()
        .map(|key| redact_secret(key.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());

    vec![
        Field::new("database.url", &config.database.url, &["LEADLINE_DATABASE_URL"]),
        Field::new(
            "database.max_connections",
            config.database.max_connections,
            &["LEADLINE_DATABASE_MAX_CONNECTIONS"],
        ),
        Field::new(
            "database.timeout_secs",
            config.database.timeout_secs,
            &["LEADLINE_DATABASE_TIMEOUT_SECS"],
        ),
        Field::new("llm.model", &config.llm.model, &["LEADLINE_LLM_MODEL"]),
        Field::new("llm.api_key", llm_api_key, &["LEADLINE_LLM_API_KEY"]),
        Field::new(
            "llm.base_url",
            config.llm.base_url.as_deref().unwrap_or("<unset>"),
            &["LEADLINE_LLM_BASE_URL"],
        ),
        Field::new("llm.timeout_ms", config.llm.timeout_ms, &["LEADLINE_LLM_TIMEOUT_MS"]),
        Field::new("llm.max_retries", config.llm.max_retries, &["LEADLINE_LLM_MAX_RETRIES"]),
        Field::new("cache.enabled", config.cache.enabled, &["LEADLINE_CACHE_ENABLED"]),
        Field::new("cache.l1_ttl_secs", config.cache.l1_ttl_secs, &["LEADLINE_CACHE_L1_TTL_SECS"]),
        Field::new("cache.l2_ttl_secs", config.cache.l2_ttl_secs, &["LEADLINE_CACHE_L2_TTL_SECS"]),
        Field::new("cache.l3_ttl_secs", config.cache.l3_ttl_secs, &["LEADLINE_CACHE_L3_TTL_SECS"]),
        Field::new(
            "cache.similarity_threshold",
            config.cache.similarity_threshold,
            &["LEADLINE_CACHE_SIMILARITY_THRESHOLD"],
        ),
        Field::new(
            "cache.relaxed_similarity_threshold",
            config.cache.relaxed_similarity_threshold,
            &["LEADLINE_CACHE_RELAXED_SIMILARITY_THRESHOLD"],
        ),
        Field::new(
            "handoff.default_threshold",
            config.handoff.default_threshold,
            &["LEADLINE_HANDOFF_DEFAULT_THRESHOLD"],
        ),
        Field::new(
            "handoff.max_handoffs_per_window",
            config.handoff.max_handoffs_per_window,
            &["LEADLINE_HANDOFF_MAX_HANDOFFS_PER_WINDOW"],
        ),
        Field::new(
            "handoff.loop_window_secs",
            config.handoff.loop_window_secs,
            &["LEADLINE_HANDOFF_LOOP_WINDOW_SECS"],
        ),
        Field::new(
            "learning.min_samples",
            config.learning.min_samples,
            &["LEADLINE_LEARNING_MIN_SAMPLES"],
        ),
        Field::new("learning.max_step", config.learning.max_step, &["LEADLINE_LEARNING_MAX_STEP"]),
        Field::new(
            "learning.target_success_rate",
            config.learning.target_success_rate,
            &["LEADLINE_LEARNING_TARGET_SUCCESS_RATE"],
        ),
        Field::new(
            "session.inactivity_archive_secs",
            config.session.inactivity_archive_secs,
            &["LEADLINE_SESSION_INACTIVITY_ARCHIVE_SECS"],
        ),
        Field::new(
            "logging.level",
            &config.logging.level,
            &["LEADLINE_LOGGING_LEVEL", "LEADLINE_LOG_LEVEL"],
        ),
        Field::new(
            "logging.format",
            format!("{:?}", config.logging.format),
            &["LEADLINE_LOGGING_FORMAT", "LEADLINE_LOG_FORMAT"],
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("leadline.toml"), PathBuf::from("config/leadline.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps a short prefix such as `sk-` so operators can tell keys apart.
fn redact_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
