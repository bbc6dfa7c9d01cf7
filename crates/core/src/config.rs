use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub cache: CacheConfig,
    pub handoff: HandoffConfig,
    pub learning: LearningConfig,
    pub compliance: ComplianceConfig,
    pub session: SessionConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
    pub tenants: BTreeMap<String, TenantOverrides>,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Connection details handed to the external classification client.
#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub model: String,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    pub enabled: bool,
    pub l1_ttl_secs: u64,
    pub l2_ttl_secs: u64,
    pub l3_ttl_secs: u64,
    pub l1_max_entries: u64,
    pub l2_max_entries: u64,
    pub l3_window_size: usize,
    pub similarity_threshold: f32,
    pub relaxed_similarity_threshold: f32,
    pub embedding_dimensions: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HandoffConfig {
    pub default_threshold: f64,
    pub max_handoffs_per_window: usize,
    pub loop_window_secs: u64,
    pub cached_confidence_penalty: f64,
    pub lead_signal_weight: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LearningConfig {
    pub min_samples: u32,
    pub max_step: f64,
    pub target_success_rate: f64,
    pub adjustment_gain: f64,
    pub floor: f64,
    pub ceiling: f64,
    pub cas_max_attempts: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComplianceConfig {
    pub ai_disclosure_text: String,
    pub recording_notice_text: String,
    pub fair_housing_patterns: Vec<String>,
    pub promotional_markers: Vec<String>,
    pub opt_out_keywords: Vec<String>,
    pub opt_out_confirmation: String,
    pub hold_message: String,
    pub escalation_message: String,
    pub sms_max_chars: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub inactivity_archive_secs: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PersistenceConfig {
    pub max_write_attempts: u32,
    pub write_backoff_ms: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Per-tenant policy adjustments layered over the global defaults.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TenantOverrides {
    pub l1_ttl_secs: Option<u64>,
    pub l2_ttl_secs: Option<u64>,
    pub l3_ttl_secs: Option<u64>,
    pub similarity_threshold: Option<f32>,
    pub ai_disclosure_text: Option<String>,
    pub blocked_phrases: Vec<String>,
    /// Checked in addition to `compliance.fair_housing_patterns`.
    pub fair_housing_patterns: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_timeout_ms: Option<u64>,
    pub cache_enabled: Option<bool>,
    pub default_threshold: Option<f64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://leadline.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                model: "lead-classifier".to_string(),
                api_key: None,
                base_url: None,
                timeout_ms: 8_000,
                max_retries: 1,
                retry_backoff_ms: 100,
            },
            cache: CacheConfig {
                enabled: true,
                l1_ttl_secs: 60 * 60,
                l2_ttl_secs: 24 * 60 * 60,
                l3_ttl_secs: 7 * 24 * 60 * 60,
                l1_max_entries: 10_000,
                l2_max_entries: 50_000,
                l3_window_size: 1_000,
                similarity_threshold: 0.85,
                relaxed_similarity_threshold: 0.70,
                embedding_dimensions: 256,
            },
            handoff: HandoffConfig {
                default_threshold: 0.70,
                max_handoffs_per_window: 3,
                loop_window_secs: 10 * 60,
                cached_confidence_penalty: 0.05,
                lead_signal_weight: 0.0,
            },
            learning: LearningConfig {
                min_samples: 15,
                max_step: 0.05,
                target_success_rate: 0.90,
                adjustment_gain: 1.5,
                floor: 0.50,
                ceiling: 0.95,
                cas_max_attempts: 5,
            },
            compliance: ComplianceConfig::default(),
            session: SessionConfig { inactivity_archive_secs: 7 * 24 * 60 * 60 },
            persistence: PersistenceConfig { max_write_attempts: 3, write_backoff_ms: 50 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            tenants: BTreeMap::new(),
        }
    }
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        let owned = |values: &[&str]| values.iter().map(|value| value.to_string()).collect();
        Self {
            ai_disclosure_text: "This message is from an AI assistant.".to_string(),
            recording_notice_text: "This call may be recorded for quality and compliance purposes."
                .to_string(),
            fair_housing_patterns: owned(&[
                r"\bno\s+(kids|children|families)\b",
                r"\b(adults|singles)\s+only\b",
                r"\b(perfect|ideal|great|best)\s+for\s+(a\s+)?(christian|muslim|jewish|catholic|hispanic|latino|asian|white|black)s?\b",
                r"\b(christian|muslim|jewish|catholic|hispanic|latino|asian|white|black)\s+(neighbou?rhood|community|area|building|families)\b",
                r"\bno\s+(disabled|handicapped|wheelchairs?)\b",
                r"\b(english[-\s]speaking|american[-\s]born)\s+(only|buyers|tenants|families)\b",
                r"\b(not|isn't|is\s+not)\s+(a\s+good\s+)?fit\s+for\s+(families|people)\s+(with\s+kids|like\s+you)\b",
            ]),
            promotional_markers: owned(&[
                "open house",
                "new listing",
                "just listed",
                "price drop",
                "special offer",
                "limited time",
                "exclusive deal",
                "discount",
                "free home valuation",
            ]),
            opt_out_keywords: owned(&[
                "STOP",
                "STOPALL",
                "UNSUBSCRIBE",
                "CANCEL",
                "END",
                "QUIT",
                "REMOVE",
                "OPT OUT",
            ]),
            opt_out_confirmation:
                "You have been unsubscribed and will not receive further messages.".to_string(),
            hold_message:
                "Thanks for your message! A member of our team will follow up with you shortly."
                    .to_string(),
            escalation_message:
                "Thanks for reaching out. A licensed agent will follow up with you directly."
                    .to_string(),
            sms_max_chars: 320,
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("leadline.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn tenant_overrides(&self, tenant_id: &str) -> Option<&TenantOverrides> {
        self.tenants.get(tenant_id)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            set(&mut self.database.url, database.url);
            set(&mut self.database.max_connections, database.max_connections);
            set(&mut self.database.timeout_secs, database.timeout_secs);
        }

        if let Some(llm) = patch.llm {
            set(&mut self.llm.model, llm.model);
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            set(&mut self.llm.timeout_ms, llm.timeout_ms);
            set(&mut self.llm.max_retries, llm.max_retries);
            set(&mut self.llm.retry_backoff_ms, llm.retry_backoff_ms);
        }

        if let Some(cache) = patch.cache {
            set(&mut self.cache.enabled, cache.enabled);
            set(&mut self.cache.l1_ttl_secs, cache.l1_ttl_secs);
            set(&mut self.cache.l2_ttl_secs, cache.l2_ttl_secs);
            set(&mut self.cache.l3_ttl_secs, cache.l3_ttl_secs);
            set(&mut self.cache.l1_max_entries, cache.l1_max_entries);
            set(&mut self.cache.l2_max_entries, cache.l2_max_entries);
            set(&mut self.cache.l3_window_size, cache.l3_window_size);
            set(&mut self.cache.similarity_threshold, cache.similarity_threshold);
            set(&mut self.cache.relaxed_similarity_threshold, cache.relaxed_similarity_threshold);
            set(&mut self.cache.embedding_dimensions, cache.embedding_dimensions);
        }

        if let Some(handoff) = patch.handoff {
            set(&mut self.handoff.default_threshold, handoff.default_threshold);
            set(&mut self.handoff.max_handoffs_per_window, handoff.max_handoffs_per_window);
            set(&mut self.handoff.loop_window_secs, handoff.loop_window_secs);
            set(&mut self.handoff.cached_confidence_penalty, handoff.cached_confidence_penalty);
            set(&mut self.handoff.lead_signal_weight, handoff.lead_signal_weight);
        }

        if let Some(learning) = patch.learning {
            set(&mut self.learning.min_samples, learning.min_samples);
            set(&mut self.learning.max_step, learning.max_step);
            set(&mut self.learning.target_success_rate, learning.target_success_rate);
            set(&mut self.learning.adjustment_gain, learning.adjustment_gain);
            set(&mut self.learning.floor, learning.floor);
            set(&mut self.learning.ceiling, learning.ceiling);
            set(&mut self.learning.cas_max_attempts, learning.cas_max_attempts);
        }

        if let Some(compliance) = patch.compliance {
            set(&mut self.compliance.ai_disclosure_text, compliance.ai_disclosure_text);
            set(&mut self.compliance.recording_notice_text, compliance.recording_notice_text);
            set(&mut self.compliance.fair_housing_patterns, compliance.fair_housing_patterns);
            set(&mut self.compliance.promotional_markers, compliance.promotional_markers);
            set(&mut self.compliance.opt_out_keywords, compliance.opt_out_keywords);
            set(&mut self.compliance.opt_out_confirmation, compliance.opt_out_confirmation);
            set(&mut self.compliance.hold_message, compliance.hold_message);
            set(&mut self.compliance.escalation_message, compliance.escalation_message);
            set(&mut self.compliance.sms_max_chars, compliance.sms_max_chars);
        }

        if let Some(session) = patch.session {
            set(&mut self.session.inactivity_archive_secs, session.inactivity_archive_secs);
        }

        if let Some(persistence) = patch.persistence {
            set(&mut self.persistence.max_write_attempts, persistence.max_write_attempts);
            set(&mut self.persistence.write_backoff_ms, persistence.write_backoff_ms);
        }

        if let Some(logging) = patch.logging {
            set(&mut self.logging.level, logging.level);
            set(&mut self.logging.format, logging.format);
        }

        if let Some(tenants) = patch.tenants {
            self.tenants.extend(tenants);
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("LEADLINE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("LEADLINE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_env("LEADLINE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("LEADLINE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("LEADLINE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("LEADLINE_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("LEADLINE_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("LEADLINE_LLM_TIMEOUT_MS") {
            self.llm.timeout_ms = parse_env("LEADLINE_LLM_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_env("LEADLINE_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("LEADLINE_CACHE_ENABLED") {
            self.cache.enabled = parse_env("LEADLINE_CACHE_ENABLED", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_CACHE_L1_TTL_SECS") {
            self.cache.l1_ttl_secs = parse_env("LEADLINE_CACHE_L1_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_CACHE_L2_TTL_SECS") {
            self.cache.l2_ttl_secs = parse_env("LEADLINE_CACHE_L2_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_CACHE_L3_TTL_SECS") {
            self.cache.l3_ttl_secs = parse_env("LEADLINE_CACHE_L3_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_CACHE_SIMILARITY_THRESHOLD") {
            self.cache.similarity_threshold =
                parse_env("LEADLINE_CACHE_SIMILARITY_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_CACHE_RELAXED_SIMILARITY_THRESHOLD") {
            self.cache.relaxed_similarity_threshold =
                parse_env("LEADLINE_CACHE_RELAXED_SIMILARITY_THRESHOLD", &value)?;
        }

        if let Some(value) = read_env("LEADLINE_HANDOFF_DEFAULT_THRESHOLD") {
            self.handoff.default_threshold =
                parse_env("LEADLINE_HANDOFF_DEFAULT_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_HANDOFF_MAX_HANDOFFS_PER_WINDOW") {
            self.handoff.max_handoffs_per_window =
                parse_env("LEADLINE_HANDOFF_MAX_HANDOFFS_PER_WINDOW", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_HANDOFF_LOOP_WINDOW_SECS") {
            self.handoff.loop_window_secs = parse_env("LEADLINE_HANDOFF_LOOP_WINDOW_SECS", &value)?;
        }

        if let Some(value) = read_env("LEADLINE_LEARNING_MIN_SAMPLES") {
            self.learning.min_samples = parse_env("LEADLINE_LEARNING_MIN_SAMPLES", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_LEARNING_MAX_STEP") {
            self.learning.max_step = parse_env("LEADLINE_LEARNING_MAX_STEP", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_LEARNING_TARGET_SUCCESS_RATE") {
            self.learning.target_success_rate =
                parse_env("LEADLINE_LEARNING_TARGET_SUCCESS_RATE", &value)?;
        }

        if let Some(value) = read_env("LEADLINE_SESSION_INACTIVITY_ARCHIVE_SECS") {
            self.session.inactivity_archive_secs =
                parse_env("LEADLINE_SESSION_INACTIVITY_ARCHIVE_SECS", &value)?;
        }

        let log_level =
            read_env("LEADLINE_LOGGING_LEVEL").or_else(|| read_env("LEADLINE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("LEADLINE_LOGGING_FORMAT").or_else(|| read_env("LEADLINE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        set(&mut self.database.url, overrides.database_url);
        set(&mut self.logging.level, overrides.log_level);
        set(&mut self.llm.timeout_ms, overrides.llm_timeout_ms);
        set(&mut self.cache.enabled, overrides.cache_enabled);
        set(&mut self.handoff.default_threshold, overrides.default_threshold);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_cache(&self.cache)?;
        validate_handoff(&self.handoff)?;
        validate_learning(&self.learning, self.handoff.default_threshold)?;
        validate_compliance(&self.compliance)?;
        validate_persistence(&self.persistence)?;
        validate_logging(&self.logging)?;
        for (tenant_id, overrides) in &self.tenants {
            validate_tenant(tenant_id, overrides)?;
        }
        Ok(())
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("leadline.toml"), PathBuf::from("config/leadline.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn validation(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation(message.into())
}

fn unit_interval(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)",
        ));
    }

    if database.max_connections == 0 {
        return Err(validation("database.max_connections must be greater than zero"));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(validation("database.timeout_secs must be in range 1..=300"));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_ms == 0 || llm.timeout_ms > 120_000 {
        return Err(validation("llm.timeout_ms must be in range 1..=120000"));
    }

    if llm.max_retries > 5 {
        return Err(validation("llm.max_retries must be at most 5"));
    }

    if let Some(api_key) = &llm.api_key {
        if api_key.expose_secret().trim().is_empty() {
            return Err(validation("llm.api_key must not be blank when set"));
        }
    }

    if let Some(base_url) = &llm.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(validation("llm.base_url must start with http:// or https://"));
        }
    }

    Ok(())
}

fn validate_cache(cache: &CacheConfig) -> Result<(), ConfigError> {
    if cache.l1_ttl_secs == 0 || cache.l2_ttl_secs == 0 || cache.l3_ttl_secs == 0 {
        return Err(validation("cache.l1_ttl_secs, l2_ttl_secs and l3_ttl_secs must be positive"));
    }

    if [cache.l1_ttl_secs, cache.l2_ttl_secs, cache.l3_ttl_secs].iter().any(|ttl| *ttl > MAX_TTL_SECS) {
        return Err(validation("cache TTLs must not exceed ten years"));
    }

    if cache.l1_max_entries == 0 || cache.l2_max_entries == 0 || cache.l3_window_size == 0 {
        return Err(validation("cache capacities must be greater than zero"));
    }

    if !unit_interval(f64::from(cache.similarity_threshold)) {
        return Err(validation("cache.similarity_threshold must be in range 0.0..=1.0"));
    }

    if !unit_interval(f64::from(cache.relaxed_similarity_threshold))
        || cache.relaxed_similarity_threshold > cache.similarity_threshold
    {
        return Err(validation(
            "cache.relaxed_similarity_threshold must be in range 0.0..=cache.similarity_threshold",
        ));
    }

    if !(16..=4096).contains(&cache.embedding_dimensions) {
        return Err(validation("cache.embedding_dimensions must be in range 16..=4096"));
    }

    Ok(())
}

fn validate_handoff(handoff: &HandoffConfig) -> Result<(), ConfigError> {
    if !unit_interval(handoff.default_threshold) {
        return Err(validation("handoff.default_threshold must be in range 0.0..=1.0"));
    }

    if handoff.max_handoffs_per_window == 0 {
        return Err(validation("handoff.max_handoffs_per_window must be greater than zero"));
    }

    if handoff.loop_window_secs == 0 {
        return Err(validation("handoff.loop_window_secs must be greater than zero"));
    }

    if !unit_interval(handoff.cached_confidence_penalty) {
        return Err(validation("handoff.cached_confidence_penalty must be in range 0.0..=1.0"));
    }

    if !unit_interval(handoff.lead_signal_weight) {
        return Err(validation("handoff.lead_signal_weight must be in range 0.0..=1.0"));
    }

    Ok(())
}

fn validate_learning(learning: &LearningConfig, default_threshold: f64) -> Result<(), ConfigError> {
    if learning.min_samples == 0 {
        return Err(validation("learning.min_samples must be greater than zero"));
    }

    if learning.max_step <= 0.0 || learning.max_step > 0.5 {
        return Err(validation("learning.max_step must be in range (0.0, 0.5]"));
    }

    if learning.target_success_rate <= 0.0 || learning.target_success_rate >= 1.0 {
        return Err(validation("learning.target_success_rate must be in range (0.0, 1.0)"));
    }

    if learning.adjustment_gain <= 0.0 {
        return Err(validation("learning.adjustment_gain must be positive"));
    }

    if !unit_interval(learning.floor)
        || !unit_interval(learning.ceiling)
        || learning.floor > learning.ceiling
    {
        return Err(validation("learning.floor and learning.ceiling must satisfy 0 <= floor <= ceiling <= 1"));
    }

    if default_threshold < learning.floor || default_threshold > learning.ceiling {
        return Err(validation(
            "handoff.default_threshold must lie between learning.floor and learning.ceiling",
        ));
    }

    if learning.cas_max_attempts == 0 {
        return Err(validation("learning.cas_max_attempts must be greater than zero"));
    }

    Ok(())
}

fn validate_compliance(compliance: &ComplianceConfig) -> Result<(), ConfigError> {
    if compliance.ai_disclosure_text.trim().is_empty() {
        return Err(validation("compliance.ai_disclosure_text must not be empty"));
    }

    if compliance.recording_notice_text.trim().is_empty() {
        return Err(validation("compliance.recording_notice_text must not be empty"));
    }

    for pattern in &compliance.fair_housing_patterns {
        regex::Regex::new(pattern).map_err(|error| {
            validation(format!("compliance.fair_housing_patterns entry `{pattern}` is invalid: {error}"))
        })?;
    }

    if compliance.opt_out_keywords.iter().all(|keyword| keyword.trim().is_empty()) {
        return Err(validation("compliance.opt_out_keywords must contain at least one keyword"));
    }

    if compliance.hold_message.trim().is_empty() || compliance.escalation_message.trim().is_empty()
    {
        return Err(validation(
            "compliance.hold_message and compliance.escalation_message must not be empty",
        ));
    }

    if compliance.sms_max_chars < compliance.ai_disclosure_text.chars().count() + 20 {
        return Err(validation(
            "compliance.sms_max_chars must leave room for the AI disclosure and a reply",
        ));
    }

    Ok(())
}

fn validate_persistence(persistence: &PersistenceConfig) -> Result<(), ConfigError> {
    if persistence.max_write_attempts == 0 || persistence.max_write_attempts > 10 {
        return Err(validation("persistence.max_write_attempts must be in range 1..=10"));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(validation("logging.level must be one of trace|debug|info|warn|error")),
    }
}

fn validate_tenant(tenant_id: &str, overrides: &TenantOverrides) -> Result<(), ConfigError> {
    let zero_ttl = [overrides.l1_ttl_secs, overrides.l2_ttl_secs, overrides.l3_ttl_secs]
        .into_iter()
        .flatten()
        .any(|ttl| ttl == 0);
    if zero_ttl {
        return Err(validation(format!("tenants.{tenant_id} cache TTL overrides must be positive")));
    }

    if let Some(threshold) = overrides.similarity_threshold {
        if !unit_interval(f64::from(threshold)) {
            return Err(validation(format!(
                "tenants.{tenant_id}.similarity_threshold must be in range 0.0..=1.0"
            )));
        }
    }

    if overrides.blocked_phrases.iter().any(|phrase| phrase.trim().is_empty()) {
        return Err(validation(format!("tenants.{tenant_id}.blocked_phrases must not contain blanks")));
    }

    for pattern in &overrides.fair_housing_patterns {
        regex::Regex::new(pattern).map_err(|error| {
            validation(format!(
                "tenants.{tenant_id}.fair_housing_patterns entry `{pattern}` is invalid: {error}"
            ))
        })?;
    }

    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    cache: Option<CachePatch>,
    handoff: Option<HandoffPatch>,
    learning: Option<LearningPatch>,
    compliance: Option<CompliancePatch>,
    session: Option<SessionPatch>,
    persistence: Option<PersistencePatch>,
    logging: Option<LoggingPatch>,
    tenants: Option<BTreeMap<String, TenantOverrides>>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    model: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CachePatch {
    enabled: Option<bool>,
    l1_ttl_secs: Option<u64>,
    l2_ttl_secs: Option<u64>,
    l3_ttl_secs: Option<u64>,
    l1_max_entries: Option<u64>,
    l2_max_entries: Option<u64>,
    l3_window_size: Option<usize>,
    similarity_threshold: Option<f32>,
    relaxed_similarity_threshold: Option<f32>,
    embedding_dimensions: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct HandoffPatch {
    default_threshold: Option<f64>,
    max_handoffs_per_window: Option<usize>,
    loop_window_secs: Option<u64>,
    cached_confidence_penalty: Option<f64>,
    lead_signal_weight: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct LearningPatch {
    min_samples: Option<u32>,
    max_step: Option<f64>,
    target_success_rate: Option<f64>,
    adjustment_gain: Option<f64>,
    floor: Option<f64>,
    ceiling: Option<f64>,
    cas_max_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct CompliancePatch {
    ai_disclosure_text: Option<String>,
    recording_notice_text: Option<String>,
    fair_housing_patterns: Option<Vec<String>>,
    promotional_markers: Option<Vec<String>>,
    opt_out_keywords: Option<Vec<String>>,
    opt_out_confirmation: Option<String>,
    hold_message: Option<String>,
    escalation_message: Option<String>,
    sms_max_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionPatch {
    inactivity_archive_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PersistencePatch {
    max_write_attempts: Option<u32>,
    write_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
