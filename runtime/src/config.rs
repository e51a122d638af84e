//! Process-wide configuration, loaded once from the environment.
//!
//! Every setting has a default, an environment variable name and a valid
//! range; `Config::from_env` never panics, `Config::validate` collects every
//! violated constraint instead of stopping at the first one.

use std::env;
use thiserror::Error;

pub const DEFAULT_INITIAL_REASONING_EFFECTIVENESS: f64 = 0.8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("configuration invalid: {0}")]
    Invalid(String),
    #[error("failed to parse {key}: {source}")]
    ParseError {
        key: &'static str,
        #[source]
        source: std::num::ParseFloatError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl LogFormat {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "pretty" => Some(LogFormat::Pretty),
            "json" => Some(LogFormat::Json),
            "compact" => Some(LogFormat::Compact),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KnowledgeConfig {
    pub max_concurrency: usize,
    pub timeout_ms: u64,
    pub confidence_threshold: f64,
    pub max_response_size: usize,
    pub auto_connection_enabled: bool,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            timeout_ms: 4000,
            confidence_threshold: 0.4,
            max_response_size: 5000,
            auto_connection_enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 5,
            window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SsrfConfig {
    pub enabled: bool,
    pub allowed_hosts: Vec<String>,
}

impl Default for SsrfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThresholdConfig {
    pub verification_completion_threshold: f64,
    pub execution_success_rate_threshold: f64,
    pub initial_reasoning_effectiveness: f64,
    pub min_reasoning_effectiveness: f64,
    pub max_reasoning_effectiveness: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            verification_completion_threshold: 95.0,
            execution_success_rate_threshold: 0.7,
            initial_reasoning_effectiveness: DEFAULT_INITIAL_REASONING_EFFECTIVENESS,
            min_reasoning_effectiveness: 0.3,
            max_reasoning_effectiveness: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionStoreConfig {
    pub store_path: String,
    pub eviction_hours: u64,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            store_path: "./.orchestrator-sessions".to_string(),
            eviction_hours: 24,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub knowledge: KnowledgeConfig,
    pub rate_limit: RateLimitConfig,
    pub max_content_length: usize,
    pub ssrf: SsrfConfig,
    pub thresholds: ThresholdConfig,
    pub session_store: SessionStoreConfig,
    pub logging: LoggingConfig,
    pub user_agent: String,
    pub endpoint_registry_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            knowledge: KnowledgeConfig::default(),
            rate_limit: RateLimitConfig::default(),
            max_content_length: 2 * 1024 * 1024,
            ssrf: SsrfConfig::default(),
            thresholds: ThresholdConfig::default(),
            session_store: SessionStoreConfig::default(),
            logging: LoggingConfig::default(),
            user_agent: format!("eightfold-orchestrator/{}", env!("CARGO_PKG_VERSION")),
            endpoint_registry_path: None,
        }
    }
}

impl Config {
    /// Loads configuration from the environment, falling back to defaults.
    /// Never panics; invalid values are caught later by `validate`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Config::default();

        if let Ok(v) = env::var("KNOWLEDGE_MAX_CONCURRENCY") {
            cfg.knowledge.max_concurrency = parse_or_warn(&v, "KNOWLEDGE_MAX_CONCURRENCY", cfg.knowledge.max_concurrency);
        }
        if let Ok(v) = env::var("KNOWLEDGE_TIMEOUT_MS") {
            cfg.knowledge.timeout_ms = parse_or_warn(&v, "KNOWLEDGE_TIMEOUT_MS", cfg.knowledge.timeout_ms);
        }
        if let Ok(v) = env::var("KNOWLEDGE_CONFIDENCE_THRESHOLD") {
            cfg.knowledge.confidence_threshold =
                parse_or_warn(&v, "KNOWLEDGE_CONFIDENCE_THRESHOLD", cfg.knowledge.confidence_threshold);
        }
        if let Ok(v) = env::var("KNOWLEDGE_MAX_RESPONSE_SIZE") {
            cfg.knowledge.max_response_size =
                parse_or_warn(&v, "KNOWLEDGE_MAX_RESPONSE_SIZE", cfg.knowledge.max_response_size);
        }
        if let Ok(v) = env::var("AUTO_CONNECTION_ENABLED") {
            cfg.knowledge.auto_connection_enabled = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Ok(v) = env::var("RATE_LIMIT_REQUESTS_PER_MINUTE") {
            cfg.rate_limit.requests_per_minute =
                parse_or_warn(&v, "RATE_LIMIT_REQUESTS_PER_MINUTE", cfg.rate_limit.requests_per_minute);
        }
        if let Ok(v) = env::var("RATE_LIMIT_WINDOW_MS") {
            cfg.rate_limit.window_ms = parse_or_warn(&v, "RATE_LIMIT_WINDOW_MS", cfg.rate_limit.window_ms);
        }
        if let Ok(v) = env::var("MAX_CONTENT_LENGTH").or_else(|_| env::var("MAX_BODY_LENGTH")) {
            cfg.max_content_length = parse_or_warn(&v, "MAX_CONTENT_LENGTH", cfg.max_content_length);
        }
        if let Ok(v) = env::var("ENABLE_SSRF_PROTECTION") {
            cfg.ssrf.enabled = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Ok(v) = env::var("ALLOWED_HOSTS") {
            cfg.ssrf.allowed_hosts = v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        if let Ok(v) = env::var("VERIFICATION_COMPLETION_THRESHOLD") {
            cfg.thresholds.verification_completion_threshold =
                parse_or_warn(&v, "VERIFICATION_COMPLETION_THRESHOLD", cfg.thresholds.verification_completion_threshold);
        }
        if let Ok(v) = env::var("EXECUTION_SUCCESS_RATE_THRESHOLD") {
            cfg.thresholds.execution_success_rate_threshold = parse_or_warn(
                &v,
                "EXECUTION_SUCCESS_RATE_THRESHOLD",
                cfg.thresholds.execution_success_rate_threshold,
            );
        }
        if let Ok(v) = env::var("INITIAL_REASONING_EFFECTIVENESS") {
            cfg.thresholds.initial_reasoning_effectiveness = parse_or_warn(
                &v,
                "INITIAL_REASONING_EFFECTIVENESS",
                cfg.thresholds.initial_reasoning_effectiveness,
            );
        }
        if let Ok(v) = env::var("MIN_REASONING_EFFECTIVENESS") {
            cfg.thresholds.min_reasoning_effectiveness =
                parse_or_warn(&v, "MIN_REASONING_EFFECTIVENESS", cfg.thresholds.min_reasoning_effectiveness);
        }
        if let Ok(v) = env::var("MAX_REASONING_EFFECTIVENESS") {
            cfg.thresholds.max_reasoning_effectiveness =
                parse_or_warn(&v, "MAX_REASONING_EFFECTIVENESS", cfg.thresholds.max_reasoning_effectiveness);
        }
        if let Ok(v) = env::var("SESSION_STORE_PATH") {
            cfg.session_store.store_path = v;
        }
        if let Ok(v) = env::var("SESSION_EVICTION_HOURS") {
            cfg.session_store.eviction_hours = parse_or_warn(&v, "SESSION_EVICTION_HOURS", cfg.session_store.eviction_hours);
        }
        if let Ok(v) = env::var("LOG_LEVEL") {
            cfg.logging.level = v;
        }
        if let Ok(v) = env::var("LOG_FORMAT") {
            if let Some(fmt) = LogFormat::parse(&v) {
                cfg.logging.format = fmt;
            } else {
                tracing::warn!(value = %v, "unrecognized LOG_FORMAT, keeping default");
            }
        }
        if let Ok(v) = env::var("USER_AGENT") {
            cfg.user_agent = v;
        }
        if let Ok(v) = env::var("ENDPOINT_REGISTRY_PATH") {
            cfg.endpoint_registry_path = Some(v);
        }

        Ok(cfg)
    }

    /// Validates every bound, collecting all violations rather than
    /// stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = Vec::new();

        if !(1..=10).contains(&self.knowledge.max_concurrency) {
            violations.push(format!(
                "KNOWLEDGE_MAX_CONCURRENCY must be in 1..=10, got {}",
                self.knowledge.max_concurrency
            ));
        }
        if !(1000..=30_000).contains(&self.knowledge.timeout_ms) {
            violations.push(format!(
                "KNOWLEDGE_TIMEOUT_MS must be in 1000..=30000, got {}",
                self.knowledge.timeout_ms
            ));
        }
        if !(0.0..=1.0).contains(&self.knowledge.confidence_threshold) {
            violations.push("KNOWLEDGE_CONFIDENCE_THRESHOLD must be in 0..=1".to_string());
        }
        if self.knowledge.max_response_size == 0 {
            violations.push("KNOWLEDGE_MAX_RESPONSE_SIZE must be > 0".to_string());
        }
        if self.rate_limit.requests_per_minute == 0 {
            violations.push("RATE_LIMIT_REQUESTS_PER_MINUTE must be >= 1".to_string());
        }
        if self.rate_limit.window_ms < 1000 {
            violations.push("RATE_LIMIT_WINDOW_MS must be >= 1000".to_string());
        }
        if self.max_content_length < 1024 {
            violations.push("MAX_CONTENT_LENGTH must be >= 1024".to_string());
        }
        if !(50.0..=100.0).contains(&self.thresholds.verification_completion_threshold) {
            violations.push("VERIFICATION_COMPLETION_THRESHOLD must be in 50..=100".to_string());
        }
        if !(0.0..=1.0).contains(&self.thresholds.execution_success_rate_threshold) {
            violations.push("EXECUTION_SUCCESS_RATE_THRESHOLD must be in 0..=1".to_string());
        }
        if self.thresholds.min_reasoning_effectiveness > self.thresholds.max_reasoning_effectiveness {
            violations.push("MIN_REASONING_EFFECTIVENESS must be <= MAX_REASONING_EFFECTIVENESS".to_string());
        }
        if self.session_store.eviction_hours == 0 {
            violations.push("SESSION_EVICTION_HOURS must be >= 1".to_string());
        }
        if !matches!(self.logging.level.as_str(), "error" | "warn" | "info" | "debug" | "trace") {
            violations.push(format!("LOG_LEVEL '{}' is not a recognized level", self.logging.level));
        }
        if !self.ssrf.enabled {
            // This deployment has no separate dev/prod environment concept, so
            // there is no "trusted network" exception to carve out: disabling
            // the guard is always fatal.
            violations.push("ENABLE_SSRF_PROTECTION must not be disabled".to_string());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            for v in &violations {
                tracing::error!(violation = %v, "config validation failed");
            }
            Err(ConfigError::Invalid(violations.join("; ")))
        }
    }
}

fn parse_or_warn<T: std::str::FromStr + Copy>(raw: &str, key: &str, default: T) -> T {
    raw.parse().unwrap_or_else(|_| {
        tracing::warn!(key, raw, "failed to parse env var, using default");
        default
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_min_greater_than_max() {
        let mut cfg = Config::default();
        cfg.thresholds.min_reasoning_effectiveness = 0.9;
        cfg.thresholds.max_reasoning_effectiveness = 0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn collects_multiple_violations() {
        let mut cfg = Config::default();
        cfg.knowledge.max_concurrency = 0;
        cfg.rate_limit.requests_per_minute = 0;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("KNOWLEDGE_MAX_CONCURRENCY"));
        assert!(err.contains("RATE_LIMIT_REQUESTS_PER_MINUTE"));
    }

    #[test]
    fn rejects_unrecognized_log_level() {
        let mut cfg = Config::default();
        cfg.logging.level = "verbose".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_ssrf_protection_disabled() {
        let mut cfg = Config::default();
        cfg.ssrf.enabled = false;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("ENABLE_SSRF_PROTECTION"));
    }

    #[test]
    fn validate_is_idempotent() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.validate().is_ok());
    }
}
