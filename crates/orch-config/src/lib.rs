//! Configuration loading, validation, and merging for the job orchestrator.
//!
//! This crate provides [`OrchConfig`] — the top-level runtime settings for
//! the initiator, controller, watchdog, daemon, and CLI — together with
//! helpers for loading from TOML files, applying environment-variable
//! overrides, and producing advisory [`ConfigWarning`]s.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },
    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },
    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// The lock TTL is unusually large.
    LargeLockTtl {
        /// Configured value in seconds.
        secs: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::LargeLockTtl { secs } => {
                write!(f, "lock_ttl_seconds is unusually large ({secs}s)")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Retry policy applied to store-adapter calls.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct RetryPolicy {
    /// Base delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Maximum number of attempts (including the first).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Jitter, as a fraction of the computed delay (0.5 = ±50%).
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
}

fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    16_000
}
fn default_max_attempts() -> u32 {
    4
}
fn default_jitter_fraction() -> f64 {
    0.5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter_fraction: default_jitter_fraction(),
        }
    }
}

fn default_orders_table() -> String {
    "orders".to_string()
}
fn default_order_events_table() -> String {
    "order_events".to_string()
}
fn default_locks_table() -> String {
    "locks".to_string()
}
fn default_dispatch_concurrency() -> usize {
    10
}
fn default_lock_ttl_seconds() -> i64 {
    3600
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Top-level runtime configuration for the job orchestrator.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct OrchConfig {
    /// Key-value store table identifier for `orders`.
    #[serde(default = "default_orders_table")]
    pub orders_table: String,
    /// Key-value store table identifier for `order_events`.
    #[serde(default = "default_order_events_table")]
    pub order_events_table: String,
    /// Key-value store table identifier for `locks`.
    #[serde(default = "default_locks_table")]
    pub locks_table: String,
    /// Object-store bucket for archives, callbacks, and init triggers.
    pub internal_bucket: String,
    /// Object-store bucket for terminal `done` artifacts.
    pub done_bucket: String,
    /// Back-end handle for the serverless function runner.
    #[serde(default)]
    pub backend_function_handle: Option<String>,
    /// Back-end handle for the managed build service.
    #[serde(default)]
    pub backend_build_handle: Option<String>,
    /// Back-end handle for the watchdog state machine.
    #[serde(default)]
    pub backend_watchdog_handle: Option<String>,
    /// Default document identifier used by the agent back-end.
    #[serde(default)]
    pub agent_default_document: Option<String>,
    /// Dispatcher bounded-worker-pool size (dispatch concurrency is
    /// `min(ready, this value)`).
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: usize,
    /// Default lock TTL, in seconds, used on acquire.
    #[serde(default = "default_lock_ttl_seconds")]
    pub lock_ttl_seconds: i64,
    /// Store-adapter retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for OrchConfig {
    fn default() -> Self {
        OrchConfig {
            orders_table: default_orders_table(),
            order_events_table: default_order_events_table(),
            locks_table: default_locks_table(),
            internal_bucket: String::new(),
            done_bucket: String::new(),
            backend_function_handle: None,
            backend_build_handle: None,
            backend_watchdog_handle: None,
            agent_default_document: None,
            dispatch_concurrency: default_dispatch_concurrency(),
            lock_ttl_seconds: default_lock_ttl_seconds(),
            retry: RetryPolicy::default(),
            log_level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const MAX_LOCK_TTL_SECONDS: i64 = 86_400;
const LARGE_LOCK_TTL_THRESHOLD: i64 = 24 * 3600;
const MAX_DISPATCH_CONCURRENCY: usize = 100;
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load an [`OrchConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, starts from [`OrchConfig::default()`].
///
/// Environment variable overrides are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<OrchConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => OrchConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into an [`OrchConfig`].
pub fn parse_toml(content: &str) -> Result<OrchConfig, ConfigError> {
    toml::from_str::<OrchConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides.
///
/// Recognised variables: `ORCH_ORDERS_TABLE`, `ORCH_ORDER_EVENTS_TABLE`,
/// `ORCH_LOCKS_TABLE`, `ORCH_INTERNAL_BUCKET`, `ORCH_DONE_BUCKET`,
/// `ORCH_BACKEND_FUNCTION_HANDLE`, `ORCH_BACKEND_BUILD_HANDLE`,
/// `ORCH_BACKEND_WATCHDOG_HANDLE`, `ORCH_AGENT_DEFAULT_DOCUMENT`,
/// `ORCH_DISPATCH_CONCURRENCY`, `ORCH_LOCK_TTL_SECONDS`, `ORCH_LOG_LEVEL`.
pub fn apply_env_overrides(config: &mut OrchConfig) {
    if let Ok(val) = std::env::var("ORCH_ORDERS_TABLE") {
        config.orders_table = val;
    }
    if let Ok(val) = std::env::var("ORCH_ORDER_EVENTS_TABLE") {
        config.order_events_table = val;
    }
    if let Ok(val) = std::env::var("ORCH_LOCKS_TABLE") {
        config.locks_table = val;
    }
    if let Ok(val) = std::env::var("ORCH_INTERNAL_BUCKET") {
        config.internal_bucket = val;
    }
    if let Ok(val) = std::env::var("ORCH_DONE_BUCKET") {
        config.done_bucket = val;
    }
    if let Ok(val) = std::env::var("ORCH_BACKEND_FUNCTION_HANDLE") {
        config.backend_function_handle = Some(val);
    }
    if let Ok(val) = std::env::var("ORCH_BACKEND_BUILD_HANDLE") {
        config.backend_build_handle = Some(val);
    }
    if let Ok(val) = std::env::var("ORCH_BACKEND_WATCHDOG_HANDLE") {
        config.backend_watchdog_handle = Some(val);
    }
    if let Ok(val) = std::env::var("ORCH_AGENT_DEFAULT_DOCUMENT") {
        config.agent_default_document = Some(val);
    }
    if let Ok(val) = std::env::var("ORCH_DISPATCH_CONCURRENCY") {
        if let Ok(n) = val.parse() {
            config.dispatch_concurrency = n;
        }
    }
    if let Ok(val) = std::env::var("ORCH_LOCK_TTL_SECONDS") {
        if let Ok(n) = val.parse() {
            config.lock_ttl_seconds = n;
        }
    }
    if let Ok(val) = std::env::var("ORCH_LOG_LEVEL") {
        config.log_level = val;
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (empty required buckets, out-of-range knobs) are returned as
/// a [`ConfigError::ValidationError`]; soft issues come back as warnings.
pub fn validate_config(config: &OrchConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if config.internal_bucket.trim().is_empty() {
        errors.push("internal_bucket must not be empty".into());
    }
    if config.done_bucket.trim().is_empty() {
        errors.push("done_bucket must not be empty".into());
    }
    if !VALID_LOG_LEVELS.contains(&config.log_level.as_str()) {
        errors.push(format!("invalid log_level '{}'", config.log_level));
    }
    if config.dispatch_concurrency == 0 || config.dispatch_concurrency > MAX_DISPATCH_CONCURRENCY {
        errors.push(format!(
            "dispatch_concurrency {} out of range (1..{MAX_DISPATCH_CONCURRENCY})",
            config.dispatch_concurrency
        ));
    }
    if config.lock_ttl_seconds <= 0 || config.lock_ttl_seconds > MAX_LOCK_TTL_SECONDS {
        errors.push(format!(
            "lock_ttl_seconds {} out of range (1..{MAX_LOCK_TTL_SECONDS})",
            config.lock_ttl_seconds
        ));
    } else if config.lock_ttl_seconds > LARGE_LOCK_TTL_THRESHOLD {
        warnings.push(ConfigWarning::LargeLockTtl {
            secs: config.lock_ttl_seconds as u64,
        });
    }
    if config.retry.max_attempts == 0 {
        errors.push("retry.max_attempts must be at least 1".into());
    }

    if config.agent_default_document.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "agent_default_document".into(),
            hint: "the agent back-end will fail at dispatch time without it".into(),
        });
    }
    if config.backend_watchdog_handle.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "backend_watchdog_handle".into(),
            hint: "the watchdog will run as an in-process loop rather than a managed state machine".into(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> OrchConfig {
        OrchConfig {
            internal_bucket: "internal".into(),
            done_bucket: "done".into(),
            ..Default::default()
        }
    }

    #[test]
    fn default_config_has_sensible_defaults() {
        let cfg = OrchConfig::default();
        assert_eq!(cfg.orders_table, "orders");
        assert_eq!(cfg.order_events_table, "order_events");
        assert_eq!(cfg.locks_table, "locks");
        assert_eq!(cfg.dispatch_concurrency, 10);
        assert_eq!(cfg.lock_ttl_seconds, 3600);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn parse_valid_toml_string() {
        let toml = r#"
            internal_bucket = "internal-bucket"
            done_bucket = "done-bucket"
            log_level = "debug"
        "#;
        let cfg = parse_toml(toml).unwrap();
        assert_eq!(cfg.internal_bucket, "internal-bucket");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.dispatch_concurrency, 10);
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let err = parse_toml("this is [not valid toml =").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn validation_requires_internal_bucket() {
        let cfg = OrchConfig::default();
        let err = validate_config(&cfg).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("internal_bucket")));
                assert!(reasons.iter().any(|r| r.contains("done_bucket")));
            }
            _ => panic!("expected ValidationError"),
        }
    }

    #[test]
    fn validation_catches_bad_dispatch_concurrency() {
        let mut cfg = valid_config();
        cfg.dispatch_concurrency = 0;
        assert!(validate_config(&cfg).is_err());
        cfg.dispatch_concurrency = 1000;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn validation_catches_bad_lock_ttl() {
        let mut cfg = valid_config();
        cfg.lock_ttl_seconds = 0;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn validation_warns_on_large_lock_ttl() {
        let mut cfg = valid_config();
        cfg.lock_ttl_seconds = 48 * 3600;
        let warnings = validate_config(&cfg).unwrap();
        assert!(warnings.iter().any(|w| matches!(w, ConfigWarning::LargeLockTtl { .. })));
    }

    #[test]
    fn validation_ok_returns_warnings_for_missing_optionals() {
        let cfg = valid_config();
        let warnings = validate_config(&cfg).unwrap();
        assert!(warnings.len() >= 2);
    }

    #[test]
    fn env_override_sets_buckets() {
        // SAFETY-equivalent: test-only env var set/unset, single-threaded test.
        unsafe {
            std::env::set_var("ORCH_INTERNAL_BUCKET", "from-env");
        }
        let mut cfg = OrchConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.internal_bucket, "from-env");
        unsafe {
            std::env::remove_var("ORCH_INTERNAL_BUCKET");
        }
    }

    #[test]
    fn retry_policy_default_matches_spec() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.base_delay_ms, 500);
        assert_eq!(retry.max_delay_ms, 16_000);
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.jitter_fraction, 0.5);
    }
}
