// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the capture control
//! plane.
//!
//! This crate provides [`AppConfig`] — the top-level runtime settings —
//! together with helpers for loading from an optional TOML file, overlaying
//! environment variables on top, and producing advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
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
    /// A tier's rate-limit window is unusually large.
    LargeRateLimitWindow {
        /// Tier name.
        tier: String,
        /// Window value in seconds.
        secs: u64,
    },
    /// Gateway mode is enabled but the proxy secret looks weak (short).
    WeakGatewaySecret {
        /// Length of the configured secret.
        len: usize,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            Self::LargeRateLimitWindow { tier, secs } => {
                write!(f, "tier '{tier}' has an unusually large rate-limit window ({secs}s)")
            }
            Self::WeakGatewaySecret { len } => {
                write!(f, "gateway proxy secret is only {len} bytes long")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Per-tier credit budget and rate-limit window (§4.3, §4.4).
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct TierLimits {
    /// Monthly credit budget.
    pub monthly_credits: u64,
    /// Requests allowed within `rate_limit_window_secs`.
    pub rate_limit_points: u64,
    /// Sliding window length in seconds.
    pub rate_limit_window_secs: u64,
}

/// Object-storage connection settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct StorageConfig {
    /// S3-compatible endpoint URL (e.g. MinIO in development).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Bucket name artifacts are written to.
    pub bucket: String,
    /// AWS region (required by the SDK even for non-AWS endpoints).
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Trusted-gateway auth source settings (§4.4 step 1a).
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Default)]
pub struct GatewayConfig {
    /// Whether the trusted-gateway auth source is accepted at all.
    #[serde(default)]
    pub enabled: bool,
    /// Shared secret the gateway must present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_secret: Option<String>,
}

/// Top-level runtime configuration for the capture control plane.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct AppConfig {
    /// Address the HTTP server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Postgres connection string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    /// Redis connection string for the cache / rate-limit store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    /// Object store settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,
    /// Shared secret used to verify inbound billing webhooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_signing_secret: Option<String>,
    /// Trusted-gateway auth source settings.
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Days a completed job's artifact is retained before the sweep deletes it.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Per-tier credit/rate-limit table, keyed by tier name (upper-case).
    #[serde(default = "default_tiers")]
    pub tiers: BTreeMap<String, TierLimits>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_retention_days() -> u32 {
    1
}

fn default_tiers() -> BTreeMap<String, TierLimits> {
    BTreeMap::from([
        (
            "FREE".to_string(),
            TierLimits {
                monthly_credits: 250,
                rate_limit_points: 100,
                rate_limit_window_secs: 3600,
            },
        ),
        (
            "PRO".to_string(),
            TierLimits {
                monthly_credits: 10_000,
                rate_limit_points: 5_000,
                rate_limit_window_secs: 3600,
            },
        ),
        (
            "BUSINESS".to_string(),
            TierLimits {
                monthly_credits: 100_000,
                rate_limit_points: 25_000,
                rate_limit_window_secs: 3600,
            },
        ),
        (
            "ENTERPRISE".to_string(),
            TierLimits {
                monthly_credits: 1_000_000,
                rate_limit_points: 100_000,
                rate_limit_window_secs: 3600,
            },
        ),
    ])
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            log_level: Some("info".into()),
            database_url: None,
            redis_url: None,
            storage: None,
            webhook_signing_secret: None,
            gateway: GatewayConfig::default(),
            retention_days: default_retention_days(),
            tiers: default_tiers(),
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Rate-limit windows above this are almost certainly a misconfiguration.
const LARGE_WINDOW_THRESHOLD_SECS: u64 = 86_400;

/// Gateway secrets shorter than this are flagged as weak.
const WEAK_SECRET_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load an [`AppConfig`] from an optional TOML file path, then apply
/// environment variable overrides on top.
///
/// * If `path` is `Some`, reads and parses the file as the base layer.
/// * If `path` is `None`, the base layer is [`AppConfig::default()`].
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => AppConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into an [`AppConfig`].
pub fn parse_toml(content: &str) -> Result<AppConfig, ConfigError> {
    toml::from_str::<AppConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides.
///
/// Recognised variables: `CAP_BIND_ADDR`, `CAP_LOG_LEVEL`,
/// `CAP_DATABASE_URL`, `CAP_REDIS_URL`, `CAP_S3_BUCKET`, `CAP_S3_ENDPOINT`,
/// `CAP_S3_REGION`, `CAP_WEBHOOK_SECRET`, `CAP_GATEWAY_ENABLED`,
/// `CAP_GATEWAY_PROXY_SECRET`, `CAP_RETENTION_DAYS`.
pub fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(val) = std::env::var("CAP_BIND_ADDR") {
        config.bind_addr = val;
    }
    if let Ok(val) = std::env::var("CAP_LOG_LEVEL") {
        config.log_level = Some(val);
    }
    if let Ok(val) = std::env::var("CAP_DATABASE_URL") {
        config.database_url = Some(val);
    }
    if let Ok(val) = std::env::var("CAP_REDIS_URL") {
        config.redis_url = Some(val);
    }
    if let Ok(bucket) = std::env::var("CAP_S3_BUCKET") {
        let mut storage = config.storage.clone().unwrap_or(StorageConfig {
            endpoint: None,
            bucket: bucket.clone(),
            region: default_region(),
        });
        storage.bucket = bucket;
        if let Ok(endpoint) = std::env::var("CAP_S3_ENDPOINT") {
            storage.endpoint = Some(endpoint);
        }
        if let Ok(region) = std::env::var("CAP_S3_REGION") {
            storage.region = region;
        }
        config.storage = Some(storage);
    }
    if let Ok(val) = std::env::var("CAP_WEBHOOK_SECRET") {
        config.webhook_signing_secret = Some(val);
    }
    if let Ok(val) = std::env::var("CAP_GATEWAY_ENABLED") {
        config.gateway.enabled = val == "1" || val.eq_ignore_ascii_case("true");
    }
    if let Ok(val) = std::env::var("CAP_GATEWAY_PROXY_SECRET") {
        config.gateway.proxy_secret = Some(val);
    }
    if let Ok(val) = std::env::var("CAP_RETENTION_DAYS")
        && let Ok(days) = val.parse::<u32>()
    {
        config.retention_days = days;
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (unknown log level, empty tier table, zero-length rate-limit
/// window, gateway enabled with no secret) are returned as a
/// [`ConfigError::ValidationError`]; soft issues come back as warnings.
pub fn validate_config(config: &AppConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if let Some(ref level) = config.log_level
        && !VALID_LOG_LEVELS.contains(&level.as_str())
    {
        errors.push(format!("invalid log_level '{level}'"));
    }

    if config.tiers.is_empty() {
        errors.push("at least one tier must be configured".into());
    }

    for (name, limits) in &config.tiers {
        if limits.rate_limit_window_secs == 0 {
            errors.push(format!("tier '{name}': rate_limit_window_secs must be > 0"));
        } else if limits.rate_limit_window_secs > LARGE_WINDOW_THRESHOLD_SECS {
            warnings.push(ConfigWarning::LargeRateLimitWindow {
                tier: name.clone(),
                secs: limits.rate_limit_window_secs,
            });
        }
        if limits.rate_limit_points == 0 {
            errors.push(format!("tier '{name}': rate_limit_points must be > 0"));
        }
    }

    if config.gateway.enabled {
        match &config.gateway.proxy_secret {
            None => errors.push("gateway.enabled is true but no proxy_secret is set".into()),
            Some(secret) if secret.len() < WEAK_SECRET_LEN => {
                warnings.push(ConfigWarning::WeakGatewaySecret { len: secret.len() });
            }
            Some(_) => {}
        }
    }

    if config.database_url.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "database_url".into(),
            hint: "falling back to an in-process sqlite file is not supported in production".into(),
        });
    }
    if config.webhook_signing_secret.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "webhook_signing_secret".into(),
            hint: "the subscription reconciler endpoint will reject all events".into(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_has_sensible_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.log_level.as_deref(), Some("info"));
        assert_eq!(cfg.tiers.len(), 4);
        assert_eq!(cfg.retention_days, 1);
        assert!(!cfg.gateway.enabled);
    }

    #[test]
    fn default_config_validates_with_warnings() {
        let cfg = AppConfig::default();
        let warnings = validate_config(&cfg).expect("default config should be valid");
        assert!(warnings.iter().any(
            |w| matches!(w, ConfigWarning::MissingOptionalField { field, .. } if field == "database_url")
        ));
    }

    #[test]
    fn parse_valid_toml_string() {
        let toml_str = r#"
            bind_addr = "127.0.0.1:9000"
            log_level = "debug"
            retention_days = 7

            [tiers.FREE]
            monthly_credits = 250
            rate_limit_points = 100
            rate_limit_window_secs = 3600
        "#;
        let cfg = parse_toml(toml_str).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.retention_days, 7);
        assert_eq!(cfg.tiers.len(), 1);
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let bad = "this is [not valid toml =";
        let err = parse_toml(bad).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn validation_catches_invalid_log_level() {
        let cfg = AppConfig {
            log_level: Some("verbose".into()),
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_catches_empty_tier_table() {
        let cfg = AppConfig {
            tiers: BTreeMap::new(),
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("at least one tier")));
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn validation_catches_zero_rate_limit_window() {
        let mut cfg = AppConfig::default();
        cfg.tiers.insert(
            "FREE".into(),
            TierLimits {
                monthly_credits: 250,
                rate_limit_points: 100,
                rate_limit_window_secs: 0,
            },
        );
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_catches_gateway_enabled_without_secret() {
        let mut cfg = AppConfig::default();
        cfg.gateway.enabled = true;
        let err = validate_config(&cfg).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("proxy_secret")));
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn validation_warns_on_weak_gateway_secret() {
        let mut cfg = AppConfig::default();
        cfg.gateway.enabled = true;
        cfg.gateway.proxy_secret = Some("short".into());
        let warnings = validate_config(&cfg).unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::WeakGatewaySecret { .. })));
    }

    #[test]
    fn validation_accepts_strong_gateway_secret_without_warning() {
        let mut cfg = AppConfig::default();
        cfg.gateway.enabled = true;
        cfg.gateway.proxy_secret = Some("a".repeat(32));
        let warnings = validate_config(&cfg).unwrap();
        assert!(!warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::WeakGatewaySecret { .. })));
    }

    #[test]
    fn large_rate_limit_window_produces_warning() {
        let mut cfg = AppConfig::default();
        cfg.database_url = Some("postgres://x".into());
        cfg.webhook_signing_secret = Some("secret".into());
        cfg.tiers.insert(
            "FREE".into(),
            TierLimits {
                monthly_credits: 250,
                rate_limit_points: 100,
                rate_limit_window_secs: 172_800,
            },
        );
        let warnings = validate_config(&cfg).unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::LargeRateLimitWindow { .. })));
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "bind_addr = \"0.0.0.0:7000\"\nlog_level = \"warn\"").unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:7000");
        assert_eq!(cfg.log_level.as_deref(), Some("warn"));
    }

    #[test]
    fn load_missing_file_gives_file_not_found() {
        let err = load_config(Some(Path::new("/nonexistent/capture.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn load_none_returns_default() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.log_level.as_deref(), Some("info"));
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = AppConfig::default();
        let serialized = toml::to_string(&cfg).unwrap();
        let deserialized: AppConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(cfg, deserialized);
    }

    #[test]
    fn config_warning_display() {
        let w = ConfigWarning::MissingOptionalField {
            field: "f".into(),
            hint: "h".into(),
        };
        assert!(w.to_string().contains('f'));

        let w = ConfigWarning::LargeRateLimitWindow {
            tier: "FREE".into(),
            secs: 9999,
        };
        assert!(w.to_string().contains("9999"));

        let w = ConfigWarning::WeakGatewaySecret { len: 5 };
        assert!(w.to_string().contains('5'));
    }

    #[test]
    fn config_error_display() {
        let e = ConfigError::FileNotFound {
            path: "/foo".into(),
        };
        assert!(e.to_string().contains("/foo"));
    }
}
