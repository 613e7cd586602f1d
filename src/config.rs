//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TollgateError};

/// Prefix for environment overrides, e.g. `TOLLGATE_RATE_LIMIT__DOMAIN`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the policy engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Authorization configuration
    #[serde(default)]
    pub auth: AuthSettings,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Domain prefixed to every counter key and header name
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Place unstaged rate limit actions before authorization
    #[serde(default)]
    pub rate_limit_before_auth: bool,

    /// Emit `X-RateLimit-*` headers
    #[serde(default)]
    pub enable_x_ratelimit_headers: bool,

    /// Reject requests when the counter backend fails (fail-closed)
    #[serde(default)]
    pub deny_on_backend_error: bool,

    /// Request header carrying the authenticated user id in the regular stage
    #[serde(default = "default_user_id_header")]
    pub user_id_header: String,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            rate_limit_before_auth: false,
            enable_x_ratelimit_headers: false,
            deny_on_backend_error: false,
            user_id_header: default_user_id_header(),
        }
    }
}

fn default_domain() -> String {
    "gateway".to_string()
}

fn default_user_id_header() -> String {
    "x-user-id".to_string()
}

/// Authorization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// Timeout applied to each individual auth check
    #[serde(default = "default_check_timeout")]
    pub check_timeout_ms: u64,

    /// Key under which the user id is published in auth metadata
    #[serde(default = "default_user_id_metadata_key")]
    pub user_id_metadata_key: String,

    /// Evaluate independent checks concurrently
    #[serde(default = "default_concurrent_checks")]
    pub concurrent_checks: bool,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            check_timeout_ms: default_check_timeout(),
            user_id_metadata_key: default_user_id_metadata_key(),
            concurrent_checks: default_concurrent_checks(),
        }
    }
}

impl AuthSettings {
    /// The per-check timeout as a `Duration`.
    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}

fn default_check_timeout() -> u64 {
    5000
}

fn default_user_id_metadata_key() -> String {
    "userId".to_string()
}

fn default_concurrent_checks() -> bool {
    true
}

impl EngineConfig {
    /// Load configuration from a file path, layered with environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TollgateError::Config(format!(
                "configuration file {} does not exist",
                path.display()
            )));
        }

        config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Load configuration from environment overrides only.
    pub fn from_env() -> Result<Self> {
        config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.rate_limit.domain, "gateway");
        assert_eq!(config.rate_limit.user_id_header, "x-user-id");
        assert!(!config.rate_limit.rate_limit_before_auth);
        assert_eq!(config.auth.check_timeout(), Duration::from_secs(5));
        assert!(config.auth.concurrent_checks);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
rate_limit:
  rate_limit_before_auth: true
  enable_x_ratelimit_headers: true
auth:
  check_timeout_ms: 250
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert!(config.rate_limit.rate_limit_before_auth);
        assert!(config.rate_limit.enable_x_ratelimit_headers);
        assert_eq!(config.rate_limit.domain, "gateway");
        assert_eq!(config.auth.check_timeout(), Duration::from_millis(250));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = EngineConfig::from_file("/nonexistent/tollgate.yaml").unwrap_err();
        assert!(matches!(err, TollgateError::Config(_)));
    }
}
