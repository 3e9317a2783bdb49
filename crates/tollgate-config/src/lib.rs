//! Configuration parsing and validation for tollgated
//!
//! Supports TOML configuration with:
//! - Versioned schema
//! - Service settings (socket, data directory, sweep cadence, throttling)
//! - Engine settings (retry bounds, usage regression handling, paging)
//! - Plan catalog seed entries
//! - Validation with clear error messages

mod policy;
mod schema;
mod validation;

pub use policy::*;
pub use schema::*;
pub use validation::*;

use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation failed: {errors:?}")]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("Unsupported config version: {0}")]
    UnsupportedVersion(u32),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Current supported config version
pub const CURRENT_CONFIG_VERSION: u32 = 1;

/// Load and validate configuration from a TOML file
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<Config> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from a TOML string
pub fn parse_config(content: &str) -> ConfigResult<Config> {
    let raw: RawConfig = toml::from_str(content)?;

    if raw.config_version != CURRENT_CONFIG_VERSION {
        return Err(ConfigError::UnsupportedVersion(raw.config_version));
    }

    let errors = validate_config(&raw);
    if !errors.is_empty() {
        return Err(ConfigError::ValidationFailed { errors });
    }

    Ok(Config::from_raw(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn parse_minimal_config() {
        let config = parse_config("config_version = 1").unwrap();
        assert!(config.plans.is_empty());
        assert_eq!(config.service.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.engine.usage_regression, UsageRegression::Reject);
    }

    #[test]
    fn parse_full_config() {
        let config = r#"
            config_version = 1

            [service]
            sweep_interval_seconds = 15
            request_timeout_ms = 2500
            requests_per_second = 10

            [engine]
            usage_regression = "clamp"
            max_page_limit = 100

            [[plans]]
            id = "day-pass"
            name = "1GB Day Pass"
            data_limit_mb = 1024
            time_limit_minutes = 1440
            price = 500

            [[plans]]
            id = "free-30"
            name = "Free 30 Min"
            time_limit_minutes = 30
        "#;

        let config = parse_config(config).unwrap();
        assert_eq!(config.service.sweep_interval, Duration::from_secs(15));
        assert_eq!(config.service.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.engine.usage_regression, UsageRegression::Clamp);
        assert_eq!(config.engine.max_page_limit, 100);
        assert_eq!(config.plans.len(), 2);
        assert_eq!(config.plans[1].data_limit_mb, None);
        assert!(config.plans[1].is_active);
    }

    #[test]
    fn reject_wrong_version() {
        let result = parse_config("config_version = 99");
        assert!(matches!(result, Err(ConfigError::UnsupportedVersion(99))));
    }

    #[test]
    fn reject_invalid_values() {
        let config = r#"
            config_version = 1

            [service]
            sweep_interval_seconds = 0

            [[plans]]
            id = ""
            name = "Nameless"
        "#;

        match parse_config(config) {
            Err(ConfigError::ValidationFailed { errors }) => assert_eq!(errors.len(), 2),
            other => panic!("expected validation failure, got {:?}", other),
        }
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "config_version = 1").unwrap();
        writeln!(file, "[[plans]]").unwrap();
        writeln!(file, "id = \"hour\"").unwrap();
        writeln!(file, "name = \"One Hour\"").unwrap();
        writeln!(file, "time_limit_minutes = 60").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.plans[0].plan_id.as_str(), "hour");
    }
}
