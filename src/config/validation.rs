//! Configuration validation utilities.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }
}

/// Parse duration string using humantime.
///
/// Supports various formats: `30s`, `1m`, `5m30s`, `1h`, `2h30m`, `1d`, `100ms`, etc.
///
/// # Examples
///
/// ```
/// use polystore::config::parse_duration;
///
/// assert_eq!(parse_duration("30s").unwrap().as_secs(), 30);
/// assert_eq!(parse_duration("2h").unwrap().as_secs(), 7200);
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration string is empty".to_string());
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Expand environment variables in a string.
/// Supports ${VAR} and ${VAR:-default} syntax.
pub fn expand_env_vars(input: &str) -> String {
    static ENV_VAR_REGEX: OnceLock<Regex> = OnceLock::new();

    let regex = ENV_VAR_REGEX.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("failed to compile env var regex")
    });

    regex
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        })
        .into_owned()
}

/// Check a SQL identifier against the allow-list.
///
/// Accepts a plain identifier (`[A-Za-z_][A-Za-z0-9_]*`) or a
/// schema-qualified one (`schema.table`). Anything interpolated into
/// administrative SQL must pass this check first.
pub fn is_valid_identifier(ident: &str) -> bool {
    static IDENT_REGEX: OnceLock<Regex> = OnceLock::new();

    let regex = IDENT_REGEX.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
            .expect("failed to compile identifier regex")
    });

    ident.len() <= 127 && regex.is_match(ident)
}

/// Require a non-empty string field.
pub(crate) fn require_non_empty(section: &str, field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::invalid(format!("{section}.{field} must not be empty")));
    }
    Ok(())
}

/// Require a non-zero port.
pub(crate) fn require_port(section: &str, port: u16) -> Result<(), ConfigError> {
    if port == 0 {
        return Err(ConfigError::invalid(format!("{section}.port must be non-zero")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_valid() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(7 * 86400));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("30").is_err());
    }

    #[test]
    fn test_expand_env_vars_with_default() {
        let result = expand_env_vars("password: ${NONEXISTENT_PG_PASSWORD_98765:-postgres}");
        assert_eq!(result, "password: postgres");
    }

    #[test]
    fn test_expand_env_vars_from_env() {
        // SAFETY: test-specific variable, not read by any other test.
        unsafe {
            std::env::set_var("POLYSTORE_TEST_EXPAND", "secret_value");
        }
        let result = expand_env_vars("password: ${POLYSTORE_TEST_EXPAND}");
        assert_eq!(result, "password: secret_value");
        // SAFETY: cleanup of the same test-specific variable.
        unsafe {
            std::env::remove_var("POLYSTORE_TEST_EXPAND");
        }
    }

    #[test]
    fn test_identifier_allow_list() {
        assert!(is_valid_identifier("sensor_data"));
        assert!(is_valid_identifier("_ts"));
        assert!(is_valid_identifier("metrics.sensor_data"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("1table"));
        assert!(!is_valid_identifier("sensor data"));
        assert!(!is_valid_identifier("t; DROP TABLE users"));
        assert!(!is_valid_identifier("a.b.c"));
        assert!(!is_valid_identifier("\"quoted\""));
    }
}
