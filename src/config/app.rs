//! Application configuration structures.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::database::DatabaseConfig;
use super::validation::{ConfigError, expand_env_vars};

/// Default migrations base directory.
pub const DEFAULT_MIGRATIONS_PATH: &str = "migrations";

fn default_migrations_path() -> PathBuf {
    PathBuf::from(DEFAULT_MIGRATIONS_PATH)
}

// =============================================================================
// Migrations Configuration
// =============================================================================

/// Migration runner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationsConfig {
    /// Base directory holding one subdirectory per engine (default: "migrations").
    #[serde(default = "default_migrations_path")]
    pub path: PathBuf,

    /// Apply pending migrations after connecting (default: false).
    #[serde(default)]
    pub run_on_startup: bool,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            path: default_migrations_path(),
            run_on_startup: false,
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Engine connection settings.
    pub database: DatabaseConfig,

    /// Migration settings.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// `${VAR}` and `${VAR:-default}` references are expanded before parsing.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// Only the primary section is load-bearing here; optional sections are
    /// checked when the store manager connects, where a bad optional section
    /// degrades to "engine absent" instead of failing startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.primary.validate()?;

        if self.migrations.path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "migrations.path must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_config_default() {
        let config = MigrationsConfig::default();
        assert_eq!(config.path, PathBuf::from("migrations"));
        assert!(!config.run_on_startup);
    }

    #[test]
    fn test_load_from_yaml() {
        let yaml = r#"
database:
  primary:
    host: localhost
    port: 5432
    user: wibu
    password: ${NONEXISTENT_POLYSTORE_PW_4321:-devpass}
    database: wibusystem
  cache:
    host: localhost
migrations:
  path: ./db/migrations
  run_on_startup: true
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.database.primary.password, "devpass");
        assert_eq!(config.database.primary.database, "wibusystem");
        assert!(config.database.cache.is_some());
        assert_eq!(config.migrations.path, PathBuf::from("./db/migrations"));
        assert!(config.migrations.run_on_startup);
    }

    #[test]
    fn test_load_rejects_invalid_primary() {
        let yaml = r#"
database:
  primary:
    host: ""
"#;
        let result = AppConfig::from_yaml(yaml);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("primary.host"));
    }

    #[test]
    fn test_load_keeps_invalid_optional_section() {
        let yaml = r#"
database:
  primary:
    host: localhost
  cache:
    host: ""
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert!(config.database.cache.unwrap().validate().is_err());
    }

    #[test]
    fn test_load_shipped_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/config.yaml");
        let config = AppConfig::load(path).unwrap();

        assert!(config.database.validate().is_ok());
        let timeseries = config.database.timeseries.unwrap();
        assert_eq!(timeseries.connection.kind, crate::config::RelationalKind::TimescaleDb);
        assert_eq!(timeseries.compression.segment_by, ["device_id"]);
        assert_eq!(
            timeseries.chunk_time_interval,
            std::time::Duration::from_secs(7 * 86400)
        );
        assert_eq!(config.migrations.path, PathBuf::from("migrations"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = AppConfig::load("/nonexistent/polystore.yaml");
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }
}
