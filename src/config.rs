//! Configuration module.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Engine settings (primary relational, cache, document, time-series)
//! - Migration settings (base directory, run-on-startup)

mod app;
mod database;
mod validation;

pub use app::{AppConfig, DEFAULT_MIGRATIONS_PATH, MigrationsConfig};
pub use database::{
    CacheConfig, CompressionConfig, DEFAULT_MONGO_PORT, DEFAULT_POSTGRES_PORT, DEFAULT_REDIS_PORT,
    DEFAULT_TIMESCALE_PORT, DatabaseConfig, DocumentConfig, PoolConfig, RelationalConfig,
    RelationalKind, RetentionConfig, SslMode, TimeSeriesConfig,
};
pub use validation::{ConfigError, expand_env_vars, is_valid_identifier, parse_duration};
