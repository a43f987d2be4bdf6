//! Migration driver contract.
//!
//! A driver owns one dedicated connection to an engine and knows how to
//! store the `(version, dirty)` pair and run migration bodies there. The
//! [`Migrator`](super::Migrator) drives it; drivers hold no migration logic.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::storage::types::EngineType;
use crate::storage::{Context, StorageError};

/// Version table of the primary relational engine.
pub const DEFAULT_MIGRATIONS_TABLE: &str = "schema_migrations";

/// Version table of a dedicated time-series engine.
pub const TIMESCALE_MIGRATIONS_TABLE: &str = "timescale_schema_migrations";

/// Tracked migration state: `clean@V` or `dirty@V`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MigrationVersion {
    /// Last applied version; `None` before the first migration.
    pub version: Option<u64>,
    /// A migration started at `version` and never finished.
    pub dirty: bool,
}

impl MigrationVersion {
    pub fn clean(version: Option<u64>) -> Self {
        Self {
            version,
            dirty: false,
        }
    }

    pub fn dirty(version: u64) -> Self {
        Self {
            version: Some(version),
            dirty: true,
        }
    }
}

impl std::fmt::Display for MigrationVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.version {
            Some(v) => write!(f, "{v}")?,
            None => write!(f, "nil")?,
        }
        if self.dirty {
            write!(f, " (dirty)")?;
        }
        Ok(())
    }
}

/// Per-engine driver settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSettings {
    /// Version table name.
    pub table_name: String,
    /// How long to wait for the migration lock (default: 15s).
    pub lock_timeout: Duration,
    /// Server-side statement timeout for migration bodies.
    pub statement_timeout: Option<Duration>,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_MIGRATIONS_TABLE.to_string(),
            lock_timeout: Duration::from_secs(15),
            statement_timeout: None,
        }
    }
}

impl MigrationSettings {
    /// Settings for the version table `engine` owns.
    pub fn for_engine(engine: EngineType) -> Self {
        let table_name = match engine {
            EngineType::TimeSeries => TIMESCALE_MIGRATIONS_TABLE,
            _ => DEFAULT_MIGRATIONS_TABLE,
        };
        Self {
            table_name: table_name.to_string(),
            ..Self::default()
        }
    }
}

/// Where a provider finds its migration files and how it tracks them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationTarget {
    pub source_dir: PathBuf,
    pub settings: MigrationSettings,
}

impl MigrationTarget {
    /// Conventional layout under `base`: `postgres/` with
    /// `schema_migrations` for the primary, `timescaledb/` with
    /// `timescale_schema_migrations` for a dedicated time-series engine.
    pub fn for_engine(base: &Path, engine: EngineType) -> Self {
        let subdir = match engine {
            EngineType::TimeSeries => "timescaledb",
            _ => "postgres",
        };
        Self {
            source_dir: base.join(subdir),
            settings: MigrationSettings::for_engine(engine),
        }
    }
}

/// Storage of migration state on one engine.
#[async_trait]
pub trait MigrationDriver: Send {
    /// Create the version table if it does not exist.
    async fn ensure_version_table(&mut self, ctx: &Context) -> Result<(), StorageError>;

    /// Take the engine-wide migration lock, waiting up to the lock timeout.
    async fn lock(&mut self, ctx: &Context) -> Result<(), StorageError>;

    /// Release the migration lock.
    async fn unlock(&mut self, ctx: &Context) -> Result<(), StorageError>;

    async fn read_version(&mut self, ctx: &Context) -> Result<MigrationVersion, StorageError>;

    /// Replace the stored state atomically.
    async fn write_version(
        &mut self,
        ctx: &Context,
        version: MigrationVersion,
    ) -> Result<(), StorageError>;

    /// Run one migration body, which may hold several statements.
    async fn execute(&mut self, ctx: &Context, body: &str) -> Result<(), StorageError>;

    /// Release the dedicated connection.
    async fn close(self: Box<Self>) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets_per_engine() {
        let base = Path::new("/srv/migrations");

        let primary = MigrationTarget::for_engine(base, EngineType::Relational);
        assert_eq!(primary.source_dir, base.join("postgres"));
        assert_eq!(primary.settings.table_name, "schema_migrations");

        let timeseries = MigrationTarget::for_engine(base, EngineType::TimeSeries);
        assert_eq!(timeseries.source_dir, base.join("timescaledb"));
        assert_eq!(timeseries.settings.table_name, "timescale_schema_migrations");
    }

    #[test]
    fn test_version_display() {
        assert_eq!(MigrationVersion::clean(None).to_string(), "nil");
        assert_eq!(MigrationVersion::clean(Some(3)).to_string(), "3");
        assert_eq!(MigrationVersion::dirty(4).to_string(), "4 (dirty)");
    }
}
