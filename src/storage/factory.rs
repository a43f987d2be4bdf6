//! Provider factory.
//!
//! A constructor table with one entry per engine family. The store manager
//! asks the factory for providers; tests override entries to inject
//! in-memory providers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{
    CacheConfig, DatabaseConfig, DocumentConfig, RelationalConfig, RelationalKind,
    TimeSeriesConfig,
};
use crate::migrate::MigrationTarget;
use crate::storage::db::{MongoProvider, PostgresProvider, RedisProvider, TimescaleProvider};
use crate::storage::traits::{
    CacheDatabase, DocumentDatabase, RelationalDatabase, TimeSeriesDatabase,
};
use crate::storage::types::EngineType;
use crate::storage::{Context, StorageError};

/// Builds a relational provider, optionally wired to its migrations.
pub type RelationalConstructor = Arc<
    dyn Fn(&RelationalConfig, Option<MigrationTarget>) -> Arc<dyn RelationalDatabase> + Send + Sync,
>;

/// Builds a time-series provider, optionally wired to its migrations.
pub type TimeSeriesConstructor = Arc<
    dyn Fn(&TimeSeriesConfig, Option<MigrationTarget>) -> Arc<dyn TimeSeriesDatabase> + Send + Sync,
>;

pub type CacheConstructor = Arc<dyn Fn(&CacheConfig) -> Arc<dyn CacheDatabase> + Send + Sync>;

pub type DocumentConstructor =
    Arc<dyn Fn(&DocumentConfig) -> Arc<dyn DocumentDatabase> + Send + Sync>;

/// The primary provider: plain relational, or time-series on top of it.
#[derive(Clone)]
pub enum Primary {
    Relational(Arc<dyn RelationalDatabase>),
    TimeSeries(Arc<dyn TimeSeriesDatabase>),
}

impl std::fmt::Debug for Primary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Primary").field(&self.engine_type()).finish()
    }
}

impl Primary {
    pub fn engine_type(&self) -> EngineType {
        match self {
            Self::Relational(db) => db.engine_type(),
            Self::TimeSeries(db) => db.engine_type(),
        }
    }

    pub async fn connect(&self, ctx: &Context) -> Result<(), StorageError> {
        match self {
            Self::Relational(db) => db.connect(ctx).await,
            Self::TimeSeries(db) => db.connect(ctx).await,
        }
    }

    pub async fn close(&self) -> Result<(), StorageError> {
        match self {
            Self::Relational(db) => db.close().await,
            Self::TimeSeries(db) => db.close().await,
        }
    }

    pub async fn health(&self, ctx: &Context) -> Result<(), StorageError> {
        match self {
            Self::Relational(db) => db.health(ctx).await,
            Self::TimeSeries(db) => db.health(ctx).await,
        }
    }

    /// Relational contract view.
    pub fn relational(&self) -> Arc<dyn RelationalDatabase> {
        match self {
            Self::Relational(db) => db.clone(),
            Self::TimeSeries(db) => db.clone().into_relational(),
        }
    }

    /// The time-series provider, if the primary is one.
    pub fn time_series(&self) -> Option<Arc<dyn TimeSeriesDatabase>> {
        match self {
            Self::Relational(_) => None,
            Self::TimeSeries(db) => Some(db.clone()),
        }
    }
}

/// Constructor table keyed on engine family.
#[derive(Clone)]
pub struct ProviderFactory {
    relational: RelationalConstructor,
    time_series: TimeSeriesConstructor,
    cache: CacheConstructor,
    document: DocumentConstructor,
    migrations_path: Option<PathBuf>,
}

impl std::fmt::Debug for ProviderFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderFactory")
            .field("migrations_path", &self.migrations_path)
            .finish_non_exhaustive()
    }
}

fn postgres_provider(
    config: &RelationalConfig,
    migrations: Option<MigrationTarget>,
) -> Arc<dyn RelationalDatabase> {
    let provider = PostgresProvider::new(config.clone());
    match migrations {
        Some(target) => Arc::new(provider.with_migrations(target)),
        None => Arc::new(provider),
    }
}

fn timescale_provider(
    config: &TimeSeriesConfig,
    migrations: Option<MigrationTarget>,
) -> Arc<dyn TimeSeriesDatabase> {
    let provider = TimescaleProvider::new(config.clone());
    match migrations {
        Some(target) => Arc::new(provider.with_migrations(target)),
        None => Arc::new(provider),
    }
}

fn redis_provider(config: &CacheConfig) -> Arc<dyn CacheDatabase> {
    Arc::new(RedisProvider::new(config.clone()))
}

fn mongo_provider(config: &DocumentConfig) -> Arc<dyn DocumentDatabase> {
    Arc::new(MongoProvider::new(config.clone()))
}

impl Default for ProviderFactory {
    fn default() -> Self {
        Self {
            relational: Arc::new(postgres_provider),
            time_series: Arc::new(timescale_provider),
            cache: Arc::new(redis_provider),
            document: Arc::new(mongo_provider),
            migrations_path: None,
        }
    }
}

impl ProviderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Base directory providers use for their own `migrate` calls.
    pub fn migrations_path(mut self, path: impl AsRef<Path>) -> Self {
        self.migrations_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Override the relational constructor.
    pub fn relational<F>(mut self, constructor: F) -> Self
    where
        F: Fn(&RelationalConfig, Option<MigrationTarget>) -> Arc<dyn RelationalDatabase>
            + Send
            + Sync
            + 'static,
    {
        self.relational = Arc::new(constructor);
        self
    }

    /// Override the time-series constructor.
    pub fn time_series<F>(mut self, constructor: F) -> Self
    where
        F: Fn(&TimeSeriesConfig, Option<MigrationTarget>) -> Arc<dyn TimeSeriesDatabase>
            + Send
            + Sync
            + 'static,
    {
        self.time_series = Arc::new(constructor);
        self
    }

    /// Override the cache constructor.
    pub fn cache<F>(mut self, constructor: F) -> Self
    where
        F: Fn(&CacheConfig) -> Arc<dyn CacheDatabase> + Send + Sync + 'static,
    {
        self.cache = Arc::new(constructor);
        self
    }

    /// Override the document constructor.
    pub fn document<F>(mut self, constructor: F) -> Self
    where
        F: Fn(&DocumentConfig) -> Arc<dyn DocumentDatabase> + Send + Sync + 'static,
    {
        self.document = Arc::new(constructor);
        self
    }

    fn target(&self, engine: EngineType) -> Option<MigrationTarget> {
        self.migrations_path
            .as_deref()
            .map(|base| MigrationTarget::for_engine(base, engine))
    }

    /// Build the primary provider, dispatching on its relational kind.
    ///
    /// A `timescaledb` primary takes its administrative defaults from the
    /// `timeseries` section when one is configured and valid.
    pub fn build_primary(&self, config: &DatabaseConfig) -> Primary {
        let migrations = self.target(EngineType::Relational);
        match config.primary.kind {
            RelationalKind::Postgres => {
                Primary::Relational((self.relational)(&config.primary, migrations))
            }
            RelationalKind::TimescaleDb => {
                let timeseries = primary_timeseries_config(config);
                Primary::TimeSeries((self.time_series)(&timeseries, migrations))
            }
        }
    }

    /// Build a dedicated time-series provider.
    pub fn build_time_series(&self, config: &TimeSeriesConfig) -> Arc<dyn TimeSeriesDatabase> {
        (self.time_series)(config, self.target(EngineType::TimeSeries))
    }

    pub fn build_cache(&self, config: &CacheConfig) -> Arc<dyn CacheDatabase> {
        (self.cache)(config)
    }

    pub fn build_document(&self, config: &DocumentConfig) -> Arc<dyn DocumentDatabase> {
        (self.document)(config)
    }
}

/// Time-series settings for a `timescaledb` primary.
///
/// The optional `timeseries` section must not fail the primary, so an
/// invalid one is ignored in favour of the built-in defaults.
fn primary_timeseries_config(config: &DatabaseConfig) -> TimeSeriesConfig {
    let defaults = TimeSeriesConfig {
        connection: config.primary.clone(),
        ..TimeSeriesConfig::default()
    };
    let Some(section) = &config.timeseries else {
        return defaults;
    };

    let merged = TimeSeriesConfig {
        connection: config.primary.clone(),
        ..section.clone()
    };
    match merged.validate() {
        Ok(()) => merged,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Ignoring invalid timeseries defaults for the timescaledb primary"
            );
            defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_dispatches_on_kind() {
        let factory = ProviderFactory::new();

        let primary = factory.build_primary(&DatabaseConfig::default());
        assert_eq!(primary.engine_type(), EngineType::Relational);
        assert!(primary.time_series().is_none());

        let mut config = DatabaseConfig::default();
        config.primary.kind = RelationalKind::TimescaleDb;
        let primary = factory.build_primary(&config);
        assert_eq!(primary.engine_type(), EngineType::TimeSeries);
        assert!(primary.time_series().is_some());
        assert_eq!(
            primary.relational().relational_config().port,
            config.primary.port
        );
    }

    #[test]
    fn test_timescale_primary_takes_timeseries_defaults() {
        let mut config = DatabaseConfig::local_development();
        config.primary.kind = RelationalKind::TimescaleDb;
        if let Some(ts) = config.timeseries.as_mut() {
            ts.chunk_time_interval = std::time::Duration::from_secs(3600);
        }

        let primary = ProviderFactory::new().build_primary(&config);
        let ts = primary.time_series().unwrap();
        assert_eq!(
            ts.timeseries_config().chunk_time_interval,
            std::time::Duration::from_secs(3600)
        );
        assert_eq!(ts.timeseries_config().connection, config.primary);
    }

    #[test]
    fn test_timescale_primary_ignores_invalid_timeseries_section() {
        let mut config = DatabaseConfig::local_development();
        config.primary.kind = RelationalKind::TimescaleDb;
        if let Some(ts) = config.timeseries.as_mut() {
            ts.chunk_time_interval = std::time::Duration::ZERO;
            ts.compression.segment_by = vec!["bad column".to_string()];
        }

        let primary = ProviderFactory::new().build_primary(&config);
        let ts_config = primary.time_series().unwrap().timeseries_config().clone();
        assert!(ts_config.validate().is_ok());
        assert_eq!(
            ts_config.chunk_time_interval,
            TimeSeriesConfig::default().chunk_time_interval
        );
        assert_eq!(ts_config.connection, config.primary);
    }
}
