//! Store manager: lifecycle and lookup for every configured engine.
//!
//! The primary relational engine is mandatory; failing to validate or
//! connect it fails [`StoreManager::connect`] with nothing connected. Cache,
//! document and dedicated time-series engines are optional: a failure there
//! is logged, recorded in [`StoreManager::warnings`], and the engine stays
//! absent.

use std::path::Path;
use std::sync::Arc;

use crate::config::{AppConfig, ConfigError, DatabaseConfig};
use crate::migrate::MigrationManager;
use crate::storage::factory::{Primary, ProviderFactory};
use crate::storage::traits::{
    CacheDatabase, Database, DocumentDatabase, RelationalDatabase, TimeSeriesDatabase,
};
use crate::storage::types::EngineType;
use crate::storage::{Context, StorageError};

/// Owns every provider and the migration manager.
pub struct StoreManager {
    config: DatabaseConfig,
    factory: ProviderFactory,
    primary: Option<Primary>,
    cache: Option<Arc<dyn CacheDatabase>>,
    document: Option<Arc<dyn DocumentDatabase>>,
    time_series: Option<Arc<dyn TimeSeriesDatabase>>,
    warnings: Vec<String>,
    migrations: MigrationManager,
}

impl std::fmt::Debug for StoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreManager")
            .field("config", &self.config)
            .field("factory", &self.factory)
            .field("primary", &self.primary)
            .field("cache", &self.cache.as_ref().map(|db| db.engine_type()))
            .field("document", &self.document.as_ref().map(|db| db.engine_type()))
            .field("time_series", &self.time_series.as_ref().map(|db| db.engine_type()))
            .field("warnings", &self.warnings)
            .field("migrations", &self.migrations)
            .finish()
    }
}

/// Validate, build and connect one optional engine.
async fn connect_optional<T, B>(
    ctx: &Context,
    validation: Result<(), ConfigError>,
    build: B,
) -> Result<Arc<T>, StorageError>
where
    T: Database + ?Sized,
    B: FnOnce() -> Arc<T>,
{
    validation?;
    let provider = build();
    if let Err(e) = provider.connect(ctx).await {
        if let Err(close_err) = provider.close().await {
            tracing::debug!(error = %close_err, "Close after failed connect also failed");
        }
        return Err(e);
    }
    Ok(provider)
}

impl StoreManager {
    /// Create a manager with the default providers. Performs no I/O.
    pub fn new(config: DatabaseConfig) -> Self {
        Self::with_factory(config, ProviderFactory::default())
    }

    /// Create a manager whose providers come from `factory`.
    pub fn with_factory(config: DatabaseConfig, factory: ProviderFactory) -> Self {
        Self {
            config,
            factory,
            primary: None,
            cache: None,
            document: None,
            time_series: None,
            warnings: Vec::new(),
            migrations: MigrationManager::default(),
        }
    }

    /// Create a manager from application config, wiring the migrations path
    /// into the relational providers.
    pub fn from_app_config(config: &AppConfig) -> Self {
        let factory = ProviderFactory::default().migrations_path(&config.migrations.path);
        Self::with_factory(config.database.clone(), factory)
    }

    /// Connect the primary, then every configured optional engine.
    ///
    /// A no-op when already connected.
    pub async fn connect(&mut self, ctx: &Context) -> Result<(), StorageError> {
        if self.primary.is_some() {
            tracing::debug!("Store manager already connected");
            return Ok(());
        }
        self.warnings.clear();

        self.config.primary.validate()?;
        let primary = self.factory.build_primary(&self.config);
        if let Err(e) = primary.connect(ctx).await {
            if let Err(close_err) = primary.close().await {
                tracing::debug!(error = %close_err, "Close after failed connect also failed");
            }
            tracing::error!(engine = %primary.engine_type(), error = %e, "Primary database unavailable");
            return Err(e);
        }
        self.primary = Some(primary);

        if let Some(config) = self.config.cache.clone() {
            let factory = &self.factory;
            let result =
                connect_optional(ctx, config.validate(), || factory.build_cache(&config)).await;
            match result {
                Ok(provider) => self.cache = Some(provider),
                Err(e) => self.degrade(EngineType::Cache, e),
            }
        }

        if let Some(config) = self.config.document.clone() {
            let factory = &self.factory;
            let result =
                connect_optional(ctx, config.validate(), || factory.build_document(&config)).await;
            match result {
                Ok(provider) => self.document = Some(provider),
                Err(e) => self.degrade(EngineType::Document, e),
            }
        }

        if let Some(config) = self.config.timeseries.clone() {
            let factory = &self.factory;
            let result =
                connect_optional(ctx, config.validate(), || factory.build_time_series(&config))
                    .await;
            match result {
                Ok(provider) => self.time_series = Some(provider),
                Err(e) => self.degrade(EngineType::TimeSeries, e),
            }
        }

        tracing::info!(
            engines = ?self.connected_engines(),
            warnings = self.warnings.len(),
            "Store manager connected"
        );
        Ok(())
    }

    fn degrade(&mut self, engine: EngineType, error: StorageError) {
        tracing::warn!(engine = %engine, error = %error, "Optional database unavailable, continuing without it");
        self.warnings
            .push(format!("{engine} database unavailable: {error}"));
    }

    /// Close the migration manager, then every provider.
    ///
    /// Errors are collected rather than short-circuited. A second call is a
    /// no-op.
    pub async fn close(&mut self) -> Result<(), StorageError> {
        let mut errors = Vec::new();

        if let Err(e) = self.migrations.close().await {
            errors.push(e);
        }
        if let Some(provider) = self.time_series.take()
            && let Err(e) = provider.close().await
        {
            errors.push(StorageError::engine(EngineType::TimeSeries, e));
        }
        if let Some(provider) = self.document.take()
            && let Err(e) = provider.close().await
        {
            errors.push(StorageError::engine(EngineType::Document, e));
        }
        if let Some(provider) = self.cache.take()
            && let Err(e) = provider.close().await
        {
            errors.push(StorageError::engine(EngineType::Cache, e));
        }
        if let Some(primary) = self.primary.take() {
            if let Err(e) = primary.close().await {
                errors.push(StorageError::engine(primary.engine_type(), e));
            }
            tracing::info!("Store manager closed");
        }

        StorageError::from_many(errors)
    }

    /// Live check of every connected engine.
    ///
    /// Fails with one entry per unhealthy engine.
    pub async fn health(&self, ctx: &Context) -> Result<(), StorageError> {
        let Some(primary) = &self.primary else {
            return Err(StorageError::NotConnected(EngineType::Relational));
        };

        let mut errors = Vec::new();
        if let Err(e) = primary.health(ctx).await {
            errors.push(StorageError::engine(primary.engine_type(), e));
        }
        if let Some(provider) = &self.cache
            && let Err(e) = provider.health(ctx).await
        {
            errors.push(StorageError::engine(EngineType::Cache, e));
        }
        if let Some(provider) = &self.document
            && let Err(e) = provider.health(ctx).await
        {
            errors.push(StorageError::engine(EngineType::Document, e));
        }
        if let Some(provider) = &self.time_series
            && let Err(e) = provider.health(ctx).await
        {
            errors.push(StorageError::engine(EngineType::TimeSeries, e));
        }

        for error in &errors {
            tracing::warn!(error = %error, "Health check failed");
        }
        StorageError::from_many(errors)
    }

    /// Whether an engine of this family is available.
    ///
    /// Time-series is available through a dedicated provider or a
    /// time-series primary.
    pub fn has_database(&self, engine: EngineType) -> bool {
        match engine {
            EngineType::Relational => self.primary.is_some(),
            EngineType::Cache => self.cache.is_some(),
            EngineType::Document => self.document.is_some(),
            EngineType::TimeSeries => {
                self.time_series.is_some()
                    || self
                        .primary
                        .as_ref()
                        .is_some_and(|p| p.engine_type() == EngineType::TimeSeries)
            }
        }
    }

    /// Engines currently available, in order.
    pub fn connected_engines(&self) -> Vec<EngineType> {
        EngineType::ALL
            .into_iter()
            .filter(|engine| self.has_database(*engine))
            .collect()
    }

    /// Whether a dedicated (non-primary) time-series provider is connected.
    pub fn has_dedicated_time_series(&self) -> bool {
        self.time_series.is_some()
    }

    pub fn primary(&self) -> Option<Arc<dyn RelationalDatabase>> {
        self.primary.as_ref().map(Primary::relational)
    }

    /// The primary provider with its concrete family.
    pub fn primary_provider(&self) -> Option<&Primary> {
        self.primary.as_ref()
    }

    pub fn cache(&self) -> Option<Arc<dyn CacheDatabase>> {
        self.cache.clone()
    }

    pub fn document(&self) -> Option<Arc<dyn DocumentDatabase>> {
        self.document.clone()
    }

    /// The dedicated time-series provider, else the primary if it is one.
    pub fn time_series(&self) -> Option<Arc<dyn TimeSeriesDatabase>> {
        self.time_series
            .clone()
            .or_else(|| self.primary.as_ref().and_then(Primary::time_series))
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Why optional engines are absent, from the last `connect`.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn migrations(&self) -> &MigrationManager {
        &self.migrations
    }

    pub fn migrations_mut(&mut self) -> &mut MigrationManager {
        &mut self.migrations
    }

    /// Open migrators for the connected engines under `base_path`.
    pub async fn setup_migrations(
        &mut self,
        ctx: &Context,
        base_path: &Path,
    ) -> Result<(), StorageError> {
        let mut migrations = std::mem::take(&mut self.migrations);
        let result = migrations.setup_migrations(ctx, self, base_path).await;
        self.migrations = migrations;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fresh_manager_has_nothing() {
        let manager = StoreManager::new(DatabaseConfig::local_development());
        for engine in EngineType::ALL {
            assert!(!manager.has_database(engine));
        }
        assert!(manager.primary().is_none());
        assert!(manager.time_series().is_none());
        assert!(manager.warnings().is_empty());

        let err = manager.health(&Context::background()).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::NotConnected(EngineType::Relational)
        ));
    }

    #[tokio::test]
    async fn test_close_without_connect_is_noop() {
        let mut manager = StoreManager::new(DatabaseConfig::default());
        manager.close().await.unwrap();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_migrations_requires_primary() {
        let mut manager = StoreManager::new(DatabaseConfig::default());
        let err = manager
            .setup_migrations(&Context::background(), Path::new("migrations"))
            .await
            .unwrap_err();
        assert!(err.is_not_connected());
    }
}
