//! Migration manager: one migrator per engine that owns a schema.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::migrate::{MigrationTarget, Migrator, allow_no_change};
use crate::storage::types::EngineType;
use crate::storage::{Context, StorageError, StoreManager};

/// Migration state of one engine as reported by [`MigrationManager::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub version: Option<u64>,
    pub dirty: bool,
    /// Set when the state could not be read.
    pub error: Option<String>,
}

/// Owns the migrators of every engine that carries schema migrations.
///
/// The primary relational engine migrates from `<base>/postgres`; a
/// dedicated time-series engine migrates from `<base>/timescaledb`.
#[derive(Debug, Default)]
pub struct MigrationManager {
    migrators: BTreeMap<EngineType, Migrator>,
}

impl MigrationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a migrator for each migratable engine connected in `store`.
    ///
    /// Replaces any migrators set up earlier. On failure nothing is kept.
    pub async fn setup_migrations(
        &mut self,
        ctx: &Context,
        store: &StoreManager,
        base_path: &Path,
    ) -> Result<(), StorageError> {
        self.close().await?;

        if store.primary().is_none() {
            return Err(StorageError::NotConnected(EngineType::Relational));
        }

        let mut engines = vec![(EngineType::Relational, &store.config().primary)];
        if store.has_dedicated_time_series()
            && let Some(timeseries) = &store.config().timeseries
        {
            engines.push((EngineType::TimeSeries, &timeseries.connection));
        }

        for (engine, config) in engines {
            let target = MigrationTarget::for_engine(base_path, engine);
            match Migrator::open_postgres(ctx, engine, config, &target).await {
                Ok(migrator) => {
                    tracing::info!(
                        engine = %engine,
                        source = %target.source_dir.display(),
                        table = %target.settings.table_name,
                        migrations = migrator.source().len(),
                        "Migrator ready"
                    );
                    self.migrators.insert(engine, migrator);
                }
                Err(e) => {
                    if let Err(close_err) = self.close().await {
                        tracing::warn!(error = %close_err, "Failed to close migrators after setup error");
                    }
                    return Err(StorageError::engine(engine, e));
                }
            }
        }
        Ok(())
    }

    /// Register a migrator, replacing and returning any previous one.
    pub fn insert(&mut self, engine: EngineType, migrator: Migrator) -> Option<Migrator> {
        self.migrators.insert(engine, migrator)
    }

    pub fn migrator(&self, engine: EngineType) -> Option<&Migrator> {
        self.migrators.get(&engine)
    }

    /// Engines with a migrator, in order.
    pub fn engines(&self) -> Vec<EngineType> {
        self.migrators.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.migrators.is_empty()
    }

    /// Apply all pending migrations on every engine.
    pub async fn run_migrations(&self, ctx: &Context) -> Result<(), StorageError> {
        for (engine, migrator) in &self.migrators {
            let changed =
                allow_no_change(migrator.up(ctx).await).map_err(|e| StorageError::engine(*engine, e))?;
            match migrator.version(ctx).await {
                Ok(state) => tracing::info!(
                    engine = %engine,
                    version = ?state.version,
                    dirty = state.dirty,
                    changed,
                    "Migrations up to date"
                ),
                Err(e) => {
                    tracing::warn!(engine = %engine, error = %e, "Failed to read migration version")
                }
            }
        }
        Ok(())
    }

    /// Roll every engine back by one migration, dependents first.
    pub async fn rollback_migrations(&self, ctx: &Context) -> Result<(), StorageError> {
        for (engine, migrator) in self.migrators.iter().rev() {
            let changed = allow_no_change(migrator.steps(ctx, -1).await)
                .map_err(|e| StorageError::engine(*engine, e))?;
            tracing::info!(engine = %engine, changed, "Rolled back one migration");
        }
        Ok(())
    }

    /// Per-engine state. Read failures are reported in the map, not raised.
    pub async fn status(&self, ctx: &Context) -> BTreeMap<EngineType, MigrationStatus> {
        let mut statuses = BTreeMap::new();
        for (engine, migrator) in &self.migrators {
            let status = match migrator.version(ctx).await {
                Ok(state) => MigrationStatus {
                    version: state.version,
                    dirty: state.dirty,
                    error: None,
                },
                Err(e) => MigrationStatus {
                    version: None,
                    dirty: false,
                    error: Some(e.to_string()),
                },
            };
            statuses.insert(*engine, status);
        }
        statuses
    }

    /// Mark `version` clean on `engine` without running anything.
    ///
    /// Operator recovery after a failed migration; never called
    /// automatically.
    pub async fn force(
        &self,
        ctx: &Context,
        engine: EngineType,
        version: u64,
    ) -> Result<(), StorageError> {
        let migrator = self
            .migrators
            .get(&engine)
            .ok_or_else(|| StorageError::NotFound(format!("no migrator for {engine}")))?;
        migrator.force(ctx, version).await
    }

    /// Close every migrator. Idempotent.
    pub async fn close(&mut self) -> Result<(), StorageError> {
        let mut errors = Vec::new();
        for (engine, migrator) in std::mem::take(&mut self.migrators) {
            if let Err(e) = migrator.close().await {
                errors.push(StorageError::engine(engine, e));
            }
        }
        StorageError::from_many(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::MigrationVersion;
    use crate::migrate::migrator::tests::memory_migrator;

    const FILES: &[(&str, &str)] = &[
        ("1_init.up.sql", "create"),
        ("1_init.down.sql", "drop"),
    ];

    #[tokio::test]
    async fn test_run_and_rollback_every_engine() {
        let ctx = Context::background();
        let mut manager = MigrationManager::new();
        let (relational, relational_state) = memory_migrator(EngineType::Relational, FILES).await;
        let (timeseries, timeseries_state) = memory_migrator(EngineType::TimeSeries, FILES).await;
        manager.insert(EngineType::Relational, relational);
        manager.insert(EngineType::TimeSeries, timeseries);

        manager.run_migrations(&ctx).await.unwrap();
        manager.run_migrations(&ctx).await.unwrap();
        assert_eq!(
            relational_state.lock().unwrap().version,
            MigrationVersion::clean(Some(1))
        );

        let status = manager.status(&ctx).await;
        assert_eq!(status.len(), 2);
        assert_eq!(status[&EngineType::TimeSeries].version, Some(1));
        assert!(status[&EngineType::TimeSeries].error.is_none());

        manager.rollback_migrations(&ctx).await.unwrap();
        manager.rollback_migrations(&ctx).await.unwrap();
        assert_eq!(
            timeseries_state.lock().unwrap().version,
            MigrationVersion::clean(None)
        );
    }

    #[tokio::test]
    async fn test_failure_names_engine_and_force_recovers() {
        let ctx = Context::background();
        let mut manager = MigrationManager::new();
        let (migrator, _state) =
            memory_migrator(EngineType::Relational, &[("1_bad.up.sql", "FAIL")]).await;
        manager.insert(EngineType::Relational, migrator);

        let err = manager.run_migrations(&ctx).await.unwrap_err();
        assert!(err.to_string().starts_with("relational: migration error: migration 1 failed"));

        let status = manager.status(&ctx).await;
        assert!(status[&EngineType::Relational].dirty);

        manager.force(&ctx, EngineType::Relational, 1).await.unwrap();
        manager.run_migrations(&ctx).await.unwrap();

        let err = manager
            .force(&ctx, EngineType::TimeSeries, 1)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut manager = MigrationManager::new();
        let (migrator, state) = memory_migrator(EngineType::Relational, FILES).await;
        manager.insert(EngineType::Relational, migrator);

        manager.close().await.unwrap();
        assert!(state.lock().unwrap().closed);
        assert!(manager.is_empty());
        manager.close().await.unwrap();
    }
}
