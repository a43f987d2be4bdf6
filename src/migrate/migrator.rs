//! Per-engine migration runner.
//!
//! # State machine
//!
//! The tracked state is `clean@V` or `dirty@V`. Applying a migration first
//! records `dirty@V` for the migration being applied, runs its body, then
//! records `clean@V` (or `clean@prev` after a down migration). A failing body
//! leaves `dirty@V`, and every mutating call refuses to run until an operator
//! calls [`Migrator::force`].

use std::time::Instant;

use strum_macros::{AsRefStr, Display, EnumString};
use tokio::sync::Mutex;

use crate::config::RelationalConfig;
use crate::migrate::postgres::PostgresDriver;
use crate::migrate::source::{Migration, MigrationSource};
use crate::migrate::{MigrationDriver, MigrationError, MigrationTarget, MigrationVersion};
use crate::storage::types::EngineType;
use crate::storage::{Context, StorageError};

/// Direction of a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MigrationDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy)]
enum Plan {
    Up { limit: Option<u64> },
    Down { limit: Option<u64> },
    To(u64),
}

struct Step<'a> {
    migration: &'a Migration,
    direction: MigrationDirection,
    body: &'a str,
    after: Option<u64>,
}

/// Runs migrations from one source against one engine.
///
/// Holds its own driver connection, independent of the provider pool.
/// Calls are serialized by an in-process mutex and, across processes, by
/// the driver lock.
pub struct Migrator {
    engine: EngineType,
    source: MigrationSource,
    driver: Mutex<Box<dyn MigrationDriver>>,
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("engine", &self.engine)
            .field("source", &self.source.dir())
            .field("migrations", &self.source.len())
            .finish_non_exhaustive()
    }
}

impl Migrator {
    /// Wrap a driver, creating its version table.
    pub async fn new(
        ctx: &Context,
        engine: EngineType,
        source: MigrationSource,
        mut driver: Box<dyn MigrationDriver>,
    ) -> Result<Self, StorageError> {
        if let Err(e) = driver.ensure_version_table(ctx).await {
            if let Err(close_err) = driver.close().await {
                tracing::warn!(engine = %engine, error = %close_err, "Failed to close migration driver");
            }
            return Err(e);
        }
        Ok(Self {
            engine,
            source,
            driver: Mutex::new(driver),
        })
    }

    /// Load `target.source_dir` and open a PostgreSQL driver for `config`.
    pub async fn open_postgres(
        ctx: &Context,
        engine: EngineType,
        config: &RelationalConfig,
        target: &MigrationTarget,
    ) -> Result<Self, StorageError> {
        let source = MigrationSource::load(&target.source_dir)?;
        let driver = PostgresDriver::open(ctx, config, target.settings.clone()).await?;
        Self::new(ctx, engine, source, Box::new(driver)).await
    }

    pub fn engine_type(&self) -> EngineType {
        self.engine
    }

    pub fn source(&self) -> &MigrationSource {
        &self.source
    }

    /// Apply every pending migration.
    pub async fn up(&self, ctx: &Context) -> Result<(), StorageError> {
        self.run(ctx, Plan::Up { limit: None }).await
    }

    /// Revert every applied migration.
    pub async fn down(&self, ctx: &Context) -> Result<(), StorageError> {
        self.run(ctx, Plan::Down { limit: None }).await
    }

    /// Apply `n` migrations up (`n > 0`) or down (`n < 0`).
    pub async fn steps(&self, ctx: &Context, n: i64) -> Result<(), StorageError> {
        let limit = Some(n.unsigned_abs());
        match n {
            0 => Err(MigrationError::NoChange.into()),
            n if n > 0 => self.run(ctx, Plan::Up { limit }).await,
            _ => self.run(ctx, Plan::Down { limit }).await,
        }
    }

    /// Move up or down until `version` is the current version.
    pub async fn migrate_to(&self, ctx: &Context, version: u64) -> Result<(), StorageError> {
        self.run(ctx, Plan::To(version)).await
    }

    /// Record `clean@version` without running any migration body.
    pub async fn force(&self, ctx: &Context, version: u64) -> Result<(), StorageError> {
        let mut driver = self.driver.lock().await;
        driver.lock(ctx).await?;
        let result = driver
            .write_version(ctx, MigrationVersion::clean(Some(version)))
            .await;
        let unlocked = driver.unlock(ctx).await;
        result.and(unlocked)?;
        tracing::warn!(engine = %self.engine, version, "Forced migration version");
        Ok(())
    }

    /// The tracked state.
    pub async fn version(&self, ctx: &Context) -> Result<MigrationVersion, StorageError> {
        self.driver.lock().await.read_version(ctx).await
    }

    /// Release the driver connection.
    pub async fn close(self) -> Result<(), StorageError> {
        self.driver.into_inner().close().await
    }

    async fn run(&self, ctx: &Context, plan: Plan) -> Result<(), StorageError> {
        let mut driver = self.driver.lock().await;
        driver.lock(ctx).await?;
        let result = self.apply(ctx, &mut **driver, plan).await;
        let unlocked = driver.unlock(ctx).await;
        if let Err(e) = &unlocked {
            tracing::warn!(engine = %self.engine, error = %e, "Failed to release migration lock");
        }
        result.and(unlocked)
    }

    async fn apply(
        &self,
        ctx: &Context,
        driver: &mut dyn MigrationDriver,
        plan: Plan,
    ) -> Result<(), StorageError> {
        let current = driver.read_version(ctx).await?;
        if current.dirty {
            return Err(MigrationError::Dirty(current.version.unwrap_or_default()).into());
        }
        if current.version.is_none() && matches!(plan, Plan::Down { limit: Some(_) }) {
            return Err(MigrationError::NilVersion.into());
        }

        let (steps, short) = self.plan(current.version, plan)?;
        if steps.is_empty() {
            return Err(MigrationError::NoChange.into());
        }

        for step in steps {
            let version = step.migration.version;
            driver.write_version(ctx, MigrationVersion::dirty(version)).await?;

            let started = Instant::now();
            if let Err(source) = driver.execute(ctx, step.body).await {
                tracing::error!(
                    engine = %self.engine,
                    version,
                    name = %step.migration.name,
                    direction = %step.direction,
                    error = %source,
                    "Migration failed, version left dirty"
                );
                return Err(MigrationError::Apply {
                    version,
                    source: Box::new(source),
                }
                .into());
            }

            driver
                .write_version(ctx, MigrationVersion::clean(step.after))
                .await?;
            tracing::info!(
                engine = %self.engine,
                version,
                name = %step.migration.name,
                direction = %step.direction,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Applied migration"
            );
        }

        match short {
            0 => Ok(()),
            n => Err(MigrationError::ShortLimit(n).into()),
        }
    }

    /// Resolve a plan into ordered steps plus how far short of the limit it
    /// falls. Every body is checked before anything runs.
    fn plan(&self, current: Option<u64>, plan: Plan) -> Result<(Vec<Step<'_>>, u64), MigrationError> {
        if let Some(v) = current
            && self.source.get(v).is_none()
        {
            return Err(MigrationError::UnknownVersion(v));
        }

        let (candidates, direction, limit): (Vec<&Migration>, _, _) = match plan {
            Plan::Up { limit } => (
                self.source.pending(current).collect(),
                MigrationDirection::Up,
                limit,
            ),
            Plan::Down { limit } => (
                self.source.applied(current).collect(),
                MigrationDirection::Down,
                limit,
            ),
            Plan::To(target) => {
                if self.source.get(target).is_none() {
                    return Err(MigrationError::UnknownVersion(target));
                }
                match current {
                    Some(v) if v > target => (
                        self.source
                            .applied(current)
                            .filter(|m| m.version > target)
                            .collect(),
                        MigrationDirection::Down,
                        None,
                    ),
                    _ => (
                        self.source
                            .pending(current)
                            .filter(|m| m.version <= target)
                            .collect(),
                        MigrationDirection::Up,
                        None,
                    ),
                }
            }
        };

        let take = limit.map_or(candidates.len(), |n| {
            usize::try_from(n).unwrap_or(usize::MAX).min(candidates.len())
        });
        let short = limit.map_or(0, |n| n.saturating_sub(take as u64));

        let mut steps = Vec::with_capacity(take);
        for migration in candidates.into_iter().take(take) {
            let (body, after) = match direction {
                MigrationDirection::Up => (migration.up.as_deref(), Some(migration.version)),
                MigrationDirection::Down => (
                    migration.down.as_deref(),
                    self.source.previous(migration.version),
                ),
            };
            let body = body.ok_or_else(|| {
                MigrationError::Source(format!(
                    "no {direction} migration for version {}",
                    migration.version
                ))
            })?;
            steps.push(Step {
                migration,
                direction,
                body,
                after,
            });
        }
        Ok((steps, short))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use async_trait::async_trait;

    use super::*;
    use crate::migrate::allow_no_change;

    #[derive(Debug, Default)]
    pub(crate) struct MemoryState {
        pub version: MigrationVersion,
        pub executed: Vec<String>,
        pub locks: i32,
        pub closed: bool,
    }

    /// In-memory driver; any body containing `FAIL` errors.
    pub(crate) struct MemoryDriver {
        pub state: Arc<StdMutex<MemoryState>>,
    }

    #[async_trait]
    impl MigrationDriver for MemoryDriver {
        async fn ensure_version_table(&mut self, _ctx: &Context) -> Result<(), StorageError> {
            Ok(())
        }

        async fn lock(&mut self, _ctx: &Context) -> Result<(), StorageError> {
            self.state.lock().unwrap().locks += 1;
            Ok(())
        }

        async fn unlock(&mut self, _ctx: &Context) -> Result<(), StorageError> {
            self.state.lock().unwrap().locks -= 1;
            Ok(())
        }

        async fn read_version(&mut self, _ctx: &Context) -> Result<MigrationVersion, StorageError> {
            Ok(self.state.lock().unwrap().version)
        }

        async fn write_version(
            &mut self,
            _ctx: &Context,
            version: MigrationVersion,
        ) -> Result<(), StorageError> {
            self.state.lock().unwrap().version = version;
            Ok(())
        }

        async fn execute(&mut self, _ctx: &Context, body: &str) -> Result<(), StorageError> {
            if body.contains("FAIL") {
                return Err(StorageError::Internal(format!("cannot execute '{body}'")));
            }
            self.state.lock().unwrap().executed.push(body.to_string());
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<(), StorageError> {
            self.state.lock().unwrap().closed = true;
            Ok(())
        }
    }

    pub(crate) async fn memory_migrator(
        engine: EngineType,
        files: &[(&str, &str)],
    ) -> (Migrator, Arc<StdMutex<MemoryState>>) {
        let state = Arc::new(StdMutex::new(MemoryState::default()));
        let source = MigrationSource::from_files(files.iter().copied()).unwrap();
        let driver = MemoryDriver {
            state: state.clone(),
        };
        let migrator = Migrator::new(&Context::background(), engine, source, Box::new(driver))
            .await
            .unwrap();
        (migrator, state)
    }

    const THREE: &[(&str, &str)] = &[
        ("1_users.up.sql", "create users"),
        ("1_users.down.sql", "drop users"),
        ("2_posts.up.sql", "create posts"),
        ("2_posts.down.sql", "drop posts"),
        ("3_tags.up.sql", "create tags"),
        ("3_tags.down.sql", "drop tags"),
    ];

    #[tokio::test]
    async fn test_up_applies_in_order_then_no_change() {
        let ctx = Context::background();
        let (migrator, state) = memory_migrator(EngineType::Relational, THREE).await;

        migrator.up(&ctx).await.unwrap();
        assert_eq!(
            migrator.version(&ctx).await.unwrap(),
            MigrationVersion::clean(Some(3))
        );
        assert_eq!(
            state.lock().unwrap().executed,
            vec!["create users", "create posts", "create tags"]
        );

        let second = migrator.up(&ctx).await;
        assert!(matches!(
            second,
            Err(StorageError::Migration(MigrationError::NoChange))
        ));
        assert!(!allow_no_change(second).unwrap());
        assert_eq!(state.lock().unwrap().locks, 0);
    }

    #[tokio::test]
    async fn test_failed_body_leaves_dirty_until_forced() {
        let ctx = Context::background();
        let (migrator, state) = memory_migrator(
            EngineType::Relational,
            &[
                ("1_init.up.sql", "create t"),
                ("2_broken.up.sql", "FAIL here"),
                ("3_next.up.sql", "create u"),
            ],
        )
        .await;

        let err = migrator.up(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Migration(MigrationError::Apply { version: 2, .. })
        ));
        assert_eq!(
            migrator.version(&ctx).await.unwrap(),
            MigrationVersion::dirty(2)
        );

        let err = migrator.up(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Migration(MigrationError::Dirty(2))
        ));
        let err = migrator.steps(&ctx, -1).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Migration(MigrationError::Dirty(2))
        ));

        migrator.force(&ctx, 2).await.unwrap();
        assert_eq!(
            migrator.version(&ctx).await.unwrap(),
            MigrationVersion::clean(Some(2))
        );

        migrator.up(&ctx).await.unwrap();
        assert_eq!(
            migrator.version(&ctx).await.unwrap(),
            MigrationVersion::clean(Some(3))
        );
        assert_eq!(state.lock().unwrap().executed, vec!["create t", "create u"]);
        assert_eq!(state.lock().unwrap().locks, 0);
    }

    #[tokio::test]
    async fn test_steps_and_short_limit() {
        let ctx = Context::background();
        let (migrator, _state) = memory_migrator(EngineType::Relational, THREE).await;

        migrator.steps(&ctx, 2).await.unwrap();
        assert_eq!(migrator.version(&ctx).await.unwrap().version, Some(2));

        let err = migrator.steps(&ctx, 5).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Migration(MigrationError::ShortLimit(4))
        ));
        assert_eq!(migrator.version(&ctx).await.unwrap().version, Some(3));

        migrator.steps(&ctx, -1).await.unwrap();
        assert_eq!(
            migrator.version(&ctx).await.unwrap(),
            MigrationVersion::clean(Some(2))
        );

        migrator.down(&ctx).await.unwrap();
        assert_eq!(
            migrator.version(&ctx).await.unwrap(),
            MigrationVersion::clean(None)
        );
        assert!(matches!(
            migrator.steps(&ctx, -1).await,
            Err(StorageError::Migration(MigrationError::NilVersion))
        ));
        assert!(matches!(
            migrator.down(&ctx).await,
            Err(StorageError::Migration(MigrationError::NoChange))
        ));
    }

    #[tokio::test]
    async fn test_migrate_to_moves_both_ways() {
        let ctx = Context::background();
        let (migrator, state) = memory_migrator(EngineType::TimeSeries, THREE).await;

        migrator.migrate_to(&ctx, 3).await.unwrap();
        migrator.migrate_to(&ctx, 1).await.unwrap();
        assert_eq!(migrator.version(&ctx).await.unwrap().version, Some(1));
        assert_eq!(
            state.lock().unwrap().executed[3..],
            ["drop tags", "drop posts"]
        );

        assert!(matches!(
            migrator.migrate_to(&ctx, 1).await,
            Err(StorageError::Migration(MigrationError::NoChange))
        ));
        assert!(matches!(
            migrator.migrate_to(&ctx, 9).await,
            Err(StorageError::Migration(MigrationError::UnknownVersion(9)))
        ));
    }

    #[tokio::test]
    async fn test_missing_down_body_fails_before_side_effects() {
        let ctx = Context::background();
        let (migrator, state) = memory_migrator(
            EngineType::Relational,
            &[("1_a.up.sql", "a"), ("2_b.up.sql", "b"), ("2_b.down.sql", "undo b")],
        )
        .await;
        migrator.up(&ctx).await.unwrap();

        let err = migrator.down(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Migration(MigrationError::Source(_))
        ));
        assert_eq!(
            migrator.version(&ctx).await.unwrap(),
            MigrationVersion::clean(Some(2))
        );
        assert_eq!(state.lock().unwrap().executed, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_close_releases_driver() {
        let (migrator, state) = memory_migrator(EngineType::Relational, THREE).await;
        migrator.close().await.unwrap();
        assert!(state.lock().unwrap().closed);
    }
}
