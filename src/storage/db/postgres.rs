//! PostgreSQL provider using sqlx.
//!
//! Owns one `PgPool` built from a [`RelationalConfig`]. The pool is the only
//! synchronization point for callers: it hands out connections concurrently
//! and queues callers beyond `max_connections` until `connect_timeout`.

use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::Postgres;
use tokio::sync::RwLock;

use crate::config::{RelationalConfig, SslMode};
use crate::migrate::{
    MigrationDirection, MigrationTarget, MigrationVersion, Migrator, allow_no_change,
};
use crate::storage::sql::{ExecResult, Row, Rows, Value, bind_params, require_row};
use crate::storage::traits::{Database, RelationalDatabase, Transaction};
use crate::storage::types::EngineType;
use crate::storage::{Context, StorageError};

/// Application name reported to the server.
const APPLICATION_NAME: &str = "polystore";

/// Build sqlx connect options from configuration.
pub(crate) fn connect_options(config: &RelationalConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .password(&config.password)
        .database(&config.database)
        .ssl_mode(ssl_mode(config.ssl_mode))
        .application_name(APPLICATION_NAME)
}

fn ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Allow => PgSslMode::Allow,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

/// Owned row stream so a cursor can outlive the call that opened it.
fn row_stream(
    pool: PgPool,
    sql: String,
    args: PgArguments,
) -> impl Stream<Item = Result<PgRow, sqlx::Error>> + Send + 'static {
    async_stream::try_stream! {
        let mut rows = sqlx::query_with(&sql, args).fetch(&pool);
        while let Some(row) = rows.try_next().await? {
            yield row;
        }
    }
}

/// PostgreSQL provider.
pub struct PostgresProvider {
    config: RelationalConfig,
    engine: EngineType,
    pool: RwLock<Option<PgPool>>,
    migrations: Option<MigrationTarget>,
}

impl std::fmt::Debug for PostgresProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresProvider")
            .field("engine", &self.engine)
            .field("url", &self.config.display_url())
            .finish_non_exhaustive()
    }
}

impl PostgresProvider {
    /// Create a provider. Performs no I/O.
    pub fn new(config: RelationalConfig) -> Self {
        Self::with_engine(config, EngineType::Relational)
    }

    /// Create a provider that reports `engine` in errors and logs.
    pub(crate) fn with_engine(config: RelationalConfig, engine: EngineType) -> Self {
        Self {
            config,
            engine,
            pool: RwLock::new(None),
            migrations: None,
        }
    }

    /// Enable [`RelationalDatabase::migrate`] from `target`.
    pub fn with_migrations(mut self, target: MigrationTarget) -> Self {
        self.migrations = Some(target);
        self
    }

    /// Snapshot of the live pool, or `NotConnected`.
    pub async fn pool(&self) -> Result<PgPool, StorageError> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or(StorageError::NotConnected(self.engine))
    }

    pub async fn is_connected(&self) -> bool {
        self.pool.read().await.is_some()
    }

    /// Start a typed transaction.
    pub async fn begin(&self, ctx: &Context) -> Result<SqlTransaction, StorageError> {
        let pool = self.pool().await?;
        let tx = ctx.run(pool.begin()).await?;
        Ok(SqlTransaction::new(tx, self.engine, ctx.clone()))
    }

    async fn open_migrator(&self, ctx: &Context) -> Result<Migrator, StorageError> {
        self.pool().await?;
        let target = self.migrations.as_ref().ok_or_else(|| {
            StorageError::Internal(format!("{} provider has no migration source", self.engine))
        })?;
        Migrator::open_postgres(ctx, self.engine, &self.config, target).await
    }
}

#[async_trait]
impl Database for PostgresProvider {
    async fn connect(&self, ctx: &Context) -> Result<(), StorageError> {
        self.config.validate_section(self.engine.as_ref())?;

        if self.is_connected().await {
            tracing::debug!(engine = %self.engine, "Already connected");
            return Ok(());
        }

        let options = connect_options(&self.config);
        let pool_options = PgPoolOptions::new()
            .max_connections(self.config.pool.max_connections)
            .min_connections(self.config.pool.min_connections)
            .max_lifetime(self.config.pool.max_lifetime)
            .idle_timeout(self.config.pool.max_idle_time)
            .acquire_timeout(self.config.connect_timeout);

        let pool = ctx
            .run(pool_options.connect_with(options))
            .await
            .map_err(|e| StorageError::connection(self.engine, e))?;

        if let Err(e) = ctx.run(sqlx::query("SELECT 1").execute(&pool)).await {
            pool.close().await;
            return Err(StorageError::connection(self.engine, e));
        }

        *self.pool.write().await = Some(pool);
        tracing::info!(
            engine = %self.engine,
            url = %self.config.display_url(),
            max_connections = self.config.pool.max_connections,
            "Connected"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            tracing::info!(engine = %self.engine, "Connection pool closed");
        }
        Ok(())
    }

    async fn health(&self, ctx: &Context) -> Result<(), StorageError> {
        let pool = self.pool().await?;
        ctx.run(sqlx::query("SELECT 1").execute(&pool)).await?;
        Ok(())
    }

    fn engine_type(&self) -> EngineType {
        self.engine
    }

    async fn begin_tx(&self, ctx: &Context) -> Result<Box<dyn Transaction>, StorageError> {
        Ok(Box::new(self.begin(ctx).await?))
    }
}

#[async_trait]
impl RelationalDatabase for PostgresProvider {
    async fn query(
        &self,
        ctx: &Context,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Rows, StorageError> {
        let pool = self.pool().await?;
        let args = bind_params(params)?;
        Rows::open(Box::pin(row_stream(pool, sql.to_owned(), args)), ctx).await
    }

    async fn query_row(
        &self,
        ctx: &Context,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Row, StorageError> {
        let pool = self.pool().await?;
        let args = bind_params(params)?;
        let row = ctx
            .run(sqlx::query_with(sql, args).fetch_optional(&pool))
            .await?;
        require_row(row, self.engine)
    }

    async fn exec(
        &self,
        ctx: &Context,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<ExecResult, StorageError> {
        let pool = self.pool().await?;
        let args = bind_params(params)?;
        let result = ctx
            .run(sqlx::query_with(sql, args).execute(&pool))
            .await?;
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: None,
        })
    }

    async fn begin_sql(&self, ctx: &Context) -> Result<SqlTransaction, StorageError> {
        self.begin(ctx).await
    }

    async fn migrate(
        &self,
        ctx: &Context,
        direction: MigrationDirection,
    ) -> Result<(), StorageError> {
        let migrator = self.open_migrator(ctx).await?;
        let result = match direction {
            MigrationDirection::Up => migrator.up(ctx).await,
            MigrationDirection::Down => migrator.steps(ctx, -1).await,
        };
        let closed = migrator.close().await;
        let changed = allow_no_change(result)?;
        closed?;
        tracing::info!(engine = %self.engine, ?direction, changed, "Migration finished");
        Ok(())
    }

    async fn migration_version(&self, ctx: &Context) -> Result<MigrationVersion, StorageError> {
        let migrator = self.open_migrator(ctx).await?;
        let version = migrator.version(ctx).await;
        migrator.close().await?;
        version
    }

    fn relational_config(&self) -> &RelationalConfig {
        &self.config
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// SQL transaction handle.
///
/// Dropping an active transaction rolls it back. `commit` and `rollback` are
/// bounded by the context the transaction was started with; a commit cut
/// short by it leaves the transaction to be rolled back on drop.
pub struct SqlTransaction {
    inner: Option<sqlx::Transaction<'static, Postgres>>,
    engine: EngineType,
    ctx: Context,
}

impl std::fmt::Debug for SqlTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlTransaction")
            .field("engine", &self.engine)
            .field("active", &self.inner.is_some())
            .finish()
    }
}

impl SqlTransaction {
    fn new(inner: sqlx::Transaction<'static, Postgres>, engine: EngineType, ctx: Context) -> Self {
        Self {
            inner: Some(inner),
            engine,
            ctx,
        }
    }

    fn tx(&mut self) -> Result<&mut sqlx::Transaction<'static, Postgres>, StorageError> {
        self.inner.as_mut().ok_or(StorageError::TransactionClosed)
    }

    /// Run a statement inside the transaction.
    pub async fn exec(
        &mut self,
        ctx: &Context,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<ExecResult, StorageError> {
        let args = bind_params(params)?;
        let tx = self.tx()?;
        let result = ctx
            .run(sqlx::query_with(sql, args).execute(&mut **tx))
            .await?;
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: None,
        })
    }

    /// Run a query inside the transaction. Rows are buffered.
    pub async fn query(
        &mut self,
        ctx: &Context,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Rows, StorageError> {
        let args = bind_params(params)?;
        let tx = self.tx()?;
        let rows = ctx
            .run(sqlx::query_with(sql, args).fetch_all(&mut **tx))
            .await?;
        Ok(Rows::from_vec(rows))
    }

    /// Run a query expecting one row inside the transaction.
    pub async fn query_row(
        &mut self,
        ctx: &Context,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Row, StorageError> {
        let args = bind_params(params)?;
        let engine = self.engine;
        let tx = self.tx()?;
        let row = ctx
            .run(sqlx::query_with(sql, args).fetch_optional(&mut **tx))
            .await?;
        require_row(row, engine)
    }
}

#[async_trait]
impl Transaction for SqlTransaction {
    fn engine_type(&self) -> EngineType {
        self.engine
    }

    fn is_active(&self) -> bool {
        self.inner.is_some()
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        let tx = self.inner.take().ok_or(StorageError::TransactionClosed)?;
        self.ctx.run(tx.commit()).await
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        let tx = self.inner.take().ok_or(StorageError::TransactionClosed)?;
        self.ctx.run(tx.rollback()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> RelationalConfig {
        RelationalConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            connect_timeout: std::time::Duration::from_millis(200),
            ..RelationalConfig::default()
        }
    }

    #[tokio::test]
    async fn test_operations_before_connect_are_not_connected() {
        let provider = PostgresProvider::new(RelationalConfig::default());
        let ctx = Context::background();

        assert!(provider.health(&ctx).await.unwrap_err().is_not_connected());
        assert!(
            provider
                .query(&ctx, "SELECT 1", vec![])
                .await
                .unwrap_err()
                .is_not_connected()
        );
        assert!(
            provider
                .exec(&ctx, "SELECT 1", vec![])
                .await
                .unwrap_err()
                .is_not_connected()
        );
        assert!(provider.begin_tx(&ctx).await.unwrap_err().is_not_connected());
        assert!(
            provider
                .migrate(&ctx, MigrationDirection::Up)
                .await
                .unwrap_err()
                .is_not_connected()
        );
    }

    #[tokio::test]
    async fn test_close_without_connect_is_noop() {
        let provider = PostgresProvider::new(RelationalConfig::default());
        provider.close().await.unwrap();
        provider.close().await.unwrap();
        assert!(!provider.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config_before_io() {
        let provider = PostgresProvider::new(RelationalConfig {
            host: String::new(),
            ..RelationalConfig::default()
        });
        let err = provider.connect(&Context::background()).await.unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
        assert!(!provider.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_failure_names_engine() {
        let provider = PostgresProvider::new(unreachable_config());
        let ctx = Context::background().with_timeout(std::time::Duration::from_secs(5));
        let err = provider.connect(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Connection {
                engine: EngineType::Relational,
                ..
            }
        ));
        assert!(!provider.is_connected().await);
    }

    #[test]
    fn test_engine_type() {
        let provider = PostgresProvider::new(RelationalConfig::default());
        assert_eq!(provider.engine_type(), EngineType::Relational);
        let provider =
            PostgresProvider::with_engine(RelationalConfig::default(), EngineType::TimeSeries);
        assert_eq!(provider.engine_type(), EngineType::TimeSeries);
    }
}
