//! TimescaleDB provider.
//!
//! Composes a [`PostgresProvider`] and adds hypertable, compression,
//! continuous-aggregate and retention administration. Values are bound as
//! parameters (`$1::regclass`, `$2::interval`); identifiers that have to be
//! interpolated pass the identifier allow-list first.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{
    CompressionConfig, RelationalConfig, RetentionConfig, TimeSeriesConfig, is_valid_identifier,
};
use crate::migrate::{MigrationDirection, MigrationTarget, MigrationVersion};
use crate::params;
use crate::storage::db::{PostgresProvider, SqlTransaction};
use crate::storage::sql::{ExecResult, Row, Rows, Value};
use crate::storage::traits::{Database, RelationalDatabase, TimeSeriesDatabase, Transaction};
use crate::storage::types::{
    CompressionOptions, ContinuousAggregateOptions, EngineType, HypertableInfo,
    HypertableOptions, OrderByColumn,
};
use crate::storage::{Context, StorageError};

const EXTENSION: &str = "timescaledb";

/// Reject anything that is not a plain or schema-qualified identifier.
fn ident(name: &str) -> Result<&str, StorageError> {
    if is_valid_identifier(name) {
        Ok(name)
    } else {
        Err(StorageError::InvalidIdentifier(name.to_string()))
    }
}

/// PostgreSQL interval literal for a duration, bound as text.
fn pg_interval(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{} seconds", duration.as_secs())
    } else {
        format!("{} microseconds", duration.as_micros())
    }
}

fn pg_interval_opt(duration: Option<Duration>) -> Value {
    duration.map(pg_interval).into()
}

/// `SELECT create_hypertable(...)` with its parameter list.
fn create_hypertable_sql(
    table: &str,
    time_column: &str,
    chunk_time_interval: Duration,
    options: &HypertableOptions,
) -> Result<(String, Vec<Value>), StorageError> {
    let mut sql = String::from(
        "SELECT create_hypertable($1::regclass, $2::name, \
         chunk_time_interval => $3::interval, \
         if_not_exists => $4, migrate_data => $5, create_default_indexes => $6",
    );
    let mut params = params![
        ident(table)?,
        ident(time_column)?,
        pg_interval(chunk_time_interval),
        options.if_not_exists,
        options.migrate_data,
        !options.skip_default_indexes,
    ];

    match (&options.partitioning_column, options.number_partitions) {
        (Some(column), partitions) => {
            sql.push_str(", partitioning_column => $7::name");
            params.push(ident(column)?.into());
            if let Some(partitions) = partitions {
                sql.push_str(", number_partitions => $8");
                params.push(i64::from(partitions).into());
            }
        }
        (None, Some(_)) => {
            return Err(StorageError::InvalidData(
                "number_partitions requires partitioning_column".to_string(),
            ));
        }
        (None, None) => {}
    }
    sql.push(')');
    Ok((sql, params))
}

/// `ALTER TABLE ... SET (timescaledb.compress, ...)`.
fn compression_settings_sql(
    table: &str,
    segment_by: &[String],
    order_by: &[OrderByColumn],
) -> Result<String, StorageError> {
    let mut settings = vec!["timescaledb.compress".to_string()];
    if !segment_by.is_empty() {
        let columns = segment_by
            .iter()
            .map(|c| ident(c))
            .collect::<Result<Vec<_>, _>>()?;
        settings.push(format!(
            "timescaledb.compress_segmentby = '{}'",
            columns.join(", ")
        ));
    }
    if !order_by.is_empty() {
        for entry in order_by {
            ident(&entry.column)?;
        }
        let entries: Vec<String> = order_by.iter().map(ToString::to_string).collect();
        settings.push(format!(
            "timescaledb.compress_orderby = '{}'",
            entries.join(", ")
        ));
    }
    Ok(format!(
        "ALTER TABLE {} SET ({})",
        ident(table)?,
        settings.join(", ")
    ))
}

/// `add_compression_policy` call, or `None` when neither the caller nor an
/// enabled configuration asks for a policy.
fn compression_policy_sql(
    table: &str,
    requested: Option<Duration>,
    defaults: &CompressionConfig,
) -> Result<Option<(&'static str, Vec<Value>)>, StorageError> {
    let Some(after) = requested.or(defaults.enabled.then_some(defaults.after)) else {
        return Ok(None);
    };
    Ok(Some((
        "SELECT add_compression_policy($1::regclass, $2::interval, if_not_exists => true)",
        params![ident(table)?, pg_interval(after)],
    )))
}

/// Retention window: the caller's, else the configured one when enabled.
fn retention_drop_after(
    requested: Option<Duration>,
    defaults: &RetentionConfig,
) -> Result<Duration, StorageError> {
    match requested {
        Some(drop_after) => Ok(drop_after),
        None if defaults.enabled => Ok(defaults.interval),
        None => Err(StorageError::InvalidData(
            "drop_after is required when timeseries.retention is disabled".to_string(),
        )),
    }
}

/// Outcome of the `pg_extension` lookup made after connecting.
fn require_extension(installed: Result<bool, StorageError>) -> Result<(), StorageError> {
    match installed {
        Ok(true) => Ok(()),
        Ok(false) => Err(StorageError::connection(
            EngineType::TimeSeries,
            StorageError::ExtensionMissing(EXTENSION.to_string()),
        )),
        Err(e) => Err(StorageError::connection(EngineType::TimeSeries, e)),
    }
}

fn continuous_aggregate_sql(
    view: &str,
    query: &str,
    options: &ContinuousAggregateOptions,
) -> Result<String, StorageError> {
    let query = query.trim().trim_end_matches(';');
    if query.is_empty() {
        return Err(StorageError::InvalidData(
            "continuous aggregate query is empty".to_string(),
        ));
    }
    Ok(format!(
        "CREATE MATERIALIZED VIEW {} WITH (timescaledb.continuous, timescaledb.materialized_only = {}) AS {} WITH {}DATA",
        ident(view)?,
        options.materialized_only,
        query,
        if options.with_data { "" } else { "NO " },
    ))
}

/// TimescaleDB provider.
#[derive(Debug)]
pub struct TimescaleProvider {
    inner: PostgresProvider,
    config: TimeSeriesConfig,
}

impl TimescaleProvider {
    /// Create a provider. Performs no I/O.
    pub fn new(config: TimeSeriesConfig) -> Self {
        let inner = PostgresProvider::with_engine(config.connection.clone(), EngineType::TimeSeries);
        Self { inner, config }
    }

    /// Enable [`RelationalDatabase::migrate`] from `target`.
    pub fn with_migrations(mut self, target: MigrationTarget) -> Self {
        self.inner = self.inner.with_migrations(target);
        self
    }

    /// The composed relational provider.
    pub fn relational(&self) -> &PostgresProvider {
        &self.inner
    }

    async fn extension_installed(&self, ctx: &Context) -> Result<bool, StorageError> {
        let pool = self.inner.pool().await?;
        let installed: bool = ctx
            .run(
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = $1)")
                    .bind(EXTENSION)
                    .fetch_one(&pool),
            )
            .await?;
        Ok(installed)
    }

    /// Run DDL over the simple query protocol.
    async fn ddl(&self, ctx: &Context, sql: &str) -> Result<(), StorageError> {
        let pool = self.inner.pool().await?;
        tracing::debug!(sql, "Executing time-series DDL");
        ctx.run(sqlx::raw_sql(sql).execute(&pool)).await?;
        Ok(())
    }

    async fn select(&self, ctx: &Context, sql: &str, params: Vec<Value>) -> Result<(), StorageError> {
        self.inner.query(ctx, sql, params).await?.collect().await?;
        Ok(())
    }
}

#[async_trait]
impl Database for TimescaleProvider {
    async fn connect(&self, ctx: &Context) -> Result<(), StorageError> {
        self.config.validate()?;
        self.inner.connect(ctx).await?;

        if let Err(e) = require_extension(self.extension_installed(ctx).await) {
            if let Err(close_err) = self.inner.close().await {
                tracing::error!(error = %close_err, "Failed to close pool after connect failure");
            }
            return Err(e);
        }

        tracing::info!(
            engine = %EngineType::TimeSeries,
            chunk_time_interval = ?self.config.chunk_time_interval,
            "TimescaleDB extension verified"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.close().await
    }

    async fn health(&self, ctx: &Context) -> Result<(), StorageError> {
        self.inner.health(ctx).await
    }

    fn engine_type(&self) -> EngineType {
        EngineType::TimeSeries
    }

    async fn begin_tx(&self, ctx: &Context) -> Result<Box<dyn Transaction>, StorageError> {
        self.inner.begin_tx(ctx).await
    }
}

#[async_trait]
impl RelationalDatabase for TimescaleProvider {
    async fn query(&self, ctx: &Context, sql: &str, params: Vec<Value>) -> Result<Rows, StorageError> {
        self.inner.query(ctx, sql, params).await
    }

    async fn query_row(&self, ctx: &Context, sql: &str, params: Vec<Value>) -> Result<Row, StorageError> {
        self.inner.query_row(ctx, sql, params).await
    }

    async fn exec(
        &self,
        ctx: &Context,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<ExecResult, StorageError> {
        self.inner.exec(ctx, sql, params).await
    }

    async fn begin_sql(&self, ctx: &Context) -> Result<SqlTransaction, StorageError> {
        self.inner.begin_sql(ctx).await
    }

    async fn migrate(&self, ctx: &Context, direction: MigrationDirection) -> Result<(), StorageError> {
        self.inner.migrate(ctx, direction).await
    }

    async fn migration_version(&self, ctx: &Context) -> Result<MigrationVersion, StorageError> {
        self.inner.migration_version(ctx).await
    }

    fn relational_config(&self) -> &RelationalConfig {
        self.inner.relational_config()
    }
}

#[async_trait]
impl TimeSeriesDatabase for TimescaleProvider {
    async fn create_hypertable(
        &self,
        ctx: &Context,
        table: &str,
        time_column: &str,
        options: HypertableOptions,
    ) -> Result<(), StorageError> {
        let chunk = options
            .chunk_time_interval
            .unwrap_or(self.config.chunk_time_interval);
        let (sql, params) = create_hypertable_sql(table, time_column, chunk, &options)?;
        self.select(ctx, &sql, params).await?;
        tracing::info!(table, time_column, chunk_time_interval = ?chunk, "Hypertable created");
        Ok(())
    }

    async fn drop_hypertable(
        &self,
        ctx: &Context,
        table: &str,
        if_exists: bool,
        cascade: bool,
    ) -> Result<(), StorageError> {
        let sql = format!(
            "DROP TABLE {}{}{}",
            if if_exists { "IF EXISTS " } else { "" },
            ident(table)?,
            if cascade { " CASCADE" } else { "" },
        );
        self.ddl(ctx, &sql).await?;
        tracing::info!(table, "Hypertable dropped");
        Ok(())
    }

    async fn list_hypertables(&self, ctx: &Context) -> Result<Vec<HypertableInfo>, StorageError> {
        let rows = self
            .inner
            .query(
                ctx,
                "SELECT hypertable_schema::text, hypertable_name::text, num_chunks::bigint, compression_enabled \
                 FROM timescaledb_information.hypertables ORDER BY 1, 2",
                params![],
            )
            .await?
            .collect()
            .await?;

        rows.iter()
            .map(|row| -> Result<HypertableInfo, StorageError> {
                Ok(HypertableInfo {
                    schema: row.get(0)?,
                    name: row.get(1)?,
                    num_chunks: row.get(2)?,
                    compression_enabled: row.get(3)?,
                })
            })
            .collect()
    }

    async fn enable_compression(
        &self,
        ctx: &Context,
        table: &str,
        options: CompressionOptions,
    ) -> Result<(), StorageError> {
        let defaults = &self.config.compression;
        let segment_by = if options.segment_by.is_empty() {
            defaults.segment_by.clone()
        } else {
            options.segment_by
        };
        let order_by = if options.order_by.is_empty() {
            defaults
                .order_by
                .iter()
                .map(|entry| OrderByColumn::from_str(entry).map_err(StorageError::InvalidData))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            options.order_by
        };
        let sql = compression_settings_sql(table, &segment_by, &order_by)?;
        let policy = compression_policy_sql(table, options.compress_after, defaults)?;

        self.ddl(ctx, &sql).await?;
        if let Some((sql, params)) = policy {
            self.select(ctx, sql, params).await?;
        }

        tracing::info!(
            table,
            segment_by = ?segment_by,
            compress_after = ?options.compress_after,
            default_policy = defaults.enabled,
            "Compression enabled"
        );
        Ok(())
    }

    async fn disable_compression(&self, ctx: &Context, table: &str) -> Result<(), StorageError> {
        let table = ident(table)?;
        self.select(
            ctx,
            "SELECT remove_compression_policy($1::regclass, if_exists => true)",
            params![table],
        )
        .await?;
        self.select(
            ctx,
            "SELECT decompress_chunk(c, if_compressed => true) FROM show_chunks($1::regclass) c",
            params![table],
        )
        .await?;
        self.ddl(ctx, &format!("ALTER TABLE {table} SET (timescaledb.compress = false)"))
            .await?;
        tracing::info!(table, "Compression disabled");
        Ok(())
    }

    async fn create_continuous_aggregate(
        &self,
        ctx: &Context,
        view: &str,
        query: &str,
        options: ContinuousAggregateOptions,
    ) -> Result<(), StorageError> {
        let sql = continuous_aggregate_sql(view, query, &options)?;
        self.ddl(ctx, &sql).await?;

        if let Some(policy) = &options.refresh_policy {
            self.select(
                ctx,
                "SELECT add_continuous_aggregate_policy($1::regclass, \
                 start_offset => $2::interval, end_offset => $3::interval, \
                 schedule_interval => $4::interval)",
                params![
                    view,
                    pg_interval_opt(policy.start_offset),
                    pg_interval_opt(policy.end_offset),
                    pg_interval(policy.schedule_interval),
                ],
            )
            .await?;
        }
        tracing::info!(view, with_data = options.with_data, "Continuous aggregate created");
        Ok(())
    }

    async fn drop_continuous_aggregate(
        &self,
        ctx: &Context,
        view: &str,
        if_exists: bool,
    ) -> Result<(), StorageError> {
        let sql = format!(
            "DROP MATERIALIZED VIEW {}{}",
            if if_exists { "IF EXISTS " } else { "" },
            ident(view)?,
        );
        self.ddl(ctx, &sql).await
    }

    async fn refresh_continuous_aggregate(
        &self,
        ctx: &Context,
        view: &str,
        start_offset: Option<Duration>,
        end_offset: Option<Duration>,
    ) -> Result<(), StorageError> {
        self.inner
            .exec(
                ctx,
                "CALL refresh_continuous_aggregate($1::regclass, now() - $2::interval, now() - $3::interval)",
                params![
                    ident(view)?,
                    pg_interval_opt(start_offset),
                    pg_interval_opt(end_offset),
                ],
            )
            .await?;
        Ok(())
    }

    async fn add_retention_policy(
        &self,
        ctx: &Context,
        table: &str,
        drop_after: Option<Duration>,
    ) -> Result<(), StorageError> {
        let retention = &self.config.retention;
        let drop_after = retention_drop_after(drop_after, retention)?;
        self.select(
            ctx,
            "SELECT add_retention_policy($1::regclass, drop_after => $2::interval, \
             schedule_interval => $3::interval, if_not_exists => true)",
            params![
                ident(table)?,
                pg_interval(drop_after),
                pg_interval(retention.cleanup_interval),
            ],
        )
        .await?;
        tracing::info!(table, drop_after = ?drop_after, "Retention policy added");
        Ok(())
    }

    async fn remove_retention_policy(&self, ctx: &Context, table: &str) -> Result<(), StorageError> {
        self.select(
            ctx,
            "SELECT remove_retention_policy($1::regclass, if_exists => true)",
            params![ident(table)?],
        )
        .await
    }

    fn timeseries_config(&self) -> &TimeSeriesConfig {
        &self.config
    }

    fn into_relational(self: Arc<Self>) -> Arc<dyn RelationalDatabase> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::RefreshPolicy;

    #[test]
    fn test_pg_interval() {
        assert_eq!(pg_interval(Duration::from_secs(7 * 86400)), "604800 seconds");
        assert_eq!(pg_interval(Duration::from_millis(1500)), "1500000 microseconds");
        assert_eq!(pg_interval_opt(None), Value::Null);
    }

    #[test]
    fn test_create_hypertable_sql_binds_values() {
        let options = HypertableOptions {
            partitioning_column: Some("device_id".to_string()),
            number_partitions: Some(4),
            if_not_exists: true,
            ..HypertableOptions::default()
        };
        let (sql, params) =
            create_hypertable_sql("metrics", "ts", Duration::from_secs(86400), &options).unwrap();
        assert!(sql.starts_with("SELECT create_hypertable($1::regclass, $2::name"));
        assert!(sql.ends_with("partitioning_column => $7::name, number_partitions => $8)"));
        assert_eq!(params.len(), 8);
        assert_eq!(params[0], Value::Text("metrics".to_string()));
        assert_eq!(params[2], Value::Text("86400 seconds".to_string()));
        assert_eq!(params[5], Value::Bool(true));
    }

    #[test]
    fn test_create_hypertable_sql_rejects_bad_input() {
        let err = create_hypertable_sql(
            "metrics; DROP TABLE users",
            "ts",
            Duration::from_secs(60),
            &HypertableOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::InvalidIdentifier(_)));

        let options = HypertableOptions {
            number_partitions: Some(2),
            ..HypertableOptions::default()
        };
        let err = create_hypertable_sql("metrics", "ts", Duration::from_secs(60), &options)
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidData(_)));
    }

    #[test]
    fn test_compression_settings_sql() {
        let sql = compression_settings_sql(
            "public.metrics",
            &["device_id".to_string()],
            &[OrderByColumn::desc("ts")],
        )
        .unwrap();
        assert_eq!(
            sql,
            "ALTER TABLE public.metrics SET (timescaledb.compress, \
             timescaledb.compress_segmentby = 'device_id', \
             timescaledb.compress_orderby = 'ts DESC')"
        );

        let err = compression_settings_sql("metrics", &["a'b".to_string()], &[]).unwrap_err();
        assert!(matches!(err, StorageError::InvalidIdentifier(_)));
    }

    #[test]
    fn test_compression_policy_is_optional() {
        let disabled = CompressionConfig::default();
        assert!(!disabled.enabled);
        assert!(compression_policy_sql("metrics", None, &disabled).unwrap().is_none());

        let (sql, params) =
            compression_policy_sql("metrics", Some(Duration::from_secs(3600)), &disabled)
                .unwrap()
                .unwrap();
        assert!(sql.starts_with("SELECT add_compression_policy($1::regclass, $2::interval"));
        assert_eq!(params[1], Value::Text("3600 seconds".to_string()));

        let enabled = CompressionConfig {
            enabled: true,
            ..CompressionConfig::default()
        };
        let (_, params) = compression_policy_sql("metrics", None, &enabled).unwrap().unwrap();
        assert_eq!(params[1], Value::Text("604800 seconds".to_string()));

        let err = compression_policy_sql("bad name", Some(Duration::from_secs(1)), &enabled)
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidIdentifier(_)));
    }

    #[test]
    fn test_retention_drop_after() {
        let disabled = RetentionConfig::default();
        let hour = Duration::from_secs(3600);
        assert_eq!(retention_drop_after(Some(hour), &disabled).unwrap(), hour);
        assert!(matches!(
            retention_drop_after(None, &disabled),
            Err(StorageError::InvalidData(_))
        ));

        let enabled = RetentionConfig {
            enabled: true,
            ..RetentionConfig::default()
        };
        assert_eq!(
            retention_drop_after(None, &enabled).unwrap(),
            Duration::from_secs(90 * 86400)
        );
    }

    #[test]
    fn test_require_extension() {
        assert!(require_extension(Ok(true)).is_ok());

        let err = require_extension(Ok(false)).unwrap_err();
        assert!(matches!(
            &err,
            StorageError::Connection { engine: EngineType::TimeSeries, .. }
        ));
        assert!(err.to_string().contains("timescaledb"));

        let err = require_extension(Err(StorageError::Timeout)).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Connection { engine: EngineType::TimeSeries, .. }
        ));
    }

    #[test]
    fn test_continuous_aggregate_sql() {
        let options = ContinuousAggregateOptions {
            refresh_policy: Some(RefreshPolicy {
                start_offset: Some(Duration::from_secs(3 * 86400)),
                end_offset: Some(Duration::from_secs(3600)),
                schedule_interval: Duration::from_secs(3600),
            }),
            with_data: false,
            materialized_only: true,
        };
        let sql = continuous_aggregate_sql(
            "metrics_hourly",
            "SELECT time_bucket('1 hour', ts) AS bucket, avg(v) FROM metrics GROUP BY bucket;",
            &options,
        )
        .unwrap();
        assert!(sql.starts_with("CREATE MATERIALIZED VIEW metrics_hourly WITH (timescaledb.continuous, timescaledb.materialized_only = true) AS SELECT"));
        assert!(sql.ends_with("GROUP BY bucket WITH NO DATA"));

        assert!(continuous_aggregate_sql("v", "  ", &options).is_err());
        assert!(continuous_aggregate_sql("v x", "SELECT 1", &options).is_err());
    }

    #[tokio::test]
    async fn test_admin_calls_before_connect() {
        let provider = TimescaleProvider::new(TimeSeriesConfig::default());
        let ctx = Context::background();

        let err = provider
            .create_hypertable(&ctx, "metrics", "ts", HypertableOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_connected());

        let err = provider
            .drop_hypertable(&ctx, "bad name", true, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidIdentifier(_)));

        assert_eq!(provider.engine_type(), EngineType::TimeSeries);
        provider.close().await.unwrap();
    }
}
