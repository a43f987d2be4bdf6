//! Capability traits implemented by every provider.
//!
//! [`Database`] is the base contract. [`RelationalDatabase`],
//! [`DocumentDatabase`] and [`CacheDatabase`] add engine-specific
//! operations; [`TimeSeriesDatabase`] extends the relational contract.
//!
//! Every provider checks for a live pool/client before any I/O and answers
//! [`StorageError::NotConnected`] otherwise.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{RelationalConfig, TimeSeriesConfig};
use crate::migrate::{MigrationDirection, MigrationVersion};
use crate::storage::db::{CacheTransaction, DocumentTransaction, SqlTransaction};
use crate::storage::sql::{ExecResult, Row, Rows, Value};
use crate::storage::types::{
    CollectionOptions, CompressionOptions, ContinuousAggregateOptions, EngineType,
    HypertableInfo, HypertableOptions, IndexDefinition,
};
use crate::storage::{Context, StorageError};

/// Base contract for a storage provider.
#[async_trait]
pub trait Database: Send + Sync {
    /// Open the pool/client and verify it with a round-trip.
    async fn connect(&self, ctx: &Context) -> Result<(), StorageError>;

    /// Release the pool/client. Idempotent; a no-op if never connected.
    async fn close(&self) -> Result<(), StorageError>;

    /// Live round-trip; fails fast with `NotConnected` before `connect`.
    async fn health(&self, ctx: &Context) -> Result<(), StorageError>;

    /// Engine family this provider serves.
    fn engine_type(&self) -> EngineType;

    /// Start an engine-specific unit of atomicity.
    async fn begin_tx(&self, ctx: &Context) -> Result<Box<dyn Transaction>, StorageError>;
}

/// An engine-specific transaction.
///
/// Exactly one `commit` or `rollback` ends it; any later call returns
/// [`StorageError::TransactionClosed`].
#[async_trait]
pub trait Transaction: Send {
    fn engine_type(&self) -> EngineType;

    /// False once committed or rolled back.
    fn is_active(&self) -> bool;

    async fn commit(&mut self) -> Result<(), StorageError>;

    async fn rollback(&mut self) -> Result<(), StorageError>;
}

impl std::fmt::Debug for dyn Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("engine_type", &self.engine_type())
            .field("active", &self.is_active())
            .finish()
    }
}

/// SQL engine operations.
#[async_trait]
pub trait RelationalDatabase: Database {
    /// Run a query and return a forward-only cursor.
    async fn query(&self, ctx: &Context, sql: &str, params: Vec<Value>)
    -> Result<Rows, StorageError>;

    /// Run a query expecting one row; no rows is `NotFound`.
    async fn query_row(&self, ctx: &Context, sql: &str, params: Vec<Value>)
    -> Result<Row, StorageError>;

    /// Run a statement that returns no rows.
    async fn exec(&self, ctx: &Context, sql: &str, params: Vec<Value>)
    -> Result<ExecResult, StorageError>;

    /// Start a typed SQL transaction.
    async fn begin_sql(&self, ctx: &Context) -> Result<SqlTransaction, StorageError>;

    /// Apply all pending migrations (`Up`) or revert one (`Down`).
    async fn migrate(&self, ctx: &Context, direction: MigrationDirection)
    -> Result<(), StorageError>;

    /// Current migration state of this engine.
    async fn migration_version(&self, ctx: &Context) -> Result<MigrationVersion, StorageError>;

    /// The configuration this provider was built from.
    fn relational_config(&self) -> &RelationalConfig;
}

/// Document engine operations.
#[async_trait]
pub trait DocumentDatabase: Database {
    async fn create_collection(
        &self,
        ctx: &Context,
        name: &str,
        options: CollectionOptions,
    ) -> Result<(), StorageError>;

    async fn drop_collection(&self, ctx: &Context, name: &str) -> Result<(), StorageError>;

    async fn list_collections(&self, ctx: &Context) -> Result<Vec<String>, StorageError>;

    /// Create an index and return its name.
    async fn create_index(
        &self,
        ctx: &Context,
        collection: &str,
        index: IndexDefinition,
    ) -> Result<String, StorageError>;

    async fn drop_index(&self, ctx: &Context, collection: &str, name: &str)
    -> Result<(), StorageError>;

    async fn list_indexes(&self, ctx: &Context, collection: &str)
    -> Result<Vec<String>, StorageError>;

    /// Start a session-scoped transaction.
    async fn begin_session(&self, ctx: &Context) -> Result<DocumentTransaction, StorageError>;

    /// Database handle for repositories.
    async fn database(&self) -> Result<mongodb::Database, StorageError>;
}

/// Key-value cache operations.
///
/// Absent keys, fields and empty lists answer [`StorageError::NotFound`];
/// transport failures answer [`StorageError::Cache`].
#[async_trait]
pub trait CacheDatabase: Database {
    async fn get(&self, ctx: &Context, key: &str) -> Result<String, StorageError>;

    /// Set a value; `ttl = None` keeps it until deleted.
    async fn set(&self, ctx: &Context, key: &str, value: &str, ttl: Option<Duration>)
    -> Result<(), StorageError>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, ctx: &Context, keys: &[&str]) -> Result<u64, StorageError>;

    /// Count how many of `keys` exist.
    async fn exists(&self, ctx: &Context, keys: &[&str]) -> Result<u64, StorageError>;

    /// Set a key's time-to-live; false if the key is absent.
    async fn expire(&self, ctx: &Context, key: &str, ttl: Duration) -> Result<bool, StorageError>;

    /// Remaining time-to-live; `None` for a key without expiry.
    async fn ttl(&self, ctx: &Context, key: &str) -> Result<Option<Duration>, StorageError>;

    async fn hget(&self, ctx: &Context, key: &str, field: &str) -> Result<String, StorageError>;

    /// Set hash fields, returning how many were new.
    async fn hset(&self, ctx: &Context, key: &str, fields: &[(&str, &str)])
    -> Result<u64, StorageError>;

    async fn hdel(&self, ctx: &Context, key: &str, fields: &[&str]) -> Result<u64, StorageError>;

    async fn hgetall(&self, ctx: &Context, key: &str)
    -> Result<HashMap<String, String>, StorageError>;

    /// Push to the head of a list, returning the new length.
    async fn lpush(&self, ctx: &Context, key: &str, values: &[&str]) -> Result<u64, StorageError>;

    /// Pop from the tail of a list.
    async fn rpop(&self, ctx: &Context, key: &str) -> Result<String, StorageError>;

    async fn llen(&self, ctx: &Context, key: &str) -> Result<u64, StorageError>;

    /// Add set members, returning how many were new.
    async fn sadd(&self, ctx: &Context, key: &str, members: &[&str]) -> Result<u64, StorageError>;

    async fn smembers(&self, ctx: &Context, key: &str) -> Result<Vec<String>, StorageError>;

    async fn srem(&self, ctx: &Context, key: &str, members: &[&str]) -> Result<u64, StorageError>;

    /// Start a buffered `MULTI`/`EXEC` pipeline.
    async fn begin_pipeline(&self, ctx: &Context) -> Result<CacheTransaction, StorageError>;
}

/// Time-series operations on top of the relational contract.
#[async_trait]
pub trait TimeSeriesDatabase: RelationalDatabase {
    /// Convert an existing table into a hypertable partitioned on `time_column`.
    async fn create_hypertable(
        &self,
        ctx: &Context,
        table: &str,
        time_column: &str,
        options: HypertableOptions,
    ) -> Result<(), StorageError>;

    async fn drop_hypertable(
        &self,
        ctx: &Context,
        table: &str,
        if_exists: bool,
        cascade: bool,
    ) -> Result<(), StorageError>;

    async fn list_hypertables(&self, ctx: &Context) -> Result<Vec<HypertableInfo>, StorageError>;

    async fn enable_compression(
        &self,
        ctx: &Context,
        table: &str,
        options: CompressionOptions,
    ) -> Result<(), StorageError>;

    /// Remove the compression policy, decompress chunks and turn
    /// compression off.
    async fn disable_compression(&self, ctx: &Context, table: &str) -> Result<(), StorageError>;

    /// Create a continuous aggregate named `view` over `query`.
    ///
    /// `query` is trusted SQL supplied by the application, never user input.
    async fn create_continuous_aggregate(
        &self,
        ctx: &Context,
        view: &str,
        query: &str,
        options: ContinuousAggregateOptions,
    ) -> Result<(), StorageError>;

    async fn drop_continuous_aggregate(
        &self,
        ctx: &Context,
        view: &str,
        if_exists: bool,
    ) -> Result<(), StorageError>;

    /// Refresh the window `[now - start_offset, now - end_offset)`.
    async fn refresh_continuous_aggregate(
        &self,
        ctx: &Context,
        view: &str,
        start_offset: Option<Duration>,
        end_offset: Option<Duration>,
    ) -> Result<(), StorageError>;

    /// Drop chunks older than `drop_after` on a schedule. `None` uses the
    /// configured retention interval, and is rejected when retention is
    /// disabled in the configuration.
    async fn add_retention_policy(
        &self,
        ctx: &Context,
        table: &str,
        drop_after: Option<Duration>,
    ) -> Result<(), StorageError>;

    async fn remove_retention_policy(&self, ctx: &Context, table: &str)
    -> Result<(), StorageError>;

    fn timeseries_config(&self) -> &TimeSeriesConfig;

    /// View this provider through the relational contract.
    fn into_relational(self: Arc<Self>) -> Arc<dyn RelationalDatabase>;
}
