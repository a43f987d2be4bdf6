//! Storage Layer
//!
//! One contract over several engines:
//! - **Relational**: PostgreSQL through a `sqlx` pool (the primary, mandatory)
//! - **Cache**: Redis through round-robin multiplexed connections
//! - **Document**: MongoDB through the driver's own pool
//! - **Time-series**: TimescaleDB, composing the relational provider
//!
//! # Components
//!
//! - [`StoreManager`]: Lifecycle and typed lookup for every configured engine
//! - [`ProviderFactory`] / [`Primary`]: Constructor table, overridable in tests
//! - [`traits`]: Capability traits implemented by each provider
//! - [`Context`]: Deadline and cancellation carried by every I/O call
//! - [`Rows`] / [`Row`] / [`Value`]: Engine-neutral SQL cursor and parameters

mod context;
pub mod db;
mod error;
pub mod factory;
mod manager;
pub mod sql;
pub mod traits;
pub mod types;

pub use context::Context;
pub use error::StorageError;
pub use factory::{Primary, ProviderFactory};
pub use manager::StoreManager;
pub use sql::{ExecResult, Row, Rows, Value};
pub use traits::{
    CacheDatabase, Database, DocumentDatabase, RelationalDatabase, TimeSeriesDatabase,
    Transaction,
};
pub use types::{
    CollectionOptions, CompressionOptions, ContinuousAggregateOptions, EngineType,
    HypertableInfo, HypertableOptions, IndexDefinition, IndexKey, OrderByColumn, RefreshPolicy,
    SortOrder,
};
