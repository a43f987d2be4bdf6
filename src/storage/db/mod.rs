//! Engine providers.
//!
//! One provider per engine, each owning its own pool or client:
//!
//! - [`PostgresProvider`]: relational engine (sqlx `PgPool`)
//! - [`TimescaleProvider`]: time-series engine composing a `PostgresProvider`
//! - [`RedisProvider`]: cache engine (multiplexed connections)
//! - [`MongoProvider`]: document engine (driver connection pool)
//!
//! # Example
//!
//! ```ignore
//! let provider = PostgresProvider::new(RelationalConfig::default());
//! provider.connect(&Context::background()).await?;
//! let row = provider.query_row(&ctx, "SELECT 1", params![]).await?;
//! ```

mod mongo;
mod postgres;
mod redis;
mod timescale;

pub(crate) use self::postgres::connect_options;
pub use self::mongo::{DocumentTransaction, MongoProvider};
pub use self::postgres::{PostgresProvider, SqlTransaction};
pub use self::redis::{CacheTransaction, RedisProvider};
pub use self::timescale::TimescaleProvider;
