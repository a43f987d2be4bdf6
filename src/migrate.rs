//! Schema migrations.
//!
//! Versioned SQL files are applied per engine by a [`Migrator`], which
//! tracks `(version, dirty)` in an engine-specific table through a
//! [`MigrationDriver`]. The [`MigrationManager`] owns one migrator per
//! engine that carries a schema.
//!
//! # Components
//!
//! - [`MigrationSource`]: `<version>_<name>.up.sql` / `.down.sql` files
//! - [`MigrationDriver`] / [`PostgresDriver`]: version storage and locking
//! - [`Migrator`]: the up/down/steps/force state machine
//! - [`MigrationManager`]: setup, run, rollback and status across engines

mod driver;
mod error;
mod manager;
mod migrator;
mod postgres;
mod source;

pub use driver::{
    DEFAULT_MIGRATIONS_TABLE, MigrationDriver, MigrationSettings, MigrationTarget,
    MigrationVersion, TIMESCALE_MIGRATIONS_TABLE,
};
pub use error::{MigrationError, allow_no_change};
pub use manager::{MigrationManager, MigrationStatus};
pub use migrator::{MigrationDirection, Migrator};
pub use postgres::PostgresDriver;
pub use source::{Migration, MigrationSource};
