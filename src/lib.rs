//! Polystore - Unified Storage Library
//!
//! This crate puts one contract in front of several storage engines and
//! versions their schemas. It can be used as a library by services that need
//! a relational primary with optional cache, document and time-series
//! engines, or run as the standalone `polystore` operations binary.
//!
//! # Architecture
//!
//! - **Config**: YAML configuration with `${VAR:-default}` expansion
//! - **Storage**: PostgreSQL, Redis, MongoDB and TimescaleDB providers behind
//!   capability traits, owned by a [`StoreManager`]
//! - **Migrate**: Versioned SQL migrations per engine with a dirty-state
//!   machine and advisory locking
//!
//! # Example
//!
//! ```rust,ignore
//! use polystore::{AppConfig, Context, StoreManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AppConfig::load("configs/config.yaml")?;
//!     let mut store = StoreManager::from_app_config(&config);
//!     let ctx = Context::background();
//!
//!     store.connect(&ctx).await?;
//!     store.setup_migrations(&ctx, &config.migrations.path).await?;
//!     store.migrations().run_migrations(&ctx).await?;
//!
//!     if let Some(cache) = store.cache() {
//!         cache.set(&ctx, "greeting", "hello", None).await?;
//!     }
//!
//!     store.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod migrate;
pub mod storage;

pub use config::{AppConfig, ConfigError, DatabaseConfig};
pub use migrate::{MigrationError, MigrationManager, Migrator};
pub use storage::{Context, EngineType, StorageError, StoreManager};
