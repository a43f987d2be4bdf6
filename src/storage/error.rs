//! Storage-specific error types.
//!
//! All storage operations return [`StorageError`] on failure, which can be
//! matched to determine the underlying cause (configuration, connection,
//! missing pool, not-found, transaction state, migration, etc.).

use thiserror::Error;

use crate::config::ConfigError;
use crate::migrate::MigrationError;
use crate::storage::types::EngineType;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Missing or invalid configuration, detected before any I/O.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Dial or ping failure against a specific engine.
    #[error("failed to connect to {engine}: {source}")]
    Connection {
        engine: EngineType,
        #[source]
        source: Box<StorageError>,
    },

    /// Operation attempted on a provider with no live pool or client.
    #[error("{0} database is not connected")]
    NotConnected(EngineType),

    /// Key, row or document absent. An expected outcome, not a fault.
    #[error("not found: {0}")]
    NotFound(String),

    /// Commit or rollback on a transaction that already ended.
    #[error("transaction already committed or rolled back")]
    TransactionClosed,

    /// The caller's deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The caller's context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// SQL engine error (sqlx).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Cache engine error (redis).
    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    /// Document engine error (mongodb).
    #[error("document store error: {0}")]
    Document(#[from] mongodb::error::Error),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),

    /// Identifier rejected by the allow-list.
    #[error("invalid identifier: '{0}'")]
    InvalidIdentifier(String),

    /// A required server-side extension is not installed.
    #[error("required extension '{0}' is not installed")]
    ExtensionMissing(String),

    /// Invalid data (e.g., undecodable column, unbindable parameter).
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Error attributed to one engine, used when aggregating.
    #[error("{engine}: {source}")]
    Engine {
        engine: EngineType,
        #[source]
        source: Box<StorageError>,
    },

    /// Several independent failures (close/health across engines).
    #[error("{}", join_errors(.0))]
    Multiple(Vec<StorageError>),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

fn join_errors(errors: &[StorageError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl StorageError {
    /// Wrap an error as a connection failure against `engine`.
    pub fn connection(engine: EngineType, source: impl Into<StorageError>) -> Self {
        Self::Connection {
            engine,
            source: Box::new(source.into()),
        }
    }

    /// Attribute an error to `engine`.
    pub fn engine(engine: EngineType, source: impl Into<StorageError>) -> Self {
        Self::Engine {
            engine,
            source: Box::new(source.into()),
        }
    }

    /// Collapse accumulated errors: `Ok` when empty, the error itself when
    /// single, `Multiple` otherwise.
    pub fn from_many(mut errors: Vec<StorageError>) -> Result<(), StorageError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }

    /// True for an absent key, row or document.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Database(sqlx::Error::RowNotFound) => true,
            Self::Engine { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// True when a deadline elapsed, locally or inside a driver.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Database(sqlx::Error::PoolTimedOut) => true,
            Self::Cache(e) => e.is_timeout(),
            Self::Connection { source, .. } | Self::Engine { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// True when the provider had no live pool or client.
    pub fn is_not_connected(&self) -> bool {
        match self {
            Self::NotConnected(_) => true,
            Self::Engine { source, .. } => source.is_not_connected(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_many() {
        assert!(StorageError::from_many(vec![]).is_ok());

        let single = StorageError::from_many(vec![StorageError::Timeout]).unwrap_err();
        assert!(matches!(single, StorageError::Timeout));

        let multiple = StorageError::from_many(vec![
            StorageError::engine(EngineType::Cache, StorageError::Timeout),
            StorageError::NotConnected(EngineType::Document),
        ])
        .unwrap_err();
        let message = multiple.to_string();
        assert!(message.contains("cache: operation timed out"));
        assert!(message.contains("document database is not connected"));
    }

    #[test]
    fn test_classification() {
        assert!(StorageError::NotFound("key".into()).is_not_found());
        assert!(StorageError::Database(sqlx::Error::RowNotFound).is_not_found());
        assert!(!StorageError::Timeout.is_not_found());

        assert!(StorageError::Timeout.is_timeout());
        assert!(StorageError::connection(EngineType::Relational, StorageError::Timeout).is_timeout());

        let wrapped = StorageError::engine(
            EngineType::Cache,
            StorageError::NotConnected(EngineType::Cache),
        );
        assert!(wrapped.is_not_connected());
    }

    #[test]
    fn test_connection_error_names_engine() {
        let err = StorageError::connection(EngineType::TimeSeries, StorageError::Timeout);
        assert_eq!(
            err.to_string(),
            "failed to connect to time-series: operation timed out"
        );
    }
}
