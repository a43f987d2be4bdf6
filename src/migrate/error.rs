//! Migration error types.

use thiserror::Error;

use crate::storage::StorageError;

/// Errors raised by the migration state machine.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Nothing to apply. Callers usually treat this as success.
    #[error("no change")]
    NoChange,

    /// A previous migration failed half-way; only `force` clears this.
    #[error("dirty database version {0}, fix and force version")]
    Dirty(u64),

    /// No version has been applied yet.
    #[error("no migration has been applied")]
    NilVersion,

    /// `steps(n)` ran out of migrations `n` short of the request.
    #[error("fewer migrations available than requested, short by {0}")]
    ShortLimit(u64),

    /// A migration body failed; the version is left dirty.
    #[error("migration {version} failed: {source}")]
    Apply {
        version: u64,
        #[source]
        source: Box<StorageError>,
    },

    /// Malformed or missing migration files.
    #[error("migration source: {0}")]
    Source(String),

    /// Version absent from the migration source.
    #[error("no migration found for version {0}")]
    UnknownVersion(u64),

    /// Could not take the migration lock.
    #[error("failed to acquire migration lock: {0}")]
    Lock(String),

    /// Driver-level failure not covered by the engine error types.
    #[error("migration driver: {0}")]
    Driver(String),
}

/// Treat [`MigrationError::NoChange`] and [`MigrationError::NilVersion`]
/// (nothing to roll back) as success.
///
/// Returns whether anything was applied.
pub fn allow_no_change(result: Result<(), StorageError>) -> Result<bool, StorageError> {
    match result {
        Ok(()) => Ok(true),
        Err(StorageError::Migration(MigrationError::NoChange | MigrationError::NilVersion)) => {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_no_change() {
        assert!(allow_no_change(Ok(())).unwrap());
        assert!(!allow_no_change(Err(MigrationError::NoChange.into())).unwrap());

        let err = allow_no_change(Err(MigrationError::Dirty(3).into())).unwrap_err();
        assert!(matches!(err, StorageError::Migration(MigrationError::Dirty(3))));
    }

    #[test]
    fn test_apply_error_message() {
        let err = MigrationError::Apply {
            version: 7,
            source: Box::new(StorageError::Internal("syntax error".to_string())),
        };
        assert_eq!(
            err.to_string(),
            "migration 7 failed: internal error: syntax error"
        );
    }
}
