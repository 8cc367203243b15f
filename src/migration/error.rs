//! Migration-specific error types

use crate::executor::DbError;

/// Migration-specific errors
///
/// One variant per failure class an operator has to tell apart; every layer
/// returns these directly instead of re-wrapping.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Database error outside of script execution (ledger, lock, transaction control)
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Another session holds the migration lock
    #[error(
        "Migrations are already running elsewhere (advisory lock {key} is held by another session). \
         Try again once the other run has finished."
    )]
    LockBusy { key: i64 },

    /// A script name matched the naming pattern but its version is not a non-negative integer
    #[error("Invalid version in migration script name '{name}': expected V<integer>__<label>.sql")]
    InvalidVersion { name: String },

    /// Two forward scripts share one version
    #[error("Duplicate migration version {version}: '{first}' and '{second}'")]
    DuplicateVersion {
        version: u64,
        first: String,
        second: String,
    },

    /// The content store itself could not be read
    #[error("Migration source {location} is unavailable: {source}")]
    SourceUnavailable {
        location: String,
        #[source]
        source: std::io::Error,
    },

    /// The named script does not exist in the content store
    #[error("Migration script not found: {name}")]
    ScriptNotFound { name: String },

    /// A script failed inside its transaction; nothing from it was committed
    #[error("Migration script '{script}' failed and was rolled back: {source}")]
    ExecutionFailed {
        script: String,
        sql: String,
        #[source]
        source: DbError,
    },

    /// Rollback requested for a migration without an undo script
    #[error("No undo script '{undo}' for applied migration '{migration}'; the ledger was left untouched")]
    MissingUndo { migration: String, undo: String },

    /// The session dropped while committing; schema and ledger may disagree
    #[error(
        "Migration '{script}' may be partially applied: the connection was lost while committing ({source}). \
         Inspect the schema and the ledger before running again."
    )]
    PartiallyApplied {
        script: String,
        #[source]
        source: DbError,
    },

    /// An applied script was edited after it ran
    #[error(
        "Migration '{name}' has been modified after being applied.\n\
         Stored checksum: {stored}\n\
         Current checksum: {current}"
    )]
    ChecksumMismatch {
        name: String,
        stored: String,
        current: String,
    },

    /// The ledger disagrees with the lock holder's view: the row to record
    /// already exists, or the row to remove is gone
    #[error("Ledger entry '{name}' changed while the migration lock was held")]
    LedgerConflict { name: String },

    /// The configured ledger table name is not a plain SQL identifier
    #[error("Invalid ledger table name '{0}': expected [schema.]identifier of letters, digits and underscores")]
    InvalidTableName(String),
}

impl MigrationError {
    /// Whether re-running the same command later can succeed without operator changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MigrationError::LockBusy { .. })
    }

    /// Whether the migration set was rejected before anything touched the database.
    pub fn is_discovery_error(&self) -> bool {
        matches!(
            self,
            MigrationError::InvalidVersion { .. } | MigrationError::DuplicateVersion { .. }
        )
    }
}
