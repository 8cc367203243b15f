//! Statement executor: one script, one transaction

use crate::executor::{DbError, Session};
use crate::migration::MigrationError;
use crate::transaction::Transaction;

/// Runs whole SQL scripts atomically on a session
///
/// A script may hold many statements; either all of them take effect or none
/// do. The session is back in auto-commit mode when any method returns.
pub struct StatementExecutor<'s> {
    session: &'s dyn Session,
}

impl<'s> StatementExecutor<'s> {
    pub fn new(session: &'s dyn Session) -> Self {
        Self { session }
    }

    /// Run `sql` in its own transaction
    ///
    /// # Errors
    ///
    /// `ExecutionFailed` (rolled back) or `PartiallyApplied` (connection lost during commit).
    pub fn run(&self, script: &str, sql: &str) -> Result<(), MigrationError> {
        self.run_with(script, sql, || Ok(()))
    }

    /// Run `sql`, then `then`, in one transaction
    ///
    /// `then` carries the ledger write that must commit together with the
    /// script. An error from it rolls the script back too.
    pub fn run_with<F>(&self, script: &str, sql: &str, then: F) -> Result<(), MigrationError>
    where
        F: FnOnce() -> Result<(), MigrationError>,
    {
        let tx = Transaction::begin(self.session)?;

        if let Err(source) = self.session.batch_execute(sql) {
            log::error!("Migration script {} failed: {}", script, source);
            abandon(tx, script);
            return Err(MigrationError::ExecutionFailed {
                script: script.to_string(),
                sql: sql.to_string(),
                source,
            });
        }

        if let Err(e) = then() {
            log::error!("Bookkeeping for {} failed, rolling back: {}", script, e);
            abandon(tx, script);
            return Err(e);
        }

        tx.commit().map_err(|source| commit_failed(script, sql, source))
    }
}

fn abandon(tx: Transaction<'_>, script: &str) {
    if let Err(e) = tx.rollback() {
        log::warn!("Rollback after failure in {} also failed: {}", script, e);
    }
}

/// A commit that never reached a verdict cannot be classified as rolled back
fn commit_failed(script: &str, sql: &str, source: DbError) -> MigrationError {
    if source.is_connection_lost() {
        log::error!(
            "Connection lost while committing {}; schema and ledger may be inconsistent",
            script
        );
        MigrationError::PartiallyApplied {
            script: script.to_string(),
            source,
        }
    } else {
        log::error!("Commit of {} failed: {}", script, source);
        MigrationError::ExecutionFailed {
            script: script.to_string(),
            sql: sql.to_string(),
            source,
        }
    }
}
