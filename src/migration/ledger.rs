//! Migration ledger: the durable record of applied migrations

use crate::executor::Session;
use crate::migration::record::LedgerEntry;
use crate::migration::state_table::LedgerTable;
use crate::migration::MigrationError;

/// Ledger operations over one session and one ledger table
///
/// `record` and `remove` do not open transactions of their own: callers issue
/// them inside the transaction that runs the matching script, so the script and
/// its ledger row commit or roll back together.
pub struct Ledger<'s> {
    session: &'s dyn Session,
    table: &'s LedgerTable,
}

impl<'s> Ledger<'s> {
    pub fn new(session: &'s dyn Session, table: &'s LedgerTable) -> Self {
        Self { session, table }
    }

    pub fn table(&self) -> &LedgerTable {
        self.table
    }

    /// Create the ledger table if absent. Safe to call on every run.
    pub fn ensure_exists(&self) -> Result<(), MigrationError> {
        self.session.create_ledger(self.table)?;
        log::debug!("Ledger table {} checked/created", self.table);
        Ok(())
    }

    /// Whether the ledger table exists; read-only paths use this instead of creating it.
    pub fn exists(&self) -> Result<bool, MigrationError> {
        Ok(self.session.ledger_exists(self.table)?)
    }

    pub fn is_applied(&self, name: &str) -> Result<bool, MigrationError> {
        let applied = self.session.ledger_contains(self.table, name)?;
        log::debug!("Migration {} applied: {}", name, applied);
        Ok(applied)
    }

    pub fn find(&self, name: &str) -> Result<Option<LedgerEntry>, MigrationError> {
        Ok(self.session.find_ledger_entry(self.table, name)?)
    }

    /// Insert the entry for `name`
    ///
    /// # Errors
    ///
    /// `LedgerConflict` if `name` is already recorded.
    pub fn record(&self, name: &str, checksum: Option<&str>) -> Result<(), MigrationError> {
        if self.session.ledger_contains(self.table, name)? {
            return Err(MigrationError::LedgerConflict {
                name: name.to_string(),
            });
        }
        self.session.insert_ledger_entry(self.table, name, checksum)?;
        log::debug!("Migration {} recorded in {}", name, self.table);
        Ok(())
    }

    /// Delete the entry for `name`
    ///
    /// # Errors
    ///
    /// `LedgerConflict` if no row was removed.
    pub fn remove(&self, name: &str) -> Result<(), MigrationError> {
        match self.session.delete_ledger_entry(self.table, name)? {
            0 => Err(MigrationError::LedgerConflict {
                name: name.to_string(),
            }),
            _ => {
                log::debug!("Migration {} removed from {}", name, self.table);
                Ok(())
            }
        }
    }

    pub fn most_recently_applied(&self) -> Result<Option<LedgerEntry>, MigrationError> {
        Ok(self.session.latest_ledger_entry(self.table)?)
    }

    /// Every entry, most recently applied first
    pub fn list_all(&self) -> Result<Vec<LedgerEntry>, MigrationError> {
        Ok(self.session.ledger_entries(self.table)?)
    }
}
