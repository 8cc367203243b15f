//! Migration status tracking

use crate::migration::file::MigrationScript;
use crate::migration::record::LedgerEntry;

/// Applied and pending migrations at one point in time
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Applied migrations (from the ledger), most recently applied first
    pub applied: Vec<LedgerEntry>,

    /// Pending migrations (from the source), ascending by version
    pub pending: Vec<MigrationScript>,

    /// Total number of migrations (applied + pending)
    pub total: usize,

    /// Number of applied migrations
    pub applied_count: usize,

    /// Number of pending migrations
    pub pending_count: usize,
}

impl MigrationStatus {
    /// Create a new `MigrationStatus`
    #[must_use]
    pub fn new(applied: Vec<LedgerEntry>, pending: Vec<MigrationScript>) -> Self {
        let applied_count = applied.len();
        let pending_count = pending.len();
        let total = applied_count + pending_count;

        Self {
            applied,
            pending,
            total,
            applied_count,
            pending_count,
        }
    }

    /// Check if all migrations are applied
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending_count == 0
    }

    /// The highest version among applied entries with well-formed names
    #[must_use]
    pub fn latest_applied_version(&self) -> Option<u64> {
        self.applied.iter().filter_map(LedgerEntry::version).max()
    }

    /// Get the next pending migration version
    #[must_use]
    pub fn next_pending_version(&self) -> Option<u64> {
        self.pending.first().map(|m| m.version)
    }
}

/// Outcome of a `migrate` run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrateReport {
    /// Scripts applied by this run, in application order
    pub applied: Vec<String>,

    /// Scripts already in the ledger and left alone
    pub skipped: usize,
}

impl MigrateReport {
    /// Nothing was pending
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}
