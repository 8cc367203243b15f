//! Ledger table schema and statement text

use crate::migration::checksum::calculate_checksum;
use crate::migration::MigrationError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Default ledger table, shared with databases migrated by earlier tooling
pub const DEFAULT_LEDGER_TABLE: &str = "migration_history";

/// PostgreSQL truncates identifiers beyond this many bytes
const MAX_IDENTIFIER_LEN: usize = 63;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}(\.[A-Za-z_][A-Za-z0-9_]{0,62})?$")
        .unwrap_or_else(|e| panic!("invalid identifier pattern: {e}"))
});

/// Name of the ledger table, optionally schema qualified
///
/// Identifiers cannot be bound as query parameters, so the name is restricted
/// to letters, digits and underscores before it is ever spliced into SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTable(String);

impl LedgerTable {
    /// Validate and wrap a table name
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidTableName` for anything but `[schema.]identifier`.
    pub fn new(name: impl Into<String>) -> Result<Self, MigrationError> {
        let name = name.into();
        if IDENTIFIER.is_match(&name) {
            Ok(Self(name))
        } else {
            Err(MigrationError::InvalidTableName(name))
        }
    }

    /// The table name as written in SQL
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The table name without its schema
    pub fn unqualified(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    /// Index on `applied_at`
    ///
    /// An index always lives in its table's schema, so the unqualified table
    /// name keeps index names distinct. Names that would be truncated get a
    /// hash suffix instead.
    pub fn index_name(&self) -> String {
        let table = self.unqualified();
        let name = format!("idx_{table}_applied_at");
        if name.len() <= MAX_IDENTIFIER_LEN {
            return name;
        }
        format!("idx_{}_{}", &table[..40], &calculate_checksum(table)[..16])
    }

    /// DDL run by `ensure_exists`, each statement idempotent
    ///
    /// Tables created by earlier tooling lack the `checksum` column; it is added in place.
    pub fn create_statements(&self) -> Vec<String> {
        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 id SERIAL PRIMARY KEY, \
                 file_name VARCHAR(255) NOT NULL UNIQUE, \
                 applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 checksum VARCHAR(64))",
                self.0
            ),
            format!("ALTER TABLE {} ADD COLUMN IF NOT EXISTS checksum VARCHAR(64)", self.0),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (applied_at)",
                self.index_name(),
                self.0
            ),
        ]
    }

    /// `$1` = file name
    pub fn contains_sql(&self) -> String {
        format!("SELECT EXISTS (SELECT 1 FROM {} WHERE file_name = $1)", self.0)
    }

    /// `$1` = file name
    pub fn find_sql(&self) -> String {
        format!("{} WHERE file_name = $1", self.select_columns())
    }

    /// `$1` = file name, `$2` = checksum
    pub fn insert_sql(&self) -> String {
        format!("INSERT INTO {} (file_name, checksum) VALUES ($1, $2)", self.0)
    }

    /// `$1` = file name
    pub fn delete_sql(&self) -> String {
        format!("DELETE FROM {} WHERE file_name = $1", self.0)
    }

    /// Application order is the SERIAL id. `applied_at` is wall-clock time in
    /// the session's zone and can run backwards across sessions.
    pub fn latest_sql(&self) -> String {
        format!("{} ORDER BY id DESC LIMIT 1", self.select_columns())
    }

    pub fn list_sql(&self) -> String {
        format!("{} ORDER BY id DESC", self.select_columns())
    }

    fn select_columns(&self) -> String {
        format!(
            "SELECT id::bigint, file_name, applied_at::text, checksum FROM {}",
            self.0
        )
    }
}

impl Default for LedgerTable {
    fn default() -> Self {
        Self(DEFAULT_LEDGER_TABLE.to_string())
    }
}

impl fmt::Display for LedgerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
