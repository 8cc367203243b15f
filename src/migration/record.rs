//! `LedgerEntry` - Represents rows of the migration ledger table

use crate::executor::DbError;
use chrono::{DateTime, NaiveDateTime, Utc};

/// One applied migration, as recorded in the ledger table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Surrogate key, increasing in insertion order
    pub id: i64,

    /// Script file name, e.g. `V1__create_authors.sql`
    pub name: String,

    /// When the migration was applied (server clock)
    pub applied_at: DateTime<Utc>,

    /// `SHA-256` checksum of the script at apply time (`None` for rows written without one)
    pub checksum: Option<String>,
}

impl LedgerEntry {
    /// Create a new `LedgerEntry`
    #[must_use]
    pub fn new(id: i64, name: String, applied_at: DateTime<Utc>, checksum: Option<String>) -> Self {
        Self {
            id,
            name,
            applied_at,
            checksum,
        }
    }

    /// Create a `LedgerEntry` from a database row
    ///
    /// Expected column order: `id` (bigint), `file_name`, `applied_at` (as text), `checksum`
    ///
    /// # Errors
    ///
    /// Returns `DbError::Parse` if the timestamp text is in no recognised format.
    pub fn from_row(row: &may_postgres::Row) -> Result<Self, DbError> {
        let id: i64 = row.get(0);
        let name: String = row.get(1);
        let applied_at_str: String = row.get(2);
        let checksum: Option<String> = row.get(3);

        Ok(Self {
            id,
            name,
            applied_at: parse_timestamp(&applied_at_str)?,
            checksum,
        })
    }

    /// The version parsed from the entry's name, if it is a well-formed forward script name
    pub fn version(&self) -> Option<u64> {
        crate::migration::ScriptName::parse(&self.name)
            .ok()
            .flatten()
            .map(|n| n.version)
    }
}

/// Parse a `TIMESTAMP` rendered as text by the server
///
/// # Errors
///
/// Returns `DbError::Parse` when none of the accepted formats match.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, DbError> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
    ];

    FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| DbError::Parse(format!("Failed to parse timestamp '{text}': unrecognized format")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_parse_timestamp_formats() {
        let with_fraction = parse_timestamp("2026-10-19 08:15:42.123456").unwrap();
        assert_eq!(with_fraction.year(), 2026);
        assert_eq!(with_fraction.second(), 42);

        let plain = parse_timestamp("2026-10-19 08:15:42").unwrap();
        assert_eq!(plain.minute(), 15);

        let iso = parse_timestamp("2026-10-19T08:15:42").unwrap();
        assert_eq!(iso, plain);
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        let err = parse_timestamp("yesterday").unwrap_err();
        assert!(err.to_string().contains("yesterday"));
    }

    #[test]
    fn test_entry_version() {
        let entry = LedgerEntry::new(1, "V12__create_books.sql".to_string(), Utc::now(), None);
        assert_eq!(entry.version(), Some(12));

        let legacy = LedgerEntry::new(2, "init.sql".to_string(), Utc::now(), None);
        assert_eq!(legacy.version(), None);
    }
}
