//! Session Module
//!
//! Provides the `Session` trait, the single seam between the migration core and
//! the database, plus `PgSession`, its implementation over `may_postgres`.
//!
//! Every method maps to one statement the core needs. Ledger queries always bind
//! the migration identifier as a parameter; the ledger table name is a
//! [`LedgerTable`], which only admits plain SQL identifiers.

use crate::migration::record::LedgerEntry;
use crate::migration::state_table::LedgerTable;
use may_postgres::types::ToSql;
use may_postgres::{Client, Error as PostgresError, Row};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Driver-level error type
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// `PostgreSQL` error from `may_postgres`
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] PostgresError),
    /// Statement was rejected by the server
    #[error("Query error: {0}")]
    Query(String),
    /// The session is gone; the outcome of the last statement is unknown
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    /// Row parsing/conversion error
    #[error("Parse error: {0}")]
    Parse(String),
}

impl DbError {
    /// Whether the underlying session was closed while the statement was in flight.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            DbError::Postgres(e) => e.is_closed(),
            DbError::ConnectionLost(_) => true,
            DbError::Query(_) | DbError::Parse(_) => false,
        }
    }
}

/// A single database session, exclusively owned by one migration run.
///
/// Advisory locks taken through a session are scoped to it: the database drops
/// them when the session ends, including abnormal disconnects.
pub trait Session {
    /// Execute one or more semicolon separated statements without parameters.
    fn batch_execute(&self, sql: &str) -> Result<(), DbError>;

    /// Open a transaction; the session leaves auto-commit mode until commit/rollback.
    fn begin(&self) -> Result<(), DbError>;

    /// Commit the open transaction.
    fn commit(&self) -> Result<(), DbError>;

    /// Roll back the open transaction.
    fn rollback(&self) -> Result<(), DbError>;

    /// Round trip used as a liveness probe.
    fn ping(&self) -> Result<(), DbError>;

    /// Non-blocking attempt at the session-level advisory lock `key`.
    ///
    /// Returns `false` when another session holds it.
    fn try_advisory_lock(&self, key: i64) -> Result<bool, DbError>;

    /// Release one hold of advisory lock `key`. Returns `false` if this session did not hold it.
    fn advisory_unlock(&self, key: i64) -> Result<bool, DbError>;

    /// Whether the ledger table exists.
    fn ledger_exists(&self, table: &LedgerTable) -> Result<bool, DbError>;

    /// Create the ledger table (and its index) if absent.
    fn create_ledger(&self, table: &LedgerTable) -> Result<(), DbError>;

    /// Whether `name` has a ledger row.
    fn ledger_contains(&self, table: &LedgerTable, name: &str) -> Result<bool, DbError>;

    /// The ledger row for `name`, if any.
    fn find_ledger_entry(&self, table: &LedgerTable, name: &str) -> Result<Option<LedgerEntry>, DbError>;

    /// Insert a ledger row; `applied_at` is assigned by the server.
    fn insert_ledger_entry(&self, table: &LedgerTable, name: &str, checksum: Option<&str>) -> Result<(), DbError>;

    /// Delete the ledger row for `name`, returning the number of rows removed.
    fn delete_ledger_entry(&self, table: &LedgerTable, name: &str) -> Result<u64, DbError>;

    /// The most recently applied ledger row.
    fn latest_ledger_entry(&self, table: &LedgerTable) -> Result<Option<LedgerEntry>, DbError>;

    /// All ledger rows, most recently applied first.
    fn ledger_entries(&self, table: &LedgerTable) -> Result<Vec<LedgerEntry>, DbError>;
}

/// Implementation of `Session` for `may_postgres::Client`
pub struct PgSession {
    client: Client,
}

impl PgSession {
    /// Create a new session from a connected `may_postgres::Client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Get a reference to the underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Consume the session and return the underlying client
    pub fn into_client(self) -> Client {
        self.client
    }

    /// Check that the connection is alive and answering queries
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the probe query fails.
    pub fn check_health(&self) -> Result<(), DbError> {
        crate::connection::check_connection_health(&self.client)
    }

    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::statement_span(query).entered();

        self.client.execute(query, params).map_err(DbError::from)
    }

    fn query(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::statement_span(query).entered();

        self.client.query(query, params).map_err(DbError::from)
    }

    fn query_flag(&self, query: &str, params: &[&dyn ToSql]) -> Result<bool, DbError> {
        let rows = self.query(query, params)?;
        let row = rows
            .first()
            .ok_or_else(|| DbError::Query(format!("no row returned by: {}", query.trim())))?;
        let flag: Option<bool> = row.get(0);
        Ok(flag.unwrap_or(false))
    }
}

impl Session for PgSession {
    fn batch_execute(&self, sql: &str) -> Result<(), DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::statement_span(sql).entered();

        self.client.batch_execute(sql).map_err(DbError::from)
    }

    fn begin(&self) -> Result<(), DbError> {
        self.batch_execute("BEGIN")
    }

    fn commit(&self) -> Result<(), DbError> {
        self.batch_execute("COMMIT")
    }

    fn rollback(&self) -> Result<(), DbError> {
        self.batch_execute("ROLLBACK")
    }

    fn ping(&self) -> Result<(), DbError> {
        self.check_health()
    }

    fn try_advisory_lock(&self, key: i64) -> Result<bool, DbError> {
        self.query_flag("SELECT pg_try_advisory_lock($1)", &[&key])
    }

    fn advisory_unlock(&self, key: i64) -> Result<bool, DbError> {
        self.query_flag("SELECT pg_advisory_unlock($1)", &[&key])
    }

    fn ledger_exists(&self, table: &LedgerTable) -> Result<bool, DbError> {
        let name = table.as_str();
        self.query_flag("SELECT to_regclass($1::text) IS NOT NULL", &[&name])
    }

    fn create_ledger(&self, table: &LedgerTable) -> Result<(), DbError> {
        for statement in table.create_statements() {
            self.execute(&statement, &[])?;
        }
        Ok(())
    }

    fn ledger_contains(&self, table: &LedgerTable, name: &str) -> Result<bool, DbError> {
        self.query_flag(&table.contains_sql(), &[&name])
    }

    fn find_ledger_entry(&self, table: &LedgerTable, name: &str) -> Result<Option<LedgerEntry>, DbError> {
        let rows = self.query(&table.find_sql(), &[&name])?;
        rows.first().map(LedgerEntry::from_row).transpose()
    }

    fn insert_ledger_entry(&self, table: &LedgerTable, name: &str, checksum: Option<&str>) -> Result<(), DbError> {
        self.execute(&table.insert_sql(), &[&name, &checksum])?;
        Ok(())
    }

    fn delete_ledger_entry(&self, table: &LedgerTable, name: &str) -> Result<u64, DbError> {
        self.execute(&table.delete_sql(), &[&name])
    }

    fn latest_ledger_entry(&self, table: &LedgerTable) -> Result<Option<LedgerEntry>, DbError> {
        let rows = self.query(&table.latest_sql(), &[])?;
        rows.first().map(LedgerEntry::from_row).transpose()
    }

    fn ledger_entries(&self, table: &LedgerTable) -> Result<Vec<LedgerEntry>, DbError> {
        self.query(&table.list_sql(), &[])?
            .iter()
            .map(LedgerEntry::from_row)
            .collect()
    }
}
