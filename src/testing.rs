//! In-memory `Session` for tests
//!
//! `MemoryDatabase` models the parts of PostgreSQL the migration core relies
//! on: transactions that stage work until commit, an aborted state after a
//! failed statement, ledger tables, and session-scoped advisory locks that are
//! re-entrant per session and freed when the session is dropped.
//!
//! Scripts are not interpreted. A script "runs" by being appended to the
//! executed list; failures are injected with [`MemoryDatabase::fail_scripts_containing`].

use crate::executor::{DbError, Session};
use crate::migration::record::LedgerEntry;
use crate::migration::state_table::LedgerTable;
use chrono::{DateTime, Utc};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Committed (or staged) contents of the database
#[derive(Debug, Clone, Default)]
struct Data {
    tables: HashMap<String, Vec<LedgerEntry>>,
    executed: Vec<String>,
    next_id: i64,
}

#[derive(Debug, Default)]
struct Locks {
    /// key -> (holding session, hold count)
    held: HashMap<i64, (u64, u32)>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_markers: Vec<String>,
    lose_connection_on_commit: bool,
    fail_unlock: bool,
    /// Fixed `applied_at` for new ledger rows
    clock: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Shared {
    data: Data,
    locks: Locks,
    faults: Faults,
}

/// A database shared by any number of [`MemorySession`]s
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    shared: Arc<Mutex<Shared>>,
    next_session: Arc<AtomicU64>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session
    pub fn session(&self) -> MemorySession {
        MemorySession {
            db: self.clone(),
            id: self.next_session.fetch_add(1, Ordering::SeqCst) + 1,
            tx: RefCell::new(TxState::Idle),
        }
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every script text committed so far, in commit order
    pub fn executed_scripts(&self) -> Vec<String> {
        self.shared().data.executed.clone()
    }

    /// Names in a ledger table, in insertion order; empty if the table is absent
    pub fn ledger_names(&self, table: &LedgerTable) -> Vec<String> {
        self.shared()
            .data
            .tables
            .get(table.as_str())
            .map(|rows| rows.iter().map(|row| row.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Session currently holding advisory lock `key`
    pub fn lock_holder(&self, key: i64) -> Option<u64> {
        self.shared().locks.held.get(&key).map(|(session, _)| *session)
    }

    /// Make every script containing `marker` fail
    pub fn fail_scripts_containing(&self, marker: &str) {
        self.shared().faults.failing_markers.push(marker.to_string());
    }

    pub fn clear_failures(&self) {
        self.shared().faults.failing_markers.clear();
    }

    /// Drop the connection instead of committing
    pub fn lose_connection_on_commit(&self, enabled: bool) {
        self.shared().faults.lose_connection_on_commit = enabled;
    }

    /// Make `advisory_unlock` fail
    pub fn fail_unlock(&self, enabled: bool) {
        self.shared().faults.fail_unlock = enabled;
    }

    /// Stamp new ledger rows with `at` instead of the current time, e.g. to
    /// simulate a clock step or a session in another time zone
    pub fn set_clock(&self, at: Option<DateTime<Utc>>) {
        self.shared().faults.clock = at;
    }
}

#[derive(Debug)]
enum TxState {
    Idle,
    Open(Data),
    Aborted,
}

/// One session on a [`MemoryDatabase`]
#[derive(Debug)]
pub struct MemorySession {
    db: MemoryDatabase,
    id: u64,
    tx: RefCell<TxState>,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn in_transaction(&self) -> bool {
        !matches!(*self.tx.borrow(), TxState::Idle)
    }

    /// Run `f` against the transaction's working copy, or directly against
    /// committed data in auto-commit mode. An error aborts an open transaction.
    fn with_data<T>(&self, f: impl FnOnce(&mut Data, &Faults) -> Result<T, DbError>) -> Result<T, DbError> {
        let mut shared = self.db.shared();
        let mut tx = self.tx.borrow_mut();

        match &mut *tx {
            TxState::Aborted => Err(DbError::Query(
                "current transaction is aborted, commands ignored until end of transaction block".to_string(),
            )),
            TxState::Open(work) => {
                let result = f(work, &shared.faults);
                if result.is_err() {
                    *tx = TxState::Aborted;
                }
                result
            }
            TxState::Idle => {
                let Shared { data, faults, .. } = &mut *shared;
                let mut work = data.clone();
                let result = f(&mut work, faults)?;
                *data = work;
                Ok(result)
            }
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Data) -> T) -> Result<T, DbError> {
        self.with_data(|data, _| Ok(f(data)))
    }
}

fn missing_table(table: &LedgerTable) -> DbError {
    DbError::Query(format!("relation \"{table}\" does not exist"))
}

fn rows<'d>(data: &'d Data, table: &LedgerTable) -> Result<&'d Vec<LedgerEntry>, DbError> {
    data.tables.get(table.as_str()).ok_or_else(|| missing_table(table))
}

fn latest_first(rows: &[LedgerEntry]) -> Vec<LedgerEntry> {
    let mut sorted = rows.to_vec();
    sorted.sort_by(|a, b| b.id.cmp(&a.id));
    sorted
}

impl Session for MemorySession {
    fn batch_execute(&self, sql: &str) -> Result<(), DbError> {
        self.with_data(|data, faults| {
            if let Some(marker) = faults.failing_markers.iter().find(|m| sql.contains(m.as_str())) {
                return Err(DbError::Query(format!("syntax error at or near \"{marker}\"")));
            }
            data.executed.push(sql.to_string());
            Ok(())
        })
    }

    fn begin(&self) -> Result<(), DbError> {
        let snapshot = self.db.shared().data.clone();
        let mut tx = self.tx.borrow_mut();
        if !matches!(*tx, TxState::Idle) {
            log::warn!("there is already a transaction in progress");
            return Ok(());
        }
        *tx = TxState::Open(snapshot);
        Ok(())
    }

    fn commit(&self) -> Result<(), DbError> {
        let mut shared = self.db.shared();
        let state = std::mem::replace(&mut *self.tx.borrow_mut(), TxState::Idle);

        if shared.faults.lose_connection_on_commit {
            return Err(DbError::ConnectionLost("server closed the connection unexpectedly".to_string()));
        }

        match state {
            TxState::Open(work) => {
                shared.data = work;
                Ok(())
            }
            // PostgreSQL answers COMMIT of a failed transaction with ROLLBACK
            TxState::Aborted | TxState::Idle => Ok(()),
        }
    }

    fn rollback(&self) -> Result<(), DbError> {
        *self.tx.borrow_mut() = TxState::Idle;
        Ok(())
    }

    fn ping(&self) -> Result<(), DbError> {
        Ok(())
    }

    fn try_advisory_lock(&self, key: i64) -> Result<bool, DbError> {
        let mut shared = self.db.shared();
        match shared.locks.held.get_mut(&key) {
            Some((holder, count)) if *holder == self.id => {
                *count += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                shared.locks.held.insert(key, (self.id, 1));
                Ok(true)
            }
        }
    }

    fn advisory_unlock(&self, key: i64) -> Result<bool, DbError> {
        let mut shared = self.db.shared();
        if shared.faults.fail_unlock {
            return Err(DbError::ConnectionLost("could not send data to server".to_string()));
        }

        match shared.locks.held.get_mut(&key) {
            Some((holder, count)) if *holder == self.id => {
                *count -= 1;
                if *count == 0 {
                    shared.locks.held.remove(&key);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn ledger_exists(&self, table: &LedgerTable) -> Result<bool, DbError> {
        self.read(|data| data.tables.contains_key(table.as_str()))
    }

    fn create_ledger(&self, table: &LedgerTable) -> Result<(), DbError> {
        self.with_data(|data, _| {
            data.tables.entry(table.as_str().to_string()).or_default();
            Ok(())
        })
    }

    fn ledger_contains(&self, table: &LedgerTable, name: &str) -> Result<bool, DbError> {
        self.with_data(|data, _| Ok(rows(data, table)?.iter().any(|row| row.name == name)))
    }

    fn find_ledger_entry(&self, table: &LedgerTable, name: &str) -> Result<Option<LedgerEntry>, DbError> {
        self.with_data(|data, _| Ok(rows(data, table)?.iter().find(|row| row.name == name).cloned()))
    }

    fn insert_ledger_entry(&self, table: &LedgerTable, name: &str, checksum: Option<&str>) -> Result<(), DbError> {
        self.with_data(|data, faults| {
            if rows(data, table)?.iter().any(|row| row.name == name) {
                return Err(DbError::Query(format!(
                    "duplicate key value violates unique constraint on \"{table}\": {name}"
                )));
            }
            data.next_id += 1;
            let entry = LedgerEntry::new(data.next_id, name.to_string(), faults.clock.unwrap_or_else(Utc::now), checksum.map(str::to_string));
            data.tables
                .get_mut(table.as_str())
                .ok_or_else(|| missing_table(table))?
                .push(entry);
            Ok(())
        })
    }

    fn delete_ledger_entry(&self, table: &LedgerTable, name: &str) -> Result<u64, DbError> {
        self.with_data(|data, _| {
            let rows = data
                .tables
                .get_mut(table.as_str())
                .ok_or_else(|| missing_table(table))?;
            let before = rows.len();
            rows.retain(|row| row.name != name);
            Ok((before - rows.len()) as u64)
        })
    }

    fn latest_ledger_entry(&self, table: &LedgerTable) -> Result<Option<LedgerEntry>, DbError> {
        self.with_data(|data, _| Ok(latest_first(rows(data, table)?).into_iter().next()))
    }

    fn ledger_entries(&self, table: &LedgerTable) -> Result<Vec<LedgerEntry>, DbError> {
        self.with_data(|data, _| Ok(latest_first(rows(data, table)?)))
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let mut shared = self.db.shared();
        let id = self.id;
        shared.locks.held.retain(|_, (holder, _)| *holder != id);
    }
}
