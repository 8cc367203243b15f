//! Migrator - Core migration execution engine

use crate::config::MigrationSettings;
use crate::executor::Session;
use crate::migration::checksum::{calculate_checksum, ChecksumPolicy};
use crate::migration::file::MigrationScript;
use crate::migration::ledger::Ledger;
use crate::migration::lock::{AdvisoryLock, LockGuard};
use crate::migration::record::LedgerEntry;
use crate::migration::runner::StatementExecutor;
use crate::migration::source::MigrationSource;
use crate::migration::status::{MigrateReport, MigrationStatus};
use crate::migration::MigrationError;
use std::collections::{HashMap, HashSet};
use std::time::Instant;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Core migration execution engine
///
/// Owns nothing: it borrows one session for its whole lifetime, the source the
/// scripts come from, and the settings resolved at startup.
///
/// `migrate` and `rollback` run entirely under the advisory lock, which is
/// released on every exit path. `status`, `pending` and `overview` are
/// read-only and take no lock.
pub struct Migrator<'a> {
    session: &'a dyn Session,
    source: &'a MigrationSource,
    settings: &'a MigrationSettings,
}

impl<'a> Migrator<'a> {
    pub fn new(session: &'a dyn Session, source: &'a MigrationSource, settings: &'a MigrationSettings) -> Self {
        Self {
            session,
            source,
            settings,
        }
    }

    pub fn settings(&self) -> &MigrationSettings {
        self.settings
    }

    fn ledger(&self) -> Ledger<'a> {
        Ledger::new(self.session, &self.settings.table)
    }

    fn lock(&self) -> Result<LockGuard<'a>, MigrationError> {
        log::debug!("Acquiring migration lock {}", self.settings.lock_key);
        AdvisoryLock::new(self.session, self.settings.lock_key, self.settings.lock_timeout).guard()
    }

    /// Apply every pending migration in ascending version order
    ///
    /// Stops at the first failure; scripts after it are not attempted and the
    /// failed script leaves no trace in the schema or the ledger.
    ///
    /// # Errors
    ///
    /// `LockBusy` when another run is in progress, discovery errors before
    /// anything runs, `ChecksumMismatch` under `ChecksumPolicy::Verify`, or the
    /// first execution failure.
    pub fn migrate(&self) -> Result<MigrateReport, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::migrate_span().entered();

        let result = self.lock().and_then(|guard| {
            let report = self.migrate_locked();
            drop(guard);
            report
        });

        #[cfg(feature = "metrics")]
        if let Err(ref e) = result {
            if !e.is_retryable() {
                METRICS.record_failure();
            }
        }

        result
    }

    fn migrate_locked(&self) -> Result<MigrateReport, MigrationError> {
        let ledger = self.ledger();

        log::debug!("Ensuring ledger table {}", ledger.table());
        ledger.ensure_exists()?;

        log::debug!("Discovering migrations in {}", self.source.location());
        let scripts = self.source.discover()?;

        self.check_applied_checksums(&ledger, &scripts)?;

        let mut report = MigrateReport::default();
        for script in &scripts {
            if ledger.is_applied(&script.name)? {
                report.skipped += 1;
                continue;
            }
            self.apply(&ledger, script)?;
            report.applied.push(script.name.clone());
        }

        if report.is_noop() {
            log::info!("Database is up to date ({} migration(s) already applied)", report.skipped);
        } else {
            log::info!("Applied {} migration(s)", report.applied.len());
        }
        Ok(report)
    }

    /// Execute one script and record it, atomically
    fn apply(&self, ledger: &Ledger<'_>, script: &MigrationScript) -> Result<(), MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::apply_span(&script.name).entered();

        let sql = self.source.read(&script.name)?;
        let checksum = calculate_checksum(&sql);

        log::debug!("Applying migration {}", script.name);
        let start = Instant::now();
        StatementExecutor::new(self.session).run_with(&script.name, &sql, || {
            ledger.record(&script.name, Some(checksum.as_str()))
        })?;
        let elapsed = start.elapsed();

        #[cfg(feature = "metrics")]
        METRICS.record_applied(elapsed);

        log::info!("Applied migration {} ({} ms)", script.name, elapsed.as_millis());
        Ok(())
    }

    /// Compare applied scripts against their stored checksums
    ///
    /// Rows recorded without a checksum are never flagged.
    fn check_applied_checksums(&self, ledger: &Ledger<'_>, scripts: &[MigrationScript]) -> Result<(), MigrationError> {
        let policy = self.settings.checksum_policy;
        if policy == ChecksumPolicy::Ignore {
            return Ok(());
        }

        let stored: HashMap<String, String> = ledger
            .list_all()?
            .into_iter()
            .filter_map(|entry| entry.checksum.map(|checksum| (entry.name, checksum)))
            .collect();

        for script in scripts {
            let Some(stored) = stored.get(&script.name) else {
                continue;
            };
            let current = calculate_checksum(&self.source.read(&script.name)?);
            if *stored == current {
                continue;
            }

            if policy == ChecksumPolicy::Verify {
                return Err(MigrationError::ChecksumMismatch {
                    name: script.name.clone(),
                    stored: stored.clone(),
                    current,
                });
            }
            log::warn!(
                "Migration {} has been modified after being applied (stored checksum {}, current {}); it will not be re-run",
                script.name,
                stored,
                current
            );
        }

        Ok(())
    }

    /// Undo the most recently applied migration
    ///
    /// Returns the removed ledger entry, or `None` when nothing was applied.
    ///
    /// # Errors
    ///
    /// `MissingUndo` leaves the ledger as it was; `ExecutionFailed` rolls the
    /// undo script back and also leaves the ledger as it was.
    pub fn rollback(&self) -> Result<Option<LedgerEntry>, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::rollback_span().entered();

        let result = self.lock().and_then(|guard| {
            let outcome = self.rollback_locked();
            drop(guard);
            outcome
        });

        #[cfg(feature = "metrics")]
        if let Err(ref e) = result {
            if !e.is_retryable() {
                METRICS.record_failure();
            }
        }

        result
    }

    fn rollback_locked(&self) -> Result<Option<LedgerEntry>, MigrationError> {
        let ledger = self.ledger();

        if !ledger.exists()? {
            log::info!("No migrations to roll back");
            return Ok(None);
        }

        let Some(entry) = ledger.most_recently_applied()? else {
            log::info!("No migrations to roll back");
            return Ok(None);
        };

        log::debug!("Rolling back migration {}", entry.name);
        let (undo_name, sql) = self.source.read_undo(&entry.name)?;

        let start = Instant::now();
        StatementExecutor::new(self.session).run_with(&undo_name, &sql, || ledger.remove(&entry.name))?;
        let elapsed = start.elapsed();

        #[cfg(feature = "metrics")]
        METRICS.record_rolled_back(elapsed);

        log::info!("Rolled back migration {} using {}", entry.name, undo_name);
        Ok(Some(entry))
    }

    /// Applied migrations, most recently applied first
    ///
    /// Never writes: an absent ledger table reads as an empty ledger.
    pub fn status(&self) -> Result<Vec<LedgerEntry>, MigrationError> {
        let ledger = self.ledger();
        if !ledger.exists()? {
            log::debug!("Ledger table {} does not exist yet", ledger.table());
            return Ok(Vec::new());
        }
        ledger.list_all()
    }

    /// Forward scripts not yet in the ledger, ascending by version
    pub fn pending(&self) -> Result<Vec<MigrationScript>, MigrationError> {
        let scripts = self.source.discover()?;
        let applied: HashSet<String> = self.status()?.into_iter().map(|entry| entry.name).collect();

        Ok(scripts
            .into_iter()
            .filter(|script| !applied.contains(&script.name))
            .collect())
    }

    /// Applied and pending migrations together
    pub fn overview(&self) -> Result<MigrationStatus, MigrationError> {
        let applied = self.status()?;
        let pending = self.pending()?;
        Ok(MigrationStatus::new(applied, pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::source::EmbeddedStore;
    use crate::migration::state_table::LedgerTable;
    use crate::testing::MemoryDatabase;
    use std::sync::{Arc, Barrier};

    const V1: (&str, &str) = ("V1__create_authors.sql", "CREATE TABLE authors (id INT);");
    const U1: (&str, &str) = ("U1__create_authors.sql", "DROP TABLE authors;");
    const V2: (&str, &str) = ("V2__create_books.sql", "CREATE TABLE books (id INT);");
    const U2: (&str, &str) = ("U2__create_books.sql", "DROP TABLE books;");
    const V3: (&str, &str) = ("V3__add_isbn.sql", "ALTER TABLE books ADD isbn TEXT;");
    const U3: (&str, &str) = ("U3__add_isbn.sql", "ALTER TABLE books DROP isbn;");

    fn source(entries: &[(&str, &str)]) -> MigrationSource {
        MigrationSource::new(
            entries
                .iter()
                .map(|(name, sql)| (name.to_string(), sql.to_string()))
                .collect::<EmbeddedStore>(),
        )
    }

    fn full_source() -> MigrationSource {
        source(&[V3, U1, V1, U3, V2, U2])
    }

    fn ledger(db: &MemoryDatabase) -> Vec<String> {
        db.ledger_names(&LedgerTable::default())
    }

    fn owned(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_migrate_applies_in_version_order() {
        let db = MemoryDatabase::new();
        let session = db.session();
        let settings = MigrationSettings::default();
        let source = full_source();

        let report = Migrator::new(&session, &source, &settings).migrate().unwrap();

        assert_eq!(report.applied, owned(&[V1.0, V2.0, V3.0]));
        assert_eq!(report.skipped, 0);
        assert_eq!(db.executed_scripts(), owned(&[V1.1, V2.1, V3.1]));
        assert_eq!(ledger(&db), owned(&[V1.0, V2.0, V3.0]));
    }

    #[test]
    fn test_migrate_twice_is_a_noop() {
        let db = MemoryDatabase::new();
        let session = db.session();
        let settings = MigrationSettings::default();
        let source = full_source();
        let migrator = Migrator::new(&session, &source, &settings);

        migrator.migrate().unwrap();
        let second = migrator.migrate().unwrap();

        assert!(second.is_noop());
        assert_eq!(second.skipped, 3);
        assert_eq!(db.executed_scripts().len(), 3);
    }

    #[test]
    fn test_numeric_ordering_beyond_nine() {
        let db = MemoryDatabase::new();
        let session = db.session();
        let settings = MigrationSettings::default();
        let source = source(&[("V10__ten.sql", "SELECT 10;"), ("V9__nine.sql", "SELECT 9;"), ("V2__two.sql", "SELECT 2;")]);

        Migrator::new(&session, &source, &settings).migrate().unwrap();

        assert_eq!(db.executed_scripts(), owned(&["SELECT 2;", "SELECT 9;", "SELECT 10;"]));
    }

    #[test]
    fn test_duplicate_version_rejects_whole_set() {
        let db = MemoryDatabase::new();
        let session = db.session();
        let settings = MigrationSettings::default();
        let source = source(&[V1, ("V2__a.sql", "SELECT 'a';"), ("V2__b.sql", "SELECT 'b';")]);

        let err = Migrator::new(&session, &source, &settings).migrate().unwrap_err();

        assert!(matches!(err, MigrationError::DuplicateVersion { version: 2, .. }));
        assert!(db.executed_scripts().is_empty());
        assert!(ledger(&db).is_empty());
        assert_eq!(db.lock_holder(settings.lock_key), None);
    }

    #[test]
    fn test_failure_stops_the_batch_and_fix_resumes() {
        let db = MemoryDatabase::new();
        let session = db.session();
        let settings = MigrationSettings::default();
        let broken = source(&[V1, ("V2__create_books.sql", "CREAT TABLE books;"), V3]);
        db.fail_scripts_containing("CREAT TABLE");

        let err = Migrator::new(&session, &broken, &settings).migrate().unwrap_err();

        assert!(matches!(err, MigrationError::ExecutionFailed { ref script, .. } if script == V2.0));
        assert_eq!(ledger(&db), owned(&[V1.0]));
        assert_eq!(db.executed_scripts(), owned(&[V1.1]));
        assert_eq!(db.lock_holder(settings.lock_key), None);

        db.clear_failures();
        let fixed = source(&[V1, V2, V3]);
        let report = Migrator::new(&session, &fixed, &settings).migrate().unwrap();

        assert_eq!(report.applied, owned(&[V2.0, V3.0]));
        assert_eq!(report.skipped, 1);
        assert_eq!(db.executed_scripts(), owned(&[V1.1, V2.1, V3.1]));
    }

    #[test]
    fn test_rollback_empty_ledger_is_noop() {
        let db = MemoryDatabase::new();
        let session = db.session();
        let settings = MigrationSettings::default();
        let source = full_source();
        let migrator = Migrator::new(&session, &source, &settings);

        assert_eq!(migrator.rollback().unwrap(), None);

        session.create_ledger(&settings.table).unwrap();
        assert_eq!(migrator.rollback().unwrap(), None);
        assert!(db.executed_scripts().is_empty());
    }

    #[test]
    fn test_rollback_undoes_only_the_latest() {
        let db = MemoryDatabase::new();
        let session = db.session();
        let settings = MigrationSettings::default();
        let source = full_source();
        let migrator = Migrator::new(&session, &source, &settings);
        migrator.migrate().unwrap();

        let removed = migrator.rollback().unwrap().unwrap();

        assert_eq!(removed.name, V3.0);
        assert_eq!(ledger(&db), owned(&[V1.0, V2.0]));
        assert_eq!(db.executed_scripts().last().map(String::as_str), Some(U3.1));
        assert_eq!(db.executed_scripts().len(), 4);
    }

    #[test]
    fn test_rollback_follows_application_order_not_timestamps() {
        let db = MemoryDatabase::new();
        let session = db.session();
        let settings = MigrationSettings::default();
        let first = source(&[V1, U1]);
        let now = chrono::Utc::now();

        db.set_clock(Some(now));
        Migrator::new(&session, &first, &settings).migrate().unwrap();

        // V2 lands after V1 but from a session whose clock reads an hour earlier
        db.set_clock(Some(now - chrono::Duration::hours(1)));
        let source = source(&[V1, U1, V2, U2]);
        let migrator = Migrator::new(&session, &source, &settings);
        migrator.migrate().unwrap();
        db.set_clock(None);

        let applied = migrator.status().unwrap();
        assert!(applied[0].applied_at < applied[1].applied_at);
        assert_eq!(applied[0].name, V2.0);

        let removed = migrator.rollback().unwrap().unwrap();

        assert_eq!(removed.name, V2.0);
        assert_eq!(ledger(&db), owned(&[V1.0]));
        assert_eq!(db.executed_scripts().last().map(String::as_str), Some(U2.1));
    }

    #[test]
    fn test_rollback_without_undo_keeps_ledger() {
        let db = MemoryDatabase::new();
        let session = db.session();
        let settings = MigrationSettings::default();
        let source = source(&[V1, U1, V2, U2, V3]);
        let migrator = Migrator::new(&session, &source, &settings);
        migrator.migrate().unwrap();

        let err = migrator.rollback().unwrap_err();

        assert!(matches!(err, MigrationError::MissingUndo { ref undo, .. } if undo == U3.0));
        assert_eq!(ledger(&db), owned(&[V1.0, V2.0, V3.0]));
        assert_eq!(db.executed_scripts().len(), 3);
        assert_eq!(db.lock_holder(settings.lock_key), None);
    }

    #[test]
    fn test_failed_undo_keeps_ledger() {
        let db = MemoryDatabase::new();
        let session = db.session();
        let settings = MigrationSettings::default();
        let source = full_source();
        let migrator = Migrator::new(&session, &source, &settings);
        migrator.migrate().unwrap();
        db.fail_scripts_containing("DROP isbn");

        let err = migrator.rollback().unwrap_err();

        assert!(matches!(err, MigrationError::ExecutionFailed { ref script, .. } if script == U3.0));
        assert_eq!(ledger(&db), owned(&[V1.0, V2.0, V3.0]));
    }

    #[test]
    fn test_status_is_read_only_and_most_recent_first() {
        let db = MemoryDatabase::new();
        let session = db.session();
        let settings = MigrationSettings::default();
        let source = source(&[V1, V2]);
        let migrator = Migrator::new(&session, &source, &settings);

        assert!(migrator.status().unwrap().is_empty());
        assert!(!session.ledger_exists(&settings.table).unwrap());

        migrator.migrate().unwrap();
        let before = ledger(&db);
        let statuses: Vec<String> = migrator.status().unwrap().into_iter().map(|e| e.name).collect();

        assert_eq!(statuses, owned(&[V2.0, V1.0]));
        assert_eq!(ledger(&db), before);
    }

    #[test]
    fn test_status_needs_no_lock() {
        let db = MemoryDatabase::new();
        let holder = db.session();
        let reader = db.session();
        let settings = MigrationSettings::default();
        let source = full_source();

        Migrator::new(&holder, &source, &settings).migrate().unwrap();
        let _held = AdvisoryLock::new(&holder, settings.lock_key, None).guard().unwrap();

        assert_eq!(Migrator::new(&reader, &source, &settings).status().unwrap().len(), 3);
    }

    #[test]
    fn test_pending_and_overview() {
        let db = MemoryDatabase::new();
        let session = db.session();
        let settings = MigrationSettings::default();
        let applied = source(&[V1]);
        Migrator::new(&session, &applied, &settings).migrate().unwrap();

        let source = full_source();
        let migrator = Migrator::new(&session, &source, &settings);
        let pending: Vec<String> = migrator.pending().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(pending, owned(&[V2.0, V3.0]));

        let overview = migrator.overview().unwrap();
        assert_eq!(overview.applied_count, 1);
        assert_eq!(overview.next_pending_version(), Some(2));
        assert!(!overview.is_up_to_date());
    }

    #[test]
    fn test_busy_lock_fails_fast_without_applying() {
        let db = MemoryDatabase::new();
        let holder = db.session();
        let contender = db.session();
        let settings = MigrationSettings::default();
        let source = full_source();

        let held = AdvisoryLock::new(&holder, settings.lock_key, None).guard().unwrap();
        let err = Migrator::new(&contender, &source, &settings).migrate().unwrap_err();

        assert!(err.is_retryable());
        assert!(db.executed_scripts().is_empty());
        assert!(!contender.ledger_exists(&settings.table).unwrap());

        let err = Migrator::new(&contender, &source, &settings).rollback().unwrap_err();
        assert!(matches!(err, MigrationError::LockBusy { .. }));

        drop(held);
        assert_eq!(Migrator::new(&contender, &source, &settings).migrate().unwrap().applied.len(), 3);
    }

    #[test]
    fn test_huge_lock_timeout_is_accepted() {
        let db = MemoryDatabase::new();
        let session = db.session();
        let settings = MigrationSettings {
            lock_timeout: Some(std::time::Duration::from_secs(u64::MAX)),
            ..MigrationSettings::default()
        };
        let source = full_source();
        let migrator = Migrator::new(&session, &source, &settings);

        assert_eq!(migrator.migrate().unwrap().applied.len(), 3);
        assert_eq!(migrator.rollback().unwrap().map(|entry| entry.name), Some(V3.0.to_string()));
        assert_eq!(db.lock_holder(settings.lock_key), None);
    }

    #[test]
    fn test_concurrent_runs_apply_each_script_once() {
        let db = MemoryDatabase::new();
        let runners = 4;
        let barrier = Arc::new(Barrier::new(runners));

        let handles: Vec<_> = (0..runners)
            .map(|_| {
                let db = db.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let session = db.session();
                    let settings = MigrationSettings::default();
                    let source = full_source();
                    barrier.wait();
                    Migrator::new(&session, &source, &settings).migrate()
                })
            })
            .collect();

        let mut applied_by_runs = 0;
        for handle in handles {
            match handle.join().unwrap() {
                Ok(report) => applied_by_runs += report.applied.len(),
                Err(MigrationError::LockBusy { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(applied_by_runs, 3);
        assert_eq!(db.executed_scripts(), owned(&[V1.1, V2.1, V3.1]));
        assert_eq!(ledger(&db), owned(&[V1.0, V2.0, V3.0]));
    }

    #[test]
    fn test_checksum_drift_warns_by_default() {
        let db = MemoryDatabase::new();
        let session = db.session();
        let settings = MigrationSettings::default();
        Migrator::new(&session, &source(&[V1]), &settings).migrate().unwrap();

        let edited = source(&[("V1__create_authors.sql", "CREATE TABLE authors (id BIGINT);"), V2]);
        let report = Migrator::new(&session, &edited, &settings).migrate().unwrap();

        assert_eq!(report.applied, owned(&[V2.0]));
        assert_eq!(db.executed_scripts(), owned(&[V1.1, V2.1]));
    }

    #[test]
    fn test_checksum_drift_blocks_under_verify() {
        let db = MemoryDatabase::new();
        let session = db.session();
        let settings = MigrationSettings {
            checksum_policy: ChecksumPolicy::Verify,
            ..MigrationSettings::default()
        };
        Migrator::new(&session, &source(&[V1]), &settings).migrate().unwrap();

        let edited = source(&[("V1__create_authors.sql", "CREATE TABLE authors (id BIGINT);"), V2]);
        let err = Migrator::new(&session, &edited, &settings).migrate().unwrap_err();

        assert!(matches!(err, MigrationError::ChecksumMismatch { ref name, .. } if name == V1.0));
        assert_eq!(ledger(&db), owned(&[V1.0]));
        assert_eq!(db.executed_scripts(), owned(&[V1.1]));
    }

    #[test]
    fn test_rows_without_checksum_are_not_verified() {
        let db = MemoryDatabase::new();
        let session = db.session();
        let settings = MigrationSettings {
            checksum_policy: ChecksumPolicy::Verify,
            ..MigrationSettings::default()
        };
        session.create_ledger(&settings.table).unwrap();
        session.insert_ledger_entry(&settings.table, V1.0, None).unwrap();

        let report = Migrator::new(&session, &source(&[V1, V2]), &settings).migrate().unwrap();
        assert_eq!(report.applied, owned(&[V2.0]));
    }

    #[test]
    fn test_custom_ledger_table() {
        let db = MemoryDatabase::new();
        let session = db.session();
        let settings = MigrationSettings {
            table: LedgerTable::new("ops.schema_ledger").unwrap(),
            ..MigrationSettings::default()
        };

        Migrator::new(&session, &full_source(), &settings).migrate().unwrap();

        assert_eq!(db.ledger_names(&settings.table).len(), 3);
        assert!(ledger(&db).is_empty());
    }
}
