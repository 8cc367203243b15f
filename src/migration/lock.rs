//! Advisory lock serialising migration runs against one database

use crate::executor::Session;
use crate::migration::MigrationError;
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Default advisory lock key: the bytes of `"lockstep"` read as a big-endian `i64`
///
/// Every process migrating the same database must use the same key.
pub const DEFAULT_LOCK_KEY: i64 = i64::from_be_bytes(*b"lockstep");

/// Interval between attempts while waiting for a busy lock
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Result of a single acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Busy,
}

/// When `acquire` stops polling
#[derive(Debug, Clone, Copy)]
enum Deadline {
    Immediate,
    At(Instant),
    Never,
}

impl Deadline {
    /// Whether another attempt after `poll_interval` still falls before the deadline
    fn allows_retry(self, poll_interval: Duration) -> bool {
        match self {
            Deadline::Immediate => false,
            Deadline::At(deadline) => Instant::now()
                .checked_add(poll_interval)
                .is_some_and(|next| next < deadline),
            Deadline::Never => true,
        }
    }
}

/// The migration lock for one session
///
/// Backed by `pg_try_advisory_lock`, so the lock lives in the server's lock
/// table and disappears with the session if the process dies.
pub struct AdvisoryLock<'s> {
    session: &'s dyn Session,
    key: i64,
    timeout: Option<Duration>,
    poll_interval: Duration,
}

impl<'s> AdvisoryLock<'s> {
    /// Lock `key` on `session`; with `timeout` unset a busy lock fails immediately
    pub fn new(session: &'s dyn Session, key: i64, timeout: Option<Duration>) -> Self {
        Self {
            session,
            key,
            timeout,
            poll_interval: POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    /// One non-blocking attempt
    pub fn try_acquire(&self) -> Result<LockOutcome, MigrationError> {
        if self.session.try_advisory_lock(self.key)? {
            Ok(LockOutcome::Acquired)
        } else {
            Ok(LockOutcome::Busy)
        }
    }

    /// Acquire, polling until the deadline when one is configured
    pub fn acquire(&self) -> Result<LockOutcome, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::acquire_lock_span(self.key).entered();

        let deadline = match self.timeout {
            None => Deadline::Immediate,
            // Too far out to represent: wait until the lock frees up
            Some(timeout) => Instant::now().checked_add(timeout).map_or(Deadline::Never, Deadline::At),
        };

        loop {
            if self.try_acquire()? == LockOutcome::Acquired {
                log::debug!("Acquired migration lock {}", self.key);
                return Ok(LockOutcome::Acquired);
            }

            if deadline.allows_retry(self.poll_interval) {
                log::debug!("Migration lock {} is busy, retrying", self.key);
                std::thread::sleep(self.poll_interval);
            } else {
                log::debug!("Migration lock {} is busy", self.key);
                return Ok(LockOutcome::Busy);
            }
        }
    }

    /// Release one hold of the lock
    pub fn release(&self) -> Result<(), MigrationError> {
        if !self.session.advisory_unlock(self.key)? {
            log::warn!("Migration lock {} was not held by this session", self.key);
        }
        Ok(())
    }

    /// Acquire and wrap the hold in a guard
    ///
    /// # Errors
    ///
    /// `LockBusy` if another session holds the lock (after the deadline, if any).
    pub fn guard(self) -> Result<LockGuard<'s>, MigrationError> {
        match self.acquire()? {
            LockOutcome::Acquired => Ok(LockGuard {
                lock: self,
                released: false,
            }),
            LockOutcome::Busy => {
                #[cfg(feature = "metrics")]
                METRICS.record_lock_contention();

                Err(MigrationError::LockBusy { key: self.key })
            }
        }
    }
}

/// Held migration lock; released on drop
///
/// A failed release is logged and never replaces the outcome of the work done
/// under the lock. The server drops the lock with the session regardless.
pub struct LockGuard<'s> {
    lock: AdvisoryLock<'s>,
    released: bool,
}

impl LockGuard<'_> {
    pub fn key(&self) -> i64 {
        self.lock.key
    }

    /// Release now and report the result
    pub fn release(mut self) -> Result<(), MigrationError> {
        self.released = true;
        self.lock.release()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.lock.release() {
            Ok(()) => log::debug!("Released migration lock {}", self.lock.key),
            Err(e) => log::warn!("Failed to release migration lock {}: {}", self.lock.key, e),
        }
    }
}
