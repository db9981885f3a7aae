//! Write-transaction scoping.
//!
//! One mutex per database serializes every begin/commit/rollback sequence
//! across threads; commits land in lock-acquisition order. Reads issued
//! outside a transaction never take this lock and observe only committed
//! state, courtesy of the engine's WAL snapshot semantics.

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::atomic::Ordering;

use crate::database::Database;
use crate::error::DbError;
use crate::registry::with_link;

const BEGIN: &str = "BEGIN IMMEDIATE";
const COMMIT: &str = "COMMIT";
const ROLLBACK: &str = "ROLLBACK";

thread_local! {
    /// Open ids of databases with a transaction active on this thread.
    static ACTIVE_TX: RefCell<HashSet<u64>> = RefCell::new(HashSet::new());
}

pub(crate) fn tx_active_here(open_id: u64) -> bool {
    ACTIVE_TX.with(|set| set.borrow().contains(&open_id))
}

impl Database {
    /// Run `body` inside a write transaction.
    ///
    /// Blocks until this thread holds the database's write lock, begins a
    /// transaction, and runs `body`. If `body` fails (or unwinds), the
    /// transaction rolls back and the original failure is surfaced
    /// unchanged; on success the transaction commits and the on-commit
    /// callback fires. The lock is released on every exit path.
    ///
    /// A nested call on the same thread runs `body` directly: inner
    /// transaction scopes are ignored rather than deadlocking. In readonly
    /// mode `body` runs with no lock and no transaction; writes inside are
    /// discarded by the engine, not raised.
    ///
    /// `body` must do its database work on the calling thread.
    ///
    /// # Errors
    /// Whatever `body` raises, or [`DbError::Engine`] from the
    /// begin/commit/rollback statements themselves.
    pub fn transaction<T, F>(&self, body: F) -> Result<T, DbError>
    where
        F: FnOnce() -> Result<T, DbError>,
    {
        if self.inner.is_readonly() {
            return body();
        }
        let open_id = self.inner.open_id();
        if tx_active_here(open_id) {
            return body();
        }

        let lock = self.inner.lock_writes()?;
        self.control(BEGIN)?;
        let mut scope = TxScope::enter(self, open_id);

        let outcome = body();
        let result = match outcome {
            Ok(value) => scope.commit().map(|()| value),
            Err(err) => {
                scope.rollback(&err);
                Err(err)
            }
        };
        drop(scope);
        drop(lock);
        result
    }

    /// Hold the write lock across `body` without opening a transaction.
    /// Brackets administrative work (journal switches, vacuum, backup
    /// initialization) that must not race writer transactions.
    ///
    /// # Errors
    /// [`DbError::Usage`] when called inside a `transaction` scope on the
    /// same thread (the lock is already held there); otherwise whatever
    /// `body` raises.
    pub fn transactions_disabled<T, F>(&self, body: F) -> Result<T, DbError>
    where
        F: FnOnce() -> Result<T, DbError>,
    {
        if tx_active_here(self.inner.open_id()) {
            return Err(DbError::Usage(
                "transactions_disabled cannot run inside an open transaction".into(),
            ));
        }
        let _lock = self.inner.lock_writes()?;
        body()
    }

    /// Execute one of the control statements on the calling thread's link.
    /// Resolved through the same per-thread cache as every other
    /// statement, so each link keeps its begin/commit/rollback compiled.
    pub(crate) fn control(&self, sql: &'static str) -> Result<(), DbError> {
        let outcome = with_link(&self.inner, |link| {
            let mut stmt = link.adhoc(sql)?;
            stmt.raw_execute()?;
            Ok(())
        });
        outcome.map_err(|err| {
            self.inner
                .log(err.log_code(), &format!("{sql} failed: {err}"));
            err
        })
    }
}

/// Scope guard for an open transaction. Arms on entry; a drop while still
/// armed (a panic inside `body`) rolls back, so the engine is never left
/// with a dangling transaction.
struct TxScope<'a> {
    db: &'a Database,
    open_id: u64,
    armed: bool,
}

impl<'a> TxScope<'a> {
    fn enter(db: &'a Database, open_id: u64) -> Self {
        ACTIVE_TX.with(|set| set.borrow_mut().insert(open_id));
        db.inner.in_tx.store(true, Ordering::SeqCst);
        TxScope {
            db,
            open_id,
            armed: true,
        }
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.armed = false;
        let committed = self.db.control(COMMIT);
        match committed {
            Ok(()) => {
                if let Some(callback) = self.db.inner.on_commit_snapshot() {
                    callback();
                }
                self.leave();
                self.db.inner.log_debug("transaction committed");
                Ok(())
            }
            Err(err) => {
                // A failed COMMIT can leave the transaction open; try to
                // clear it, then surface the commit failure.
                if let Err(rollback_err) = self.db.control(ROLLBACK) {
                    self.db.inner.log_debug(&format!(
                        "rollback after failed commit: {rollback_err}"
                    ));
                }
                self.leave();
                Err(err)
            }
        }
    }

    fn rollback(&mut self, cause: &DbError) {
        self.armed = false;
        if let Err(rollback_err) = self.db.control(ROLLBACK) {
            self.db
                .inner
                .log_debug(&format!("rollback failed: {rollback_err}"));
        }
        self.leave();
        self.db
            .inner
            .log_debug(&format!("transaction rolled back: {cause}"));
    }

    fn leave(&self) {
        self.db.inner.in_tx.store(false, Ordering::SeqCst);
        ACTIVE_TX.with(|set| {
            set.borrow_mut().remove(&self.open_id);
        });
    }
}

impl Drop for TxScope<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            if let Err(err) = self.db.control(ROLLBACK) {
                self.db
                    .inner
                    .log_debug(&format!("rollback on unwind failed: {err}"));
            }
            self.leave();
            self.db.inner.log_debug("transaction rolled back on unwind");
        }
    }
}
