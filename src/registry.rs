//! Per-thread engine links and the process-wide slot tables.
//!
//! Every thread that touches a [`Database`](crate::Database) gets its own
//! engine connection plus a fixed-capacity statement slot table, held in a
//! thread-local cell keyed by the handle's open id. The database keeps a
//! registry of every link so close can finalize them all; that registry
//! mutex is taken once per (thread, database) at link creation and once at
//! teardown, never on the statement path.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use lazy_static::lazy_static;
use rusqlite::{CachedStatement, Connection, InterruptHandle};

use crate::database::DbInner;
use crate::error::DbError;

/// Upper bound on concurrently open [`Database`](crate::Database) handles
/// in one process.
pub const MAX_DATABASES: usize = 32;

/// Upper bound on statement ordinals per database.
pub const MAX_STATEMENTS: usize = 128;

lazy_static! {
    static ref DB_SLOTS: Mutex<[bool; MAX_DATABASES]> = Mutex::new([false; MAX_DATABASES]);
}

static OPEN_IDS: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_open_id() -> u64 {
    OPEN_IDS.fetch_add(1, Ordering::Relaxed)
}

/// Claim the lowest free database slot.
pub(crate) fn acquire_db_slot() -> Result<usize, DbError> {
    let mut slots = DB_SLOTS
        .lock()
        .map_err(|_| DbError::Internal("database slot table poisoned".into()))?;
    match slots.iter().position(|taken| !taken) {
        Some(ix) => {
            slots[ix] = true;
            Ok(ix)
        }
        None => Err(DbError::CapacityExceeded(format!(
            "all {MAX_DATABASES} database slots are in use"
        ))),
    }
}

pub(crate) fn release_db_slot(slot: usize) {
    if let Ok(mut slots) = DB_SLOTS.lock() {
        slots[slot] = false;
    }
}

/// One thread's link to one database: the engine connection plus the slot
/// occupancy table. Owned by exactly one thread during use; the `Mutex` is
/// uncontended on the statement path and exists so close (or thread
/// teardown) can take the connection out from the registry side.
pub(crate) struct ThreadLink {
    db: Weak<DbInner>,
    pub(crate) conn: Mutex<Option<LinkConn>>,
    pub(crate) interrupt: InterruptHandle,
}

pub(crate) struct LinkConn {
    pub(crate) conn: Connection,
    /// Which ordinals this thread has compiled, for first-use logging.
    compiled: [bool; MAX_STATEMENTS],
    /// Last config epoch applied to this connection.
    epoch: u64,
}

impl LinkConn {
    /// Resolve `(database, ordinal)` to this thread's compiled statement,
    /// compiling on first use.
    ///
    /// The connection's prepared-statement cache is pinned to
    /// [`MAX_STATEMENTS`] entries at link creation, so a resolved statement
    /// is never evicted: repeated resolution by one thread yields the same
    /// compiled statement, and threads never share one.
    pub(crate) fn statement(
        &mut self,
        inner: &DbInner,
        ordinal: usize,
    ) -> Result<CachedStatement<'_>, DbError> {
        if ordinal >= MAX_STATEMENTS {
            return Err(DbError::CapacityExceeded(format!(
                "statement ordinal {ordinal} exceeds the per-database maximum of {MAX_STATEMENTS}"
            )));
        }
        let Some(sql) = inner.statement_sql(ordinal) else {
            return Err(DbError::Usage(format!(
                "no statement registered at ordinal {ordinal}"
            )));
        };
        if !self.compiled[ordinal] {
            self.compiled[ordinal] = true;
            inner.log_debug(&format!("compiling statement {ordinal}: {sql}"));
        }
        self.conn.prepare_cached(sql).map_err(DbError::from)
    }

    /// Resolve ad-hoc SQL through the same per-thread cache.
    pub(crate) fn adhoc(&mut self, sql: &str) -> Result<CachedStatement<'_>, DbError> {
        self.conn.prepare_cached(sql).map_err(DbError::from)
    }

    fn sync_config(&mut self, inner: &DbInner) -> Result<(), DbError> {
        let epoch = inner.config_epoch();
        if self.epoch != epoch {
            let mode = if inner.is_readonly() { "ON" } else { "OFF" };
            crate::database::run_pragma(&self.conn, &format!("PRAGMA query_only = {mode}"))?;
            self.epoch = epoch;
        }
        Ok(())
    }
}

/// Thread-local handle to a link. Dropping it (thread exit, or pruning a
/// closed entry) detaches the link from the database registry and closes
/// this thread's connection, finalizing its cached statements.
struct LinkHandle {
    link: Arc<ThreadLink>,
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        if let Some(db) = self.link.db.upgrade() {
            db.unregister_link(&self.link);
        }
        if let Ok(mut slot) = self.link.conn.lock() {
            *slot = None;
        }
    }
}

thread_local! {
    static LINKS: RefCell<HashMap<u64, LinkHandle>> = RefCell::new(HashMap::new());
}

/// Run `f` against the calling thread's link for `inner`, creating and
/// registering the link on first touch.
pub(crate) fn with_link<T>(
    inner: &Arc<DbInner>,
    f: impl FnOnce(&mut LinkConn) -> Result<T, DbError>,
) -> Result<T, DbError> {
    let link = LINKS.with(|cell| -> Result<Arc<ThreadLink>, DbError> {
        let mut map = cell.borrow_mut();
        if let Some(handle) = map.get(&inner.open_id()) {
            return Ok(Arc::clone(&handle.link));
        }
        if inner.is_closed() {
            return Err(DbError::Usage(format!(
                "database '{}' is closed",
                inner.name()
            )));
        }
        let conn = inner.new_engine_connection()?;
        conn.set_prepared_statement_cache_capacity(MAX_STATEMENTS);
        let interrupt = conn.get_interrupt_handle();
        let link = Arc::new(ThreadLink {
            db: Arc::downgrade(inner),
            conn: Mutex::new(Some(LinkConn {
                conn,
                compiled: [false; MAX_STATEMENTS],
                epoch: inner.config_epoch(),
            })),
            interrupt,
        });
        inner.register_link(Arc::clone(&link))?;
        map.insert(
            inner.open_id(),
            LinkHandle {
                link: Arc::clone(&link),
            },
        );
        Ok(link)
    })?;

    let mut guard = link
        .conn
        .lock()
        .map_err(|_| DbError::Internal("thread link poisoned".into()))?;
    match guard.as_mut() {
        Some(conn) => {
            conn.sync_config(inner)?;
            f(conn)
        }
        None => {
            // Finalized by close; prune the stale thread-local entry.
            drop(guard);
            LINKS.with(|cell| {
                cell.borrow_mut().remove(&inner.open_id());
            });
            Err(DbError::Usage(format!(
                "database '{}' is closed",
                inner.name()
            )))
        }
    }
}

/// Close every link in `links`, dropping each thread's connection and with
/// it every cached statement. Last-call operation: the caller must ensure
/// no thread is mid-statement on this database.
pub(crate) fn finalize_links(links: Vec<Arc<ThreadLink>>) {
    for link in links {
        if let Ok(mut slot) = link.conn.lock() {
            *slot = None;
        }
    }
}
