//! The database handle and its operation surface.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use serde::Serialize;

use crate::config::DatabaseConfig;
use crate::error::DbError;
use crate::registry::{
    MAX_STATEMENTS, ThreadLink, acquire_db_slot, finalize_links, next_open_id, release_db_slot,
    with_link,
};
use crate::results::{ResultSet, materialize};
use crate::value::{SqlValue, Value, bind_values, display_params};

/// Sentinel returned by [`Database::get_the_int`] and [`Database::insert`]
/// when a query legitimately produced no row. A documented "no row" signal,
/// not an error.
pub const NO_ROW: i64 = i32::MIN as i64;

/// Logger code for failures that did not come from the engine.
pub const LOG_INTERNAL_CODE: i32 = 10_000;

/// Default number of characters of parameter text included in log lines.
pub const DEFAULT_LOG_TRUNCATE: usize = 50;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Identifies one registered statement template by its ordinal.
///
/// `usize` works directly; callers usually keep an enum mirroring the order
/// templates were registered in:
///
/// ```
/// use sqlite_slots::StatementId;
///
/// #[derive(Clone, Copy)]
/// enum Stmt {
///     Insert,
///     Count,
/// }
///
/// impl StatementId for Stmt {
///     fn ordinal(self) -> usize {
///         self as usize
///     }
/// }
/// ```
pub trait StatementId: Copy {
    fn ordinal(self) -> usize;
}

impl StatementId for usize {
    fn ordinal(self) -> usize {
        self
    }
}

/// Logger callback: `(database name, message, code)`. Codes: `0` normal
/// operation, negative debug, positive engine result code,
/// [`LOG_INTERNAL_CODE`] for non-engine failures.
pub type LogCallback = Arc<dyn Fn(&str, &str, i32) + Send + Sync>;

/// Invoked after every successful transaction commit.
pub type CommitCallback = Arc<dyn Fn() + Send + Sync>;

struct LoggerState {
    callback: Option<LogCallback>,
    truncate: usize,
}

pub(crate) struct LinkRegistry {
    pub(crate) closed: bool,
    pub(crate) links: Vec<Arc<ThreadLink>>,
}

/// Shared state behind a [`Database`] handle.
pub(crate) struct DbInner {
    name: String,
    target: String,
    slot: usize,
    open_id: u64,
    in_memory: bool,
    wal: bool,
    max_kb_size: u64,
    statements: Vec<String>,
    readonly: AtomicBool,
    config_epoch: AtomicU64,
    pub(crate) in_tx: AtomicBool,
    write_lock: Mutex<()>,
    links: Mutex<LinkRegistry>,
    anchor: Mutex<Option<Connection>>,
    logger: Mutex<LoggerState>,
    on_commit: Mutex<Option<CommitCallback>>,
    backups: AtomicUsize,
}

impl DbInner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn target(&self) -> &str {
        &self.target
    }

    pub(crate) fn open_id(&self) -> u64 {
        self.open_id
    }

    pub(crate) fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::SeqCst)
    }

    pub(crate) fn config_epoch(&self) -> u64 {
        self.config_epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn statement_sql(&self, ordinal: usize) -> Option<&str> {
        self.statements.get(ordinal).map(String::as_str)
    }

    fn statement_count(&self) -> usize {
        self.statements.len()
    }

    fn journal_mode(&self) -> &'static str {
        if self.wal { "WAL" } else { "PERSIST" }
    }

    pub(crate) fn backups_in_progress(&self) -> usize {
        self.backups.load(Ordering::SeqCst)
    }

    pub(crate) fn backup_started(&self) {
        self.backups.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn backup_finished(&self) {
        self.backups.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn lock_writes(&self) -> Result<MutexGuard<'_, ()>, DbError> {
        self.write_lock
            .lock()
            .map_err(|_| DbError::Internal("write lock poisoned".into()))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.links.lock().map_or(true, |reg| reg.closed)
    }

    pub(crate) fn register_link(&self, link: Arc<ThreadLink>) -> Result<(), DbError> {
        let mut reg = self
            .links
            .lock()
            .map_err(|_| DbError::Internal("link registry poisoned".into()))?;
        if reg.closed {
            return Err(DbError::Usage(format!("database '{}' is closed", self.name)));
        }
        reg.links.push(link);
        Ok(())
    }

    pub(crate) fn unregister_link(&self, link: &Arc<ThreadLink>) {
        if let Ok(mut reg) = self.links.lock() {
            reg.links.retain(|known| !Arc::ptr_eq(known, link));
        }
    }

    fn link_count(&self) -> usize {
        self.links.lock().map_or(0, |reg| reg.links.len())
    }

    fn interrupt_all(&self) {
        if let Ok(reg) = self.links.lock() {
            for link in &reg.links {
                link.interrupt.interrupt();
            }
        }
    }

    pub(crate) fn on_commit_snapshot(&self) -> Option<CommitCallback> {
        self.on_commit.lock().ok().and_then(|cb| cb.clone())
    }

    /// Per-connection pragmas applied to the anchor and to every thread
    /// link.
    fn apply_connection_pragmas(&self, conn: &Connection) -> Result<(), DbError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        run_pragma(conn, "PRAGMA foreign_keys = ON")?;
        if !self.in_memory {
            run_pragma(conn, "PRAGMA locking_mode = NORMAL")?;
            run_pragma(conn, &format!("PRAGMA journal_mode = {}", self.journal_mode()))?;
        }
        if self.max_kb_size > 0 {
            let page_size: i64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;
            let pages = (self.max_kb_size * 1024 / page_size.max(1).unsigned_abs()).max(1);
            run_pragma(conn, &format!("PRAGMA max_page_count = {pages}"))?;
        }
        if self.is_readonly() {
            run_pragma(conn, "PRAGMA query_only = ON")?;
        }
        Ok(())
    }

    pub(crate) fn new_engine_connection(&self) -> Result<Connection, DbError> {
        let conn = Connection::open(&self.target)?;
        self.apply_connection_pragmas(&conn)?;
        Ok(conn)
    }

    pub(crate) fn log(&self, code: i32, message: &str) {
        if code < 0 {
            tracing::debug!(db = %self.name, code, "{message}");
        } else if code == 0 {
            tracing::info!(db = %self.name, "{message}");
        } else {
            tracing::error!(db = %self.name, code, "{message}");
        }
        let callback = match self.logger.lock() {
            Ok(state) => state.callback.clone(),
            Err(_) => None,
        };
        if let Some(cb) = callback {
            cb(&self.name, message, code);
        }
    }

    pub(crate) fn log_debug(&self, message: &str) {
        self.log(-1, message);
    }

    fn log_info(&self, message: &str) {
        self.log(0, message);
    }

    pub(crate) fn truncate_for_log(&self, text: &str) -> String {
        let limit = self
            .logger
            .lock()
            .map_or(DEFAULT_LOG_TRUNCATE, |state| state.truncate);
        if text.chars().count() <= limit {
            text.to_string()
        } else {
            let mut out: String = text.chars().take(limit).collect();
            out.push_str("..");
            out
        }
    }
}

impl Drop for DbInner {
    fn drop(&mut self) {
        let links = match self.links.get_mut() {
            Ok(reg) if !reg.closed => {
                reg.closed = true;
                std::mem::take(&mut reg.links)
            }
            _ => return,
        };
        finalize_links(links);
        release_db_slot(self.slot);
    }
}

/// Execute a pragma, draining any row it returns. Several pragmas echo
/// their new value as a result row, which `execute` would reject.
pub(crate) fn run_pragma(conn: &Connection, sql: &str) -> Result<(), DbError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.raw_query();
    while rows.next()?.is_some() {}
    Ok(())
}

enum Source<'a> {
    Ordinal(usize),
    Sql(&'a str),
}

impl Source<'_> {
    fn label(&self) -> String {
        match self {
            Source::Ordinal(o) => format!("statement {o}"),
            Source::Sql(_) => "ad-hoc statement".to_string(),
        }
    }
}

/// One open database.
///
/// Cloning is cheap and shares the underlying connection state; the handle
/// is `Send + Sync` and meant to be used from many threads at once. Each
/// thread transparently gets its own engine link and compiled statements.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DbInner>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("slot", &self.inner.slot)
            .finish()
    }
}

impl Database {
    pub(crate) fn open(config: DatabaseConfig) -> Result<Self, DbError> {
        if config.statements.len() > MAX_STATEMENTS {
            return Err(DbError::CapacityExceeded(format!(
                "{} statement templates registered, the maximum is {MAX_STATEMENTS}",
                config.statements.len()
            )));
        }
        let slot = acquire_db_slot()?;
        // On failure the freshly built `DbInner` drops here, and its Drop
        // impl releases the slot exactly once.
        Self::open_at_slot(config, slot)
    }

    fn open_at_slot(config: DatabaseConfig, slot: usize) -> Result<Self, DbError> {
        let open_id = next_open_id();
        let in_memory = config.path == ":memory:";
        // A private in-memory database would be invisible to the other
        // threads' links; a uniquely named shared-cache target makes every
        // link see the same data, anchored below.
        let target = if in_memory {
            format!("file:sqlite_slots_{open_id}?mode=memory&cache=shared")
        } else {
            config.path.clone()
        };
        let inner = Arc::new(DbInner {
            name: config.path.clone(),
            target,
            slot,
            open_id,
            in_memory,
            wal: config.wal,
            max_kb_size: config.max_kb_size,
            statements: config.statements.clone(),
            readonly: AtomicBool::new(false),
            config_epoch: AtomicU64::new(0),
            in_tx: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            links: Mutex::new(LinkRegistry {
                closed: false,
                links: Vec::new(),
            }),
            anchor: Mutex::new(None),
            logger: Mutex::new(LoggerState {
                callback: None,
                truncate: DEFAULT_LOG_TRUNCATE,
            }),
            on_commit: Mutex::new(None),
            backups: AtomicUsize::new(0),
        });

        let anchor = Connection::open(inner.target())?;
        run_pragma(&anchor, "PRAGMA encoding = 'UTF-8'")?;
        inner.apply_connection_pragmas(&anchor)?;
        for script in &config.schema {
            if let Err(e) = anchor.execute_batch(script) {
                let message = e.to_string();
                let ignorable = config
                    .ignorable_schema_errors
                    .iter()
                    .any(|pattern| pattern == "*" || message.contains(pattern.as_str()));
                if ignorable {
                    inner.log_debug(&format!("schema script skipped: {message}"));
                } else {
                    let err = DbError::from(e);
                    inner.log(err.log_code(), &format!("schema script failed: {err}"));
                    return Err(err);
                }
            }
        }
        if let Ok(mut keeper) = inner.anchor.lock() {
            *keeper = Some(anchor);
        }
        inner.log_info("database opened");
        Ok(Database { inner })
    }

    /// Close the database, finalizing every thread's cached statements and
    /// engine link.
    ///
    /// This is a last-call operation: no other thread may be mid-statement
    /// on this database. Idempotent; a second close logs and returns `Ok`.
    ///
    /// # Errors
    /// [`DbError::Busy`] while a backup is in progress: wait for it to
    /// finish or cancel it first. [`DbError::Usage`] inside a `transaction`
    /// scope on the same thread.
    pub fn close(&self) -> Result<(), DbError> {
        if crate::transaction::tx_active_here(self.inner.open_id()) {
            return Err(DbError::Usage(
                "close cannot run inside an open transaction".into(),
            ));
        }
        let _writes = self.inner.lock_writes()?;
        if self.inner.backups_in_progress() > 0 {
            let err = DbError::Busy(format!(
                "cannot close '{}' while a backup is in progress",
                self.inner.name()
            ));
            self.inner.log(err.log_code(), &err.to_string());
            return Err(err);
        }
        let links = {
            let mut reg = self
                .inner
                .links
                .lock()
                .map_err(|_| DbError::Internal("link registry poisoned".into()))?;
            if reg.closed {
                self.inner.log_debug("close: already closed");
                return Ok(());
            }
            reg.closed = true;
            std::mem::take(&mut reg.links)
        };
        finalize_links(links);
        if let Ok(mut anchor) = self.inner.anchor.lock() {
            *anchor = None;
        }
        release_db_slot(self.inner.slot);
        self.inner.log_info("database closed");
        Ok(())
    }

    /// The identifier this database was opened with.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.inner.is_readonly()
    }

    /// Whether some thread currently holds an open write transaction.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.inner.in_tx.load(Ordering::SeqCst)
    }

    /// Switch readonly mode. In readonly mode [`transaction`] bodies run
    /// without locking or a transaction, and writes rejected by the engine
    /// are silently discarded rather than raised.
    ///
    /// [`transaction`]: Database::transaction
    pub fn set_readonly(&self, readonly: bool) {
        self.inner.readonly.store(readonly, Ordering::SeqCst);
        self.inner.config_epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.log_info(if readonly {
            "readonly mode enabled"
        } else {
            "readonly mode disabled"
        });
    }

    /// Install (or clear) the logger callback. `truncate_len` bounds the
    /// parameter text included in failure log lines.
    pub fn set_logger(&self, callback: Option<LogCallback>, truncate_len: usize) {
        if let Ok(mut state) = self.inner.logger.lock() {
            state.callback = callback;
            state.truncate = truncate_len;
        }
    }

    /// Install (or clear) a callback invoked after every successful commit.
    pub fn set_on_commit(&self, callback: Option<CommitCallback>) {
        if let Ok(mut slot) = self.inner.on_commit.lock() {
            *slot = callback;
        }
    }

    /// Ask the engine to abort the statement currently executing on any
    /// thread of this database. Connection-wide, not call-targeted; a
    /// no-op when nothing is running.
    pub fn interrupt(&self) {
        self.inner.interrupt_all();
    }

    /// Execute a registered statement, returning the affected-row count.
    ///
    /// # Errors
    /// [`DbError::CapacityExceeded`] for an ordinal past
    /// [`MAX_STATEMENTS`], [`DbError::Usage`] for an unregistered ordinal
    /// or a parameter-count mismatch, [`DbError::Engine`] for engine
    /// failures (logged before raising when a logger is set).
    pub fn exec<S: StatementId>(&self, id: S, params: &[SqlValue<'_>]) -> Result<usize, DbError> {
        let ordinal = id.ordinal();
        let outcome = with_link(&self.inner, |link| {
            let mut stmt = link.statement(&self.inner, ordinal)?;
            bind_values(&mut stmt, params)?;
            stmt.raw_execute().map_err(DbError::from)
        });
        match outcome {
            Ok(n) => Ok(n),
            Err(err) => self
                .absorb_write_failure(&Source::Ordinal(ordinal), err, params)
                .map(|()| 0),
        }
    }

    /// Execute a registered INSERT and return the new rowid, or [`NO_ROW`]
    /// when nothing was inserted.
    ///
    /// # Errors
    /// As [`Database::exec`].
    pub fn insert<S: StatementId>(&self, id: S, params: &[SqlValue<'_>]) -> Result<i64, DbError> {
        let ordinal = id.ordinal();
        let outcome = with_link(&self.inner, |link| {
            let changes = {
                let mut stmt = link.statement(&self.inner, ordinal)?;
                bind_values(&mut stmt, params)?;
                stmt.raw_execute()?
            };
            Ok(if changes == 0 {
                NO_ROW
            } else {
                link.conn.last_insert_rowid()
            })
        });
        match outcome {
            Ok(rowid) => Ok(rowid),
            Err(err) => self
                .absorb_write_failure(&Source::Ordinal(ordinal), err, params)
                .map(|()| NO_ROW),
        }
    }

    /// Run a registered query and materialize every row.
    ///
    /// # Errors
    /// As [`Database::exec`].
    pub fn rows<S: StatementId>(
        &self,
        id: S,
        params: &[SqlValue<'_>],
    ) -> Result<ResultSet, DbError> {
        self.all_rows(&Source::Ordinal(id.ordinal()), params)
    }

    /// Run ad-hoc SQL and materialize every row.
    ///
    /// # Errors
    /// As [`Database::exec`].
    pub fn rows_sql(&self, sql: &str, params: &[SqlValue<'_>]) -> Result<ResultSet, DbError> {
        self.all_rows(&Source::Sql(sql), params)
    }

    /// First column of the first row as an integer; [`NO_ROW`] when the
    /// query returns no row.
    ///
    /// # Errors
    /// As [`Database::exec`].
    pub fn get_the_int<S: StatementId>(
        &self,
        id: S,
        params: &[SqlValue<'_>],
    ) -> Result<i64, DbError> {
        self.first_int(&Source::Ordinal(id.ordinal()), params)
    }

    /// Ad-hoc twin of [`Database::get_the_int`].
    ///
    /// # Errors
    /// As [`Database::exec`].
    pub fn get_the_int_sql(&self, sql: &str, params: &[SqlValue<'_>]) -> Result<i64, DbError> {
        self.first_int(&Source::Sql(sql), params)
    }

    /// First column of the first row as text; empty string when the query
    /// returns no row.
    ///
    /// # Errors
    /// As [`Database::exec`].
    pub fn get_the_string<S: StatementId>(
        &self,
        id: S,
        params: &[SqlValue<'_>],
    ) -> Result<String, DbError> {
        self.first_string(&Source::Ordinal(id.ordinal()), params)
    }

    /// Ad-hoc twin of [`Database::get_the_string`].
    ///
    /// # Errors
    /// As [`Database::exec`].
    pub fn get_the_string_sql(
        &self,
        sql: &str,
        params: &[SqlValue<'_>],
    ) -> Result<String, DbError> {
        self.first_string(&Source::Sql(sql), params)
    }

    /// First column of every row as text; empty when the query returns no
    /// rows.
    ///
    /// # Errors
    /// As [`Database::exec`].
    pub fn get_as_strings<S: StatementId>(
        &self,
        id: S,
        params: &[SqlValue<'_>],
    ) -> Result<Vec<String>, DbError> {
        let rows = self.all_rows(&Source::Ordinal(id.ordinal()), params)?;
        Ok(rows.iter().map(|row| row.get_string(0)).collect())
    }

    /// The whole result as a JSON array of objects keyed by column name.
    ///
    /// # Errors
    /// As [`Database::exec`].
    pub fn get_as_json<S: StatementId>(
        &self,
        id: S,
        params: &[SqlValue<'_>],
    ) -> Result<serde_json::Value, DbError> {
        Ok(self.all_rows(&Source::Ordinal(id.ordinal()), params)?.to_json())
    }

    /// Ad-hoc twin of [`Database::get_as_json`].
    ///
    /// # Errors
    /// As [`Database::exec`].
    pub fn get_as_json_sql(
        &self,
        sql: &str,
        params: &[SqlValue<'_>],
    ) -> Result<serde_json::Value, DbError> {
        Ok(self.all_rows(&Source::Sql(sql), params)?.to_json())
    }

    /// Whether the query returns at least one row.
    ///
    /// # Errors
    /// As [`Database::exec`].
    pub fn row_exists<S: StatementId>(
        &self,
        id: S,
        params: &[SqlValue<'_>],
    ) -> Result<bool, DbError> {
        self.query_first(&Source::Ordinal(id.ordinal()), params, |_| Ok(()))
            .map(|found| found.is_some())
    }

    /// Run `f` against the first result row without copying it out of the
    /// engine. References taken from the row are valid only inside `f`;
    /// they dangle past the next step or reset, which is why they cannot
    /// leave the closure. Returns `None` when the query has no row.
    ///
    /// # Errors
    /// As [`Database::exec`], plus whatever `f` raises.
    pub fn with_row<S: StatementId, R>(
        &self,
        id: S,
        params: &[SqlValue<'_>],
        f: impl FnOnce(&rusqlite::Row<'_>) -> Result<R, DbError>,
    ) -> Result<Option<R>, DbError> {
        self.query_first(&Source::Ordinal(id.ordinal()), params, f)
    }

    /// [`Database::with_row`] with a fallback value for the no-row case.
    ///
    /// # Errors
    /// As [`Database::with_row`].
    pub fn with_row_or<S: StatementId, R>(
        &self,
        id: S,
        params: &[SqlValue<'_>],
        f: impl FnOnce(&rusqlite::Row<'_>) -> Result<R, DbError>,
        fallback: R,
    ) -> Result<R, DbError> {
        Ok(self.with_row(id, params, f)?.unwrap_or(fallback))
    }

    /// Set one column on the rows matching `key_column = key_value`.
    /// Identifiers are spliced into the statement, so only plain
    /// `[A-Za-z0-9_]` names are accepted.
    ///
    /// # Errors
    /// [`DbError::Usage`] for a malformed identifier; otherwise as
    /// [`Database::exec`].
    pub fn update(
        &self,
        table: &str,
        column: &str,
        new_value: SqlValue<'_>,
        key_column: &str,
        key_value: SqlValue<'_>,
    ) -> Result<usize, DbError> {
        for ident in [table, column, key_column] {
            validate_identifier(ident)?;
        }
        let sql = format!("UPDATE {table} SET {column} = ?1 WHERE {key_column} = ?2");
        let params = [new_value, key_value];
        let outcome = with_link(&self.inner, |link| {
            let mut stmt = link.adhoc(&sql)?;
            bind_values(&mut stmt, &params)?;
            stmt.raw_execute().map_err(DbError::from)
        });
        match outcome {
            Ok(n) => Ok(n),
            Err(err) => self
                .absorb_write_failure(&Source::Sql(&sql), err, &params)
                .map(|()| 0),
        }
    }

    /// Whether `table` has a column named `column`.
    ///
    /// # Errors
    /// [`DbError::Usage`] for a malformed identifier; otherwise as
    /// [`Database::exec`].
    pub fn column_exists(&self, table: &str, column: &str) -> Result<bool, DbError> {
        validate_identifier(table)?;
        validate_identifier(column)?;
        self.query_first(
            &Source::Sql("SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2"),
            &[SqlValue::Text(table), SqlValue::Text(column)],
            |_| Ok(()),
        )
        .map(|found| found.is_some())
    }

    /// Execute a multi-statement script on the calling thread's link.
    ///
    /// # Errors
    /// As [`Database::exec`].
    pub fn execute_batch(&self, sql: &str) -> Result<(), DbError> {
        let outcome = with_link(&self.inner, |link| {
            link.conn.execute_batch(sql).map_err(DbError::from)
        });
        match outcome {
            Ok(()) => Ok(()),
            Err(err) => self.absorb_write_failure(&Source::Sql(sql), err, &[]),
        }
    }

    /// Run `PRAGMA optimize`, optionally changing the page size (rebuilds
    /// the file) or the WAL autocheckpoint interval first. Failures are
    /// logged and given up on; the handle stays usable.
    ///
    /// # Errors
    /// Only lock poisoning surfaces; engine failures are absorbed.
    pub fn optimize(
        &self,
        page_size: Option<u32>,
        wal_autocheckpoint: Option<u32>,
    ) -> Result<(), DbError> {
        let inner = Arc::clone(&self.inner);
        let result = self.transactions_disabled(|| {
            with_link(&inner, |link| {
                if let Some(size) = page_size {
                    run_pragma(&link.conn, "PRAGMA journal_mode = DELETE")?;
                    run_pragma(&link.conn, &format!("PRAGMA page_size = {size}"))?;
                    link.conn.execute_batch("VACUUM")?;
                    run_pragma(
                        &link.conn,
                        &format!("PRAGMA journal_mode = {}", inner.journal_mode()),
                    )?;
                }
                if let Some(frames) = wal_autocheckpoint {
                    run_pragma(
                        &link.conn,
                        &format!("PRAGMA wal_autocheckpoint = {frames}"),
                    )?;
                }
                run_pragma(&link.conn, "PRAGMA optimize")?;
                Ok(())
            })
        });
        match result {
            Ok(()) => {
                self.inner.log_debug("optimize finished");
                Ok(())
            }
            Err(err @ DbError::Internal(_)) => Err(err),
            Err(err) => {
                self.inner
                    .log(err.log_code(), &format!("optimize abandoned: {err}"));
                Ok(())
            }
        }
    }

    /// One pragma-backed diagnostic counter.
    ///
    /// # Errors
    /// As [`Database::exec`].
    pub fn get_status(&self, status: DbStatus) -> Result<i64, DbError> {
        with_link(&self.inner, |link| {
            link.conn
                .pragma_query_value(None, status.pragma(), |row| row.get(0))
                .map_err(DbError::from)
        })
    }

    /// Diagnostic snapshot of this database.
    ///
    /// # Errors
    /// As [`Database::exec`].
    pub fn about(&self) -> Result<About, DbError> {
        let (journal_mode, page_size, page_count, max_page_count) =
            with_link(&self.inner, |link| {
                let journal: String =
                    link.conn
                        .pragma_query_value(None, "journal_mode", |row| row.get(0))?;
                let page_size: i64 =
                    link.conn.pragma_query_value(None, "page_size", |row| row.get(0))?;
                let page_count: i64 =
                    link.conn.pragma_query_value(None, "page_count", |row| row.get(0))?;
                let max_page_count: i64 =
                    link.conn
                        .pragma_query_value(None, "max_page_count", |row| row.get(0))?;
                Ok((journal, page_size, page_count, max_page_count))
            })?;
        Ok(About {
            name: self.inner.name().to_string(),
            sqlite_version: rusqlite::version().to_string(),
            journal_mode,
            page_size,
            page_count,
            max_page_count,
            readonly: self.is_readonly(),
            in_transaction: self.in_transaction(),
            statements: self.inner.statement_count(),
            thread_links: self.inner.link_count(),
            backups_in_progress: self.inner.backups_in_progress(),
        })
    }

    /// Rowid of the most recent successful insert on the calling thread's
    /// link.
    ///
    /// # Errors
    /// As [`Database::exec`].
    pub fn get_last_insert_rowid(&self) -> Result<i64, DbError> {
        with_link(&self.inner, |link| Ok(link.conn.last_insert_rowid()))
    }

    fn all_rows(&self, source: &Source<'_>, params: &[SqlValue<'_>]) -> Result<ResultSet, DbError> {
        let outcome = with_link(&self.inner, |link| {
            let mut stmt = match source {
                Source::Ordinal(o) => link.statement(&self.inner, *o)?,
                Source::Sql(sql) => link.adhoc(sql)?,
            };
            bind_values(&mut stmt, params)?;
            materialize(&mut stmt)
        });
        outcome.map_err(|err| self.surface(source, err, params))
    }

    fn query_first<R>(
        &self,
        source: &Source<'_>,
        params: &[SqlValue<'_>],
        f: impl FnOnce(&rusqlite::Row<'_>) -> Result<R, DbError>,
    ) -> Result<Option<R>, DbError> {
        let outcome = with_link(&self.inner, |link| {
            let mut stmt = match source {
                Source::Ordinal(o) => link.statement(&self.inner, *o)?,
                Source::Sql(sql) => link.adhoc(sql)?,
            };
            bind_values(&mut stmt, params)?;
            let mut rows = stmt.raw_query();
            match rows.next()? {
                Some(row) => f(row).map(Some),
                None => Ok(None),
            }
        });
        outcome.map_err(|err| self.surface(source, err, params))
    }

    fn first_int(&self, source: &Source<'_>, params: &[SqlValue<'_>]) -> Result<i64, DbError> {
        let cell = self.query_first(source, params, |row| Value::from_ref(row.get_ref(0)?))?;
        Ok(match cell {
            Some(Some(value)) => value.coerce_int(),
            Some(None) => 0,
            None => NO_ROW,
        })
    }

    fn first_string(
        &self,
        source: &Source<'_>,
        params: &[SqlValue<'_>],
    ) -> Result<String, DbError> {
        let cell = self.query_first(source, params, |row| Value::from_ref(row.get_ref(0)?))?;
        Ok(match cell {
            Some(Some(value)) => value.coerce_string(),
            _ => String::new(),
        })
    }

    /// Log a surfaced failure once, with truncated parameter context.
    fn surface(&self, source: &Source<'_>, err: DbError, params: &[SqlValue<'_>]) -> DbError {
        let shown = self.inner.truncate_for_log(&display_params(params));
        self.inner.log(
            err.log_code(),
            &format!("{} failed: {err}; params=[{shown}]", source.label()),
        );
        err
    }

    /// The readonly discard policy: an engine readonly rejection while the
    /// handle is in readonly mode is a silent no-op. Everything else is
    /// logged and surfaced.
    fn absorb_write_failure(
        &self,
        source: &Source<'_>,
        err: DbError,
        params: &[SqlValue<'_>],
    ) -> Result<(), DbError> {
        if self.inner.is_readonly() && readonly_rejection(&err) {
            self.inner
                .log_debug(&format!("{} discarded: readonly mode", source.label()));
            return Ok(());
        }
        Err(self.surface(source, err, params))
    }
}

fn readonly_rejection(err: &DbError) -> bool {
    matches!(
        err,
        DbError::Engine(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ReadOnly
    )
}

fn validate_identifier(ident: &str) -> Result<(), DbError> {
    let plain = !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        Ok(())
    } else {
        Err(DbError::Usage(format!(
            "'{ident}' is not a plain identifier"
        )))
    }
}

/// Pragma-backed diagnostic counters served by [`Database::get_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbStatus {
    PageCount,
    PageSize,
    MaxPageCount,
    FreelistCount,
    CacheSize,
    SchemaVersion,
    UserVersion,
    WalAutocheckpoint,
}

impl DbStatus {
    fn pragma(self) -> &'static str {
        match self {
            DbStatus::PageCount => "page_count",
            DbStatus::PageSize => "page_size",
            DbStatus::MaxPageCount => "max_page_count",
            DbStatus::FreelistCount => "freelist_count",
            DbStatus::CacheSize => "cache_size",
            DbStatus::SchemaVersion => "schema_version",
            DbStatus::UserVersion => "user_version",
            DbStatus::WalAutocheckpoint => "wal_autocheckpoint",
        }
    }
}

/// Diagnostic snapshot returned by [`Database::about`].
#[derive(Debug, Clone, Serialize)]
pub struct About {
    pub name: String,
    pub sqlite_version: String,
    pub journal_mode: String,
    pub page_size: i64,
    pub page_count: i64,
    pub max_page_count: i64,
    pub readonly: bool,
    pub in_transaction: bool,
    pub statements: usize,
    pub thread_links: usize,
    pub backups_in_progress: usize,
}

impl fmt::Display for About {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "database:   {}", self.name)?;
        writeln!(f, "engine:     SQLite {}", self.sqlite_version)?;
        writeln!(f, "journal:    {}", self.journal_mode)?;
        writeln!(
            f,
            "pages:      {} x {} bytes (cap {})",
            self.page_count, self.page_size, self.max_page_count
        )?;
        writeln!(f, "readonly:   {}", self.readonly)?;
        writeln!(f, "in tx:      {}", self.in_transaction)?;
        writeln!(f, "statements: {}", self.statements)?;
        writeln!(f, "links:      {}", self.thread_links)?;
        write!(f, "backups:    {}", self.backups_in_progress)
    }
}
