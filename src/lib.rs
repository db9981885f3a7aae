//! Thread-safe access layer over SQLite.
//!
//! Statement templates are registered once at open and identified by small
//! ordinals; every thread that touches a [`Database`] transparently gets
//! its own engine link and its own compiled statements, resolved through a
//! per-thread slot cache on first use. Writes are wrapped in
//! [`Database::transaction`] scopes serialized by one mutex per database;
//! reads never wait on that lock.
//!
//! ```no_run
//! use sqlite_slots::{DatabaseConfig, StatementId, vals};
//!
//! #[derive(Clone, Copy)]
//! enum Stmt {
//!     Insert,
//!     Count,
//! }
//!
//! impl StatementId for Stmt {
//!     fn ordinal(self) -> usize {
//!         self as usize
//!     }
//! }
//!
//! let db = DatabaseConfig::new("app.db")
//!     .schema("CREATE TABLE IF NOT EXISTS t(n INTEGER)")
//!     .statement("INSERT INTO t(n) VALUES(?1)")
//!     .statement("SELECT count(*) FROM t")
//!     .open()?;
//!
//! db.transaction(|| {
//!     db.exec(Stmt::Insert, &vals![5])?;
//!     Ok(())
//! })?;
//! assert_eq!(db.get_the_int(Stmt::Count, &[])?, 1);
//! # Ok::<(), sqlite_slots::DbError>(())
//! ```

mod backup;
mod config;
mod database;
mod error;
mod registry;
mod results;
mod transaction;
mod value;

pub mod prelude;

pub use backup::Backup;
pub use config::DatabaseConfig;
pub use database::{
    About, CommitCallback, DEFAULT_LOG_TRUNCATE, Database, DbStatus, LOG_INTERNAL_CODE,
    LogCallback, NO_ROW, StatementId,
};
pub use error::DbError;
pub use registry::{MAX_DATABASES, MAX_STATEMENTS};
pub use results::{ResultSet, Row};
pub use value::{SqlValue, Value};

// Engine row types appear in `with_row` closures.
pub use rusqlite;
