//! Open-time configuration for a database.

use crate::database::Database;
use crate::error::DbError;

/// Options describing how to open a [`Database`].
///
/// Statement templates are registered here, in order; a template's position
/// is its ordinal for the life of the handle. Callers usually keep a small
/// enum mirroring the order and implement
/// [`StatementId`](crate::StatementId) for it.
///
/// ```no_run
/// use sqlite_slots::DatabaseConfig;
///
/// let db = DatabaseConfig::new(":memory:")
///     .schema("CREATE TABLE t(n INTEGER)")
///     .statement("INSERT INTO t(n) VALUES(?1)")
///     .statement("SELECT count(*) FROM t")
///     .open()?;
/// # Ok::<(), sqlite_slots::DbError>(())
/// ```
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub(crate) path: String,
    pub(crate) statements: Vec<String>,
    pub(crate) schema: Vec<String>,
    pub(crate) ignorable_schema_errors: Vec<String>,
    pub(crate) max_kb_size: u64,
    pub(crate) wal: bool,
}

impl DatabaseConfig {
    /// Start a configuration for the database at `path`. `":memory:"`
    /// opens a private in-memory database shared by every thread that
    /// touches the handle.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            statements: Vec::new(),
            schema: Vec::new(),
            ignorable_schema_errors: Vec::new(),
            max_kb_size: 0,
            wal: true,
        }
    }

    /// Register one statement template at the next ordinal.
    #[must_use]
    pub fn statement(mut self, sql: impl Into<String>) -> Self {
        self.statements.push(sql.into());
        self
    }

    /// Register several statement templates, in order.
    #[must_use]
    pub fn statements<I, S>(mut self, sql: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.statements.extend(sql.into_iter().map(Into::into));
        self
    }

    /// Append one schema script, executed in order during open.
    #[must_use]
    pub fn schema(mut self, sql: impl Into<String>) -> Self {
        self.schema.push(sql.into());
        self
    }

    /// Append several schema scripts.
    #[must_use]
    pub fn schemas<I, S>(mut self, sql: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schema.extend(sql.into_iter().map(Into::into));
        self
    }

    /// A schema failure whose message contains any of these substrings is
    /// skipped (and logged) instead of aborting open. The wildcard `"*"`
    /// skips every schema failure.
    #[must_use]
    pub fn ignorable_schema_errors<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignorable_schema_errors
            .extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Cap the database size at roughly `kb` KiB (converted to a page-count
    /// ceiling at open). 0 leaves the size uncapped.
    #[must_use]
    pub fn max_kb_size(mut self, kb: u64) -> Self {
        self.max_kb_size = kb;
        self
    }

    /// Journal mode: `true` (default) for WAL, `false` for PERSIST.
    #[must_use]
    pub fn wal(mut self, wal: bool) -> Self {
        self.wal = wal;
        self
    }

    /// Open the database described by this configuration.
    ///
    /// # Errors
    /// [`DbError::CapacityExceeded`] when every process-wide database slot
    /// is taken or more than [`MAX_STATEMENTS`](crate::MAX_STATEMENTS)
    /// templates were registered; [`DbError::Engine`] when the engine
    /// rejects the file or a non-ignorable schema script fails.
    pub fn open(self) -> Result<Database, DbError> {
        Database::open(self)
    }
}
