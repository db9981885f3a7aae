use thiserror::Error;

/// Errors surfaced by this crate.
///
/// Engine failures pass through unchanged so callers can inspect the native
/// result code; everything else carries a message naming the violated
/// contract.
#[derive(Debug, Error)]
pub enum DbError {
    /// The engine returned a result code outside the accepted set.
    #[error(transparent)]
    Engine(#[from] rusqlite::Error),

    /// A fixed capacity (database slots, statement ordinals) was exhausted.
    /// Unrecoverable for the process; never retried.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The caller violated a stated precondition.
    #[error("usage error: {0}")]
    Usage(String),

    /// The operation cannot proceed while another is in flight,
    /// e.g. closing a database mid-backup.
    #[error("busy: {0}")]
    Busy(String),

    /// A poisoned lock or a dead worker channel.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// The code this error is reported under to a configured logger: the
    /// engine's extended result code for [`DbError::Engine`], the internal
    /// sentinel for everything else.
    #[must_use]
    pub fn log_code(&self) -> i32 {
        match self {
            DbError::Engine(rusqlite::Error::SqliteFailure(e, _)) => e.extended_code,
            DbError::Engine(_) => 1,
            _ => crate::database::LOG_INTERNAL_CODE,
        }
    }
}
