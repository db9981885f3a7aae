//! Convenient imports for common functionality.

pub use crate::{
    About, Backup, Database, DatabaseConfig, DbError, DbStatus, MAX_DATABASES, MAX_STATEMENTS,
    NO_ROW, ResultSet, Row, SqlValue, StatementId, Value, vals,
};
