//! The typed value currency used for parameter binding and result cells.

use std::fmt;

use rusqlite::types::ValueRef;

use crate::error::DbError;

/// A value to bind into a statement. One of the four storable kinds.
///
/// `Text` is a non-owning view: the referenced string is handed to the
/// engine during the call that binds it and is never copied by this layer.
/// It must stay valid until that call returns; after the statement resets,
/// mutating the backing buffer has no effect on what was stored.
///
/// There is no NULL variant. Absence is expressed by omitting a column from
/// the statement, never by a sentinel value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue<'a> {
    Int(i64),
    Real(f64),
    Text(&'a str),
    Blob(Vec<u8>),
}

impl fmt::Display for SqlValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Int(v) => write!(f, "{v}"),
            SqlValue::Real(v) => write!(f, "{v}"),
            SqlValue::Text(v) => f.write_str(v),
            // Lossy on purpose; only used for debug logs.
            SqlValue::Blob(v) => f.write_str(&String::from_utf8_lossy(v)),
        }
    }
}

impl From<i64> for SqlValue<'_> {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<i32> for SqlValue<'_> {
    fn from(v: i32) -> Self {
        SqlValue::Int(i64::from(v))
    }
}

impl From<u32> for SqlValue<'_> {
    fn from(v: u32) -> Self {
        SqlValue::Int(i64::from(v))
    }
}

impl From<bool> for SqlValue<'_> {
    fn from(v: bool) -> Self {
        SqlValue::Int(i64::from(v))
    }
}

impl From<f64> for SqlValue<'_> {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl<'a> From<&'a str> for SqlValue<'a> {
    fn from(v: &'a str) -> Self {
        SqlValue::Text(v)
    }
}

impl<'a> From<&'a String> for SqlValue<'a> {
    fn from(v: &'a String) -> Self {
        SqlValue::Text(v.as_str())
    }
}

impl From<Vec<u8>> for SqlValue<'_> {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

/// Build a `[SqlValue; N]` from mixed literals.
///
/// ```
/// use sqlite_slots::{vals, SqlValue};
/// let name = String::from("ada");
/// let params = vals![1i64, &name, 2.5];
/// assert_eq!(params[0], SqlValue::Int(1));
/// ```
#[macro_export]
macro_rules! vals {
    () => {{
        let empty: [$crate::SqlValue<'static>; 0] = [];
        empty
    }};
    ($($v:expr),+ $(,)?) => {
        [$($crate::SqlValue::from($v)),+]
    };
}

/// An owned result cell. SQL NULL never materializes as a `Value`; a null
/// cell is `None` in its row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        if let Value::Int(v) = self { Some(*v) } else { None }
    }

    pub fn as_float(&self) -> Option<f64> {
        if let Value::Real(v) = self { Some(*v) } else { None }
    }

    pub fn as_str(&self) -> Option<&str> {
        if let Value::Text(v) = self { Some(v.as_str()) } else { None }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        if let Value::Blob(v) = self { Some(v.as_slice()) } else { None }
    }

    /// Numeric coercion matching the engine's own integer column reads.
    pub(crate) fn coerce_int(&self) -> i64 {
        match self {
            Value::Int(v) => *v,
            #[allow(clippy::cast_possible_truncation)]
            Value::Real(v) => *v as i64,
            Value::Text(v) => v.trim().parse().unwrap_or(0),
            Value::Blob(_) => 0,
        }
    }

    /// Textual coercion matching the engine's text column reads.
    pub(crate) fn coerce_string(&self) -> String {
        match self {
            Value::Text(v) => v.clone(),
            other => other.to_string(),
        }
    }

    /// Convert a borrowed engine cell into an owned cell; NULL becomes
    /// `None`.
    pub(crate) fn from_ref(v: ValueRef<'_>) -> Result<Option<Value>, DbError> {
        Ok(match v {
            ValueRef::Null => None,
            ValueRef::Integer(i) => Some(Value::Int(i)),
            ValueRef::Real(f) => Some(Value::Real(f)),
            ValueRef::Text(bytes) => Some(Value::Text(String::from_utf8_lossy(bytes).into_owned())),
            ValueRef::Blob(b) => Some(Value::Blob(b.to_vec())),
        })
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Int(v) => serde_json::Value::from(*v),
            Value::Real(v) => serde_json::Number::from_f64(*v)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Value::Text(v) => serde_json::Value::String(v.clone()),
            // Lossy; blobs are not round-trippable through JSON.
            Value::Blob(v) => serde_json::Value::String(String::from_utf8_lossy(v).into_owned()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Real(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
            Value::Blob(v) => f.write_str(&String::from_utf8_lossy(v)),
        }
    }
}

/// Bind `params` positionally starting at index 1.
///
/// The parameter count is validated against the compiled statement before
/// anything is bound; a mismatch is a [`DbError::Usage`]. The first engine
/// bind failure short-circuits the rest.
pub(crate) fn bind_values(
    stmt: &mut rusqlite::Statement<'_>,
    params: &[SqlValue<'_>],
) -> Result<(), DbError> {
    let expected = stmt.parameter_count();
    if expected != params.len() {
        return Err(DbError::Usage(format!(
            "statement expects {expected} parameter(s), {} supplied",
            params.len()
        )));
    }
    for (i, value) in params.iter().enumerate() {
        let pos = i + 1;
        match value {
            SqlValue::Int(v) => stmt.raw_bind_parameter(pos, v)?,
            SqlValue::Real(v) => stmt.raw_bind_parameter(pos, v)?,
            SqlValue::Text(v) => stmt.raw_bind_parameter(pos, v)?,
            SqlValue::Blob(v) => stmt.raw_bind_parameter(pos, v.as_slice())?,
        }
    }
    Ok(())
}

/// Render a parameter list for a log line.
pub(crate) fn display_params(params: &[SqlValue<'_>]) -> String {
    params
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips_for_logs() {
        assert_eq!(SqlValue::Int(-7).to_string(), "-7");
        assert_eq!(SqlValue::Real(1.5).to_string(), "1.5");
        assert_eq!(SqlValue::Text("abc").to_string(), "abc");
        assert_eq!(SqlValue::Blob(b"xy".to_vec()).to_string(), "xy");
    }

    #[test]
    fn from_conversions() {
        assert_eq!(SqlValue::from(true), SqlValue::Int(1));
        assert_eq!(SqlValue::from(3i32), SqlValue::Int(3));
        let s = String::from("hi");
        assert_eq!(SqlValue::from(&s), SqlValue::Text("hi"));
    }

    #[test]
    fn vals_macro_builds_mixed_arrays() {
        let params = vals![1i64, "two", 3.0];
        assert_eq!(params.len(), 3);
        assert_eq!(params[1], SqlValue::Text("two"));
    }

    #[test]
    fn coercions_match_engine_reads() {
        assert_eq!(Value::Text(" 42 ".into()).coerce_int(), 42);
        assert_eq!(Value::Real(2.9).coerce_int(), 2);
        assert_eq!(Value::Int(5).coerce_string(), "5");
    }
}
