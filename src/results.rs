//! Materialized query results.

use std::sync::Arc;

use crate::error::DbError;
use crate::value::Value;

/// A single row from a query result.
///
/// Column names are shared across every row of one result set. Cells are
/// owned copies of the engine's row buffer; `None` marks a SQL NULL.
/// Zero-copy access to the engine's buffers is available only inside
/// [`Database::with_row`](crate::Database::with_row) closures.
#[derive(Debug, Clone)]
pub struct Row {
    pub(crate) column_names: Arc<Vec<String>>,
    pub(crate) values: Vec<Option<Value>>,
}

impl Row {
    /// Look a cell up by column name. `None` for an unknown column or a
    /// NULL cell.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        let ix = self.column_names.iter().position(|name| name == column)?;
        self.values.get(ix)?.as_ref()
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.column_names
    }

    #[must_use]
    pub fn is_null(&self, ix: usize) -> bool {
        matches!(self.values.get(ix), Some(None) | None)
    }

    /// Integer at `ix`, coerced the way the engine coerces integer column
    /// reads; 0 for NULL or out of range.
    #[must_use]
    pub fn get_int(&self, ix: usize) -> i64 {
        self.cell(ix).map_or(0, Value::coerce_int)
    }

    /// Float at `ix`; 0.0 for NULL or out of range.
    #[must_use]
    pub fn get_float(&self, ix: usize) -> f64 {
        self.cell(ix).map_or(0.0, |v| match v {
            Value::Real(f) => *f,
            #[allow(clippy::cast_precision_loss)]
            Value::Int(i) => *i as f64,
            _ => 0.0,
        })
    }

    /// Text at `ix`, numbers rendered decimally; empty for NULL or out of
    /// range.
    #[must_use]
    pub fn get_string(&self, ix: usize) -> String {
        self.cell(ix).map_or_else(String::new, Value::coerce_string)
    }

    /// Blob bytes at `ix`; empty for NULL, out of range, or a non-blob cell.
    #[must_use]
    pub fn get_blob(&self, ix: usize) -> &[u8] {
        self.cell(ix).and_then(Value::as_blob).unwrap_or(&[])
    }

    /// The row as a JSON object keyed by column name; NULL cells become
    /// JSON null.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .column_names
            .iter()
            .zip(&self.values)
            .map(|(name, cell)| {
                let value = cell
                    .as_ref()
                    .map_or(serde_json::Value::Null, Value::to_json);
                (name.clone(), value)
            })
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }

    fn cell(&self, ix: usize) -> Option<&Value> {
        self.values.get(ix)?.as_ref()
    }
}

/// The materialized rows of one query.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub(crate) rows: Vec<Row>,
}

impl ResultSet {
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn get(&self, ix: usize) -> Option<&Row> {
        self.rows.get(ix)
    }

    #[must_use]
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(self.rows.iter().map(Row::to_json).collect())
    }
}

impl IntoIterator for ResultSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// Step a bound statement to completion and materialize every row.
pub(crate) fn materialize(stmt: &mut rusqlite::Statement<'_>) -> Result<ResultSet, DbError> {
    let column_names: Arc<Vec<String>> = Arc::new(
        stmt.column_names()
            .iter()
            .map(ToString::to_string)
            .collect(),
    );
    let mut rows = stmt.raw_query();
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(column_names.len());
        for i in 0..column_names.len() {
            values.push(Value::from_ref(row.get_ref(i)?)?);
        }
        out.push(Row {
            column_names: Arc::clone(&column_names),
            values,
        });
    }
    Ok(ResultSet { rows: out })
}
