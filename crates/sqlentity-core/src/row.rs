//! Result row representation.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column metadata shared across all rows in a result set.
///
/// Wrapped in `Arc` so all rows from the same cursor share one copy.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    /// Column names in order
    names: Vec<String>,
    /// Name -> index mapping for O(1) lookup
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create new column info from a list of column names.
    pub fn new(names: Vec<String>) -> Self {
        let name_to_index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            names,
            name_to_index,
        }
    }

    /// Get the number of columns.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Get the index of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// Get the name of a column by index.
    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Get all column names.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row fetched from a cursor.
///
/// Rows provide both index-based and name-based access to column values.
#[derive(Debug, Clone)]
pub struct Row {
    /// Column values in order
    values: Vec<Value>,
    /// Shared column metadata
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a new row with the given columns and values.
    ///
    /// For multiple rows from the same result set, prefer `with_columns`
    /// to share the column metadata.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let columns = Arc::new(ColumnInfo::new(column_names));
        Self { values, columns }
    }

    /// Create a new row with shared column metadata.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    /// Get the shared column metadata.
    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    /// Get the number of columns in this row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if this row is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Get a typed value by column index.
    #[allow(clippy::result_large_err)]
    pub fn get_as<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self.get(index).ok_or_else(|| {
            Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!(
                    "index {} out of bounds (row has {} columns)",
                    index,
                    self.len()
                ),
                column: None,
            })
        })?;
        T::from_value(value)
    }

    /// Get a typed value by column name.
    #[allow(clippy::result_large_err)]
    pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self.get_by_name(name).ok_or_else(|| {
            Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!("column '{}' not found", name),
                column: Some(name.to_string()),
            })
        })?;
        T::from_value(value).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = Some(name.to_string());
                Error::Type(te)
            }
            e => e,
        })
    }

    /// Get all column names.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.names().iter().map(String::as_str)
    }

    /// Iterate over all values.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    /// Consume the row, yielding its values in column order.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Iterate over (column_name, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

/// A materialized, scrollable result set.
///
/// Query results are buffered into a `RowSet` as soon as the statement
/// completes, so positioning never touches the driver again. The cursor
/// vocabulary (`first`/`next`/`previous`/`absolute`/`fetch`) matches the
/// driver boundary; positions are one-based and the set starts *before*
/// the first row.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    rows: Vec<Row>,
    /// One-based position; 0 = before first row.
    pos: usize,
}

impl RowSet {
    /// Create a row set from buffered rows, positioned before the first.
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows, pos: 0 }
    }

    /// Number of rows in the set.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check whether the set holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Move to the first row. Returns false on an empty set.
    pub fn first(&mut self) -> bool {
        self.absolute(1)
    }

    /// Advance one row. Returns false when the end is passed.
    pub fn next(&mut self) -> bool {
        if self.pos < self.rows.len() {
            self.pos += 1;
            true
        } else {
            // Park one past the end so previous() can step back in.
            self.pos = self.rows.len() + 1;
            false
        }
    }

    /// Step back one row. Returns false when moved before the first.
    pub fn previous(&mut self) -> bool {
        if self.pos > 1 {
            self.pos -= 1;
            self.pos <= self.rows.len()
        } else {
            self.pos = 0;
            false
        }
    }

    /// Move to the given one-based row. Returns false if out of range.
    pub fn absolute(&mut self, row: u64) -> bool {
        let row = usize::try_from(row).unwrap_or(usize::MAX);
        if row >= 1 && row <= self.rows.len() {
            self.pos = row;
            true
        } else {
            false
        }
    }

    /// The row under the cursor.
    #[allow(clippy::result_large_err)]
    pub fn fetch(&self) -> Result<&Row> {
        if self.pos >= 1 && self.pos <= self.rows.len() {
            Ok(&self.rows[self.pos - 1])
        } else {
            Err(Error::Consistency(
                "row set is not positioned on a row".to_string(),
            ))
        }
    }

    /// Iterate the buffered rows without moving the cursor.
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    /// Consume the set, yielding its rows in order.
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

/// Trait for converting from a `Value` to a typed value.
pub trait FromValue: Sized {
    /// Convert from a Value, returning an error if the conversion fails.
    #[allow(clippy::result_large_err)]
    fn from_value(value: &Value) -> Result<Self>;
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| {
            Error::Type(TypeError {
                expected: "bool",
                actual: value.type_name().to_string(),
                column: None,
            })
        })
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int(v) => Ok(*v),
            Value::Bool(v) => Ok(if *v { 1 } else { 0 }),
            _ => Err(Error::Type(TypeError {
                expected: "i32",
                actual: value.type_name().to_string(),
                column: None,
            })),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_i64().ok_or_else(|| {
            Error::Type(TypeError {
                expected: "i64",
                actual: value.type_name().to_string(),
                column: None,
            })
        })
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| {
            Error::Type(TypeError {
                expected: "f64",
                actual: value.type_name().to_string(),
                column: None,
            })
        })
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            _ => Err(Error::Type(TypeError {
                expected: "String",
                actual: value.type_name().to_string(),
                column: None,
            })),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Text(s) => Ok(s.as_bytes().to_vec()),
            _ => Err(Error::Type(TypeError {
                expected: "Vec<u8>",
                actual: value.type_name().to_string(),
                column: None,
            })),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_basic_access() {
        let row = Row::new(
            vec!["id".to_string(), "serial".to_string(), "name".to_string()],
            vec![
                Value::BigInt(7),
                Value::BigInt(3),
                Value::Text("account".to_string()),
            ],
        );

        assert_eq!(row.len(), 3);
        assert!(!row.is_empty());

        // Index access
        assert_eq!(row.get(0), Some(&Value::BigInt(7)));
        assert_eq!(row.get(3), None);

        // Name access
        assert_eq!(row.get_by_name("serial"), Some(&Value::BigInt(3)));
        assert_eq!(row.get_by_name("missing"), None);
    }

    #[test]
    fn test_row_typed_access() {
        let row = Row::new(
            vec!["id".to_string(), "tablename".to_string()],
            vec![Value::BigInt(42), Value::Text("modlog".to_string())],
        );

        assert_eq!(row.get_as::<i64>(0).unwrap(), 42);
        assert_eq!(row.get_named::<i64>("id").unwrap(), 42);
        assert_eq!(row.get_named::<String>("tablename").unwrap(), "modlog");
    }

    #[test]
    fn test_row_type_errors() {
        let row = Row::new(
            vec!["id".to_string()],
            vec![Value::Text("not a number".to_string())],
        );

        assert!(row.get_named::<i64>("id").is_err());
        assert!(row.get_named::<i64>("missing").is_err());
        assert!(row.get_as::<i64>(99).is_err());
    }

    #[test]
    fn test_row_null_handling() {
        let row = Row::new(vec!["errorcode".to_string()], vec![Value::Null]);

        assert_eq!(row.get_named::<Option<i64>>("errorcode").unwrap(), None);
        assert!(row.get_named::<i64>("errorcode").is_err());
    }

    #[test]
    fn test_row_shared_columns() {
        let columns = Arc::new(ColumnInfo::new(vec![
            "id".to_string(),
            "serial".to_string(),
        ]));

        let row1 = Row::with_columns(
            Arc::clone(&columns),
            vec![Value::BigInt(1), Value::BigInt(1)],
        );
        let row2 = Row::with_columns(
            Arc::clone(&columns),
            vec![Value::BigInt(2), Value::BigInt(5)],
        );

        assert!(Arc::ptr_eq(&row1.column_info(), &row2.column_info()));
        assert_eq!(row1.get_named::<i64>("id").unwrap(), 1);
        assert_eq!(row2.get_named::<i64>("serial").unwrap(), 5);
    }

    #[test]
    fn test_column_info() {
        let info = ColumnInfo::new(vec![
            "id".to_string(),
            "serial".to_string(),
            "tableserial".to_string(),
        ]);

        assert_eq!(info.len(), 3);
        assert_eq!(info.index_of("serial"), Some(1));
        assert_eq!(info.index_of("missing"), None);
        assert_eq!(info.name_at(2), Some("tableserial"));
        assert_eq!(info.name_at(99), None);
    }

    #[test]
    fn test_into_values() {
        let row = Row::new(vec!["a".to_string()], vec![Value::BigInt(9)]);
        assert_eq!(row.into_values(), vec![Value::BigInt(9)]);
    }

    fn three_row_set() -> RowSet {
        let columns = Arc::new(ColumnInfo::new(vec!["id".to_string()]));
        RowSet::new(
            (1..=3)
                .map(|i| Row::with_columns(Arc::clone(&columns), vec![Value::BigInt(i)]))
                .collect(),
        )
    }

    #[test]
    fn test_row_set_forward_iteration() {
        let mut set = three_row_set();
        assert!(set.fetch().is_err());

        let mut seen = Vec::new();
        while set.next() {
            seen.push(set.fetch().unwrap().get_named::<i64>("id").unwrap());
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(set.fetch().is_err());
    }

    #[test]
    fn test_row_set_scrolling() {
        let mut set = three_row_set();

        assert!(set.first());
        assert_eq!(set.fetch().unwrap().get_named::<i64>("id").unwrap(), 1);

        assert!(set.absolute(3));
        assert_eq!(set.fetch().unwrap().get_named::<i64>("id").unwrap(), 3);

        assert!(set.previous());
        assert_eq!(set.fetch().unwrap().get_named::<i64>("id").unwrap(), 2);

        assert!(!set.absolute(4));
        assert!(!set.absolute(0));
        // Failed absolute leaves the position alone.
        assert_eq!(set.fetch().unwrap().get_named::<i64>("id").unwrap(), 2);
    }

    #[test]
    fn test_row_set_previous_after_end() {
        let mut set = three_row_set();
        while set.next() {}
        assert!(set.previous());
        assert_eq!(set.fetch().unwrap().get_named::<i64>("id").unwrap(), 3);
    }

    #[test]
    fn test_empty_row_set() {
        let mut set = RowSet::new(Vec::new());
        assert!(set.is_empty());
        assert!(!set.first());
        assert!(!set.next());
        assert!(set.fetch().is_err());
    }
}
