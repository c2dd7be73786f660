//! Named-column tabular data held by the execution context.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Value;

/// Errors raised when a row does not fit the sheet shape.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SheetError {
    #[error("row has {actual} values but the sheet has {expected} columns")]
    WidthMismatch { expected: usize, actual: usize },
}

/// Ordered rows of typed values under named columns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataSheet {
    columns: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<Value>>,
}

impl DataSheet {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|name| name == column)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<&[Value]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    /// Appends a row whose width must match the column count.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), SheetError> {
        if row.len() != self.columns.len() {
            return Err(SheetError::WidthMismatch {
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let column_index = self.column_index(column)?;
        self.rows.get(row)?.get(column_index)
    }

    /// Overwrites one cell. Returns false when the row or column does not exist.
    pub fn set_value(&mut self, row: usize, column: &str, value: Value) -> bool {
        let Some(column_index) = self.column_index(column) else {
            return false;
        };
        match self.rows.get_mut(row).and_then(|cells| cells.get_mut(column_index)) {
            Some(cell) => {
                *cell = value;
                true
            }
            None => false,
        }
    }

    /// Column name/value pairs of one row.
    pub fn named_row(&self, index: usize) -> Option<impl Iterator<Item = (&str, &Value)>> {
        let row = self.rows.get(index)?;
        Some(self.columns.iter().map(String::as_str).zip(row.iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_row_rejects_wrong_width() {
        let mut sheet = DataSheet::new(["id", "name"]);
        sheet.push_row(vec![Value::Integer(1), Value::from("a")]).unwrap();
        let error = sheet.push_row(vec![Value::Integer(2)]).unwrap_err();
        assert_eq!(error, SheetError::WidthMismatch { expected: 2, actual: 1 });
        assert_eq!(sheet.len(), 1);
    }

    #[test]
    fn set_value_targets_named_cell() {
        let mut sheet = DataSheet::new(["id", "name"]);
        sheet.push_row(vec![Value::Integer(1), Value::from("a")]).unwrap();
        assert!(sheet.set_value(0, "name", Value::from("b")));
        assert!(!sheet.set_value(0, "missing", Value::Null));
        assert!(!sheet.set_value(3, "name", Value::Null));
        assert_eq!(sheet.value(0, "name"), Some(&Value::from("b")));
        let pairs: Vec<_> = sheet.named_row(0).unwrap().collect();
        assert_eq!(pairs, vec![("id", &Value::Integer(1)), ("name", &Value::from("b"))]);
    }
}
