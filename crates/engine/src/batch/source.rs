//! Row source contract and the built-in sheet, query and queue adapters.

use std::collections::VecDeque;

use anyhow::{Result, anyhow};
use batchflow_types::{ColumnDefinition, DataSheet, Message, Row, Value, ValueType};
use thiserror::Error;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::db::DbHandle;
use crate::messaging::SharedSession;

/// Failure reading one input row.
#[derive(Debug, Error)]
pub enum RowError {
    /// The row was read but its data is unusable. The batch continues with
    /// the next row.
    #[error("row failed validation with {} message(s)", .messages.len())]
    Invalid { row: Row, messages: Vec<Message> },
    /// The source itself failed; the current run cannot continue.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Supplies rows to one level of a batch processor.
pub trait RowSource: Send {
    fn open_shop(&mut self, context: &mut ExecutionContext, db: Option<&mut DbHandle>) -> Result<()>;

    /// Next row, or `None` once the source is exhausted.
    fn input_row(&mut self, context: &ExecutionContext) -> Result<Option<Row>, RowError>;

    fn close_shop(&mut self, context: &mut ExecutionContext) -> Result<()>;
}

/// Creates a fresh [`RowSource`] for each batch run.
pub trait RowSourceFactory: Send + Sync {
    fn create(&self, context: &ExecutionContext) -> Result<Box<dyn RowSource>>;
}

impl<F> RowSourceFactory for F
where
    F: Fn(&ExecutionContext) -> Result<Box<dyn RowSource>> + Send + Sync,
{
    fn create(&self, context: &ExecutionContext) -> Result<Box<dyn RowSource>> {
        self(context)
    }
}

/// Converts text cells to their declared types and checks required columns.
///
/// Cells that are already typed pass through unchanged. Every failing column
/// contributes one error message; any message makes the row invalid.
pub fn validate_row(columns: &[ColumnDefinition], mut row: Row) -> Result<Row, RowError> {
    let mut messages = Vec::new();
    for column in columns {
        let parsed = match row.get(&column.name) {
            Some(Value::Text(raw)) if column.value_type != ValueType::Text => match Value::parse(raw, column.value_type) {
                Ok(value) => Some(value),
                Err(error) => {
                    messages.push(Message::error("invalid_value", error.to_string()).for_field(&column.name));
                    None
                }
            },
            Some(Value::Text(raw)) if raw.trim().is_empty() => Some(Value::Null),
            _ => None,
        };
        if let Some(value) = parsed {
            row.insert(column.name.clone(), value);
        }
        let missing = row.get(&column.name).is_none_or(Value::is_null);
        if column.required && missing && !messages.iter().any(|m| m.field.as_deref() == Some(column.name.as_str())) {
            messages.push(
                Message::error("required_value", format!("{} is required", column.name)).for_field(&column.name),
            );
        }
    }
    if messages.is_empty() {
        Ok(row)
    } else {
        Err(RowError::Invalid { row, messages })
    }
}

pub(crate) fn sheet_rows(sheet: &DataSheet) -> VecDeque<Row> {
    sheet
        .rows()
        .iter()
        .map(|cells| sheet.columns().iter().cloned().zip(cells.iter().cloned()).collect())
        .collect()
}

/// Reads the rows of a context sheet as they were when the shop opened.
#[derive(Debug)]
pub struct SheetSource {
    sheet: String,
    columns: Vec<ColumnDefinition>,
    rows: VecDeque<Row>,
}

impl SheetSource {
    pub fn new(sheet: impl Into<String>, columns: Vec<ColumnDefinition>) -> Self {
        Self {
            sheet: sheet.into(),
            columns,
            rows: VecDeque::new(),
        }
    }
}

impl RowSource for SheetSource {
    fn open_shop(&mut self, context: &mut ExecutionContext, _db: Option<&mut DbHandle>) -> Result<()> {
        self.rows = match context.sheet(&self.sheet) {
            Some(sheet) => sheet_rows(sheet),
            None => {
                debug!(sheet = %self.sheet, "source sheet does not exist");
                VecDeque::new()
            }
        };
        Ok(())
    }

    fn input_row(&mut self, _context: &ExecutionContext) -> Result<Option<Row>, RowError> {
        self.rows.pop_front().map(|row| validate_row(&self.columns, row)).transpose()
    }

    fn close_shop(&mut self, _context: &mut ExecutionContext) -> Result<()> {
        self.rows.clear();
        Ok(())
    }
}

/// Runs a query when the shop opens and hands out its rows.
#[derive(Debug)]
pub struct SqlSource {
    statement: String,
    columns: Vec<ColumnDefinition>,
    rows: VecDeque<Row>,
}

impl SqlSource {
    pub fn new(statement: impl Into<String>, columns: Vec<ColumnDefinition>) -> Self {
        Self {
            statement: statement.into(),
            columns,
            rows: VecDeque::new(),
        }
    }
}

impl RowSource for SqlSource {
    fn open_shop(&mut self, context: &mut ExecutionContext, db: Option<&mut DbHandle>) -> Result<()> {
        let handle = db.ok_or_else(|| anyhow!("sql row source needs a database connection"))?;
        let sheet = handle.query(&self.statement, context)?;
        debug!(rows = sheet.len(), "sql row source opened");
        self.rows = sheet_rows(&sheet);
        Ok(())
    }

    fn input_row(&mut self, _context: &ExecutionContext) -> Result<Option<Row>, RowError> {
        self.rows.pop_front().map(|row| validate_row(&self.columns, row)).transpose()
    }

    fn close_shop(&mut self, _context: &mut ExecutionContext) -> Result<()> {
        self.rows.clear();
        Ok(())
    }
}

/// Receives messages from a broker queue on the run's shared session.
pub(crate) struct QueueSource {
    queue: String,
    columns: Vec<ColumnDefinition>,
    session: SharedSession,
}

impl QueueSource {
    pub(crate) fn new(queue: impl Into<String>, columns: Vec<ColumnDefinition>, session: SharedSession) -> Self {
        Self {
            queue: queue.into(),
            columns,
            session,
        }
    }
}

impl RowSource for QueueSource {
    fn open_shop(&mut self, _context: &mut ExecutionContext, _db: Option<&mut DbHandle>) -> Result<()> {
        debug!(queue = %self.queue, "queue row source opened");
        Ok(())
    }

    fn input_row(&mut self, _context: &ExecutionContext) -> Result<Option<Row>, RowError> {
        let received = self.session.with(|session| session.receive(&self.queue))?;
        received.map(|row| validate_row(&self.columns, row)).transpose()
    }

    fn close_shop(&mut self, _context: &mut ExecutionContext) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, value_type: ValueType, required: bool) -> ColumnDefinition {
        ColumnDefinition {
            name: name.to_string(),
            value_type,
            required,
        }
    }

    #[test]
    fn text_cells_are_parsed_to_declared_types() {
        let columns = vec![column("id", ValueType::Integer, true), column("note", ValueType::Text, false)];
        let row: Row = [("id".to_string(), Value::from("42")), ("note".to_string(), Value::from(""))]
            .into_iter()
            .collect();
        let row = validate_row(&columns, row).unwrap();
        assert_eq!(row["id"], Value::Integer(42));
        assert_eq!(row["note"], Value::Null);
    }

    #[test]
    fn bad_and_missing_values_make_the_row_invalid() {
        let columns = vec![column("id", ValueType::Integer, true), column("day", ValueType::Date, true)];
        let row: Row = [("id".to_string(), Value::from("x1"))].into_iter().collect();
        match validate_row(&columns, row) {
            Err(RowError::Invalid { messages, .. }) => {
                assert_eq!(messages.len(), 2);
                assert_eq!(messages[0].field.as_deref(), Some("id"));
                assert_eq!(messages[1].name, "required_value");
            }
            other => panic!("expected invalid row, got {other:?}"),
        }
    }

    #[test]
    fn sheet_source_snapshots_rows_at_open() {
        let mut context = ExecutionContext::new();
        let mut sheet = DataSheet::new(["a"]);
        sheet.push_row(vec![Value::Integer(1)]).unwrap();
        sheet.push_row(vec![Value::Integer(2)]).unwrap();
        context.put_sheet("input", sheet);

        let mut source = SheetSource::new("input", Vec::new());
        source.open_shop(&mut context, None).unwrap();
        context.remove_sheet("input");
        let first = source.input_row(&context).unwrap().unwrap();
        assert_eq!(first["a"], Value::Integer(1));
        assert!(source.input_row(&context).unwrap().is_some());
        assert!(source.input_row(&context).unwrap().is_none());
    }
}
