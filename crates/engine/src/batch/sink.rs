//! Output sink contract and the context sheet sink.

use anyhow::{Context, Result};
use batchflow_types::{DataSheet, Value};

use crate::context::ExecutionContext;

/// Receives one output row per processed input row.
pub trait RowSink: Send {
    fn open_shop(&mut self, context: &mut ExecutionContext) -> Result<()>;

    /// Writes the current row from the context. Returns whether a row was written.
    fn output_row(&mut self, context: &mut ExecutionContext) -> Result<bool>;

    fn close_shop(&mut self, context: &mut ExecutionContext) -> Result<()>;
}

pub trait RowSinkFactory: Send + Sync {
    fn create(&self, context: &ExecutionContext) -> Result<Box<dyn RowSink>>;
}

impl<F> RowSinkFactory for F
where
    F: Fn(&ExecutionContext) -> Result<Box<dyn RowSink>> + Send + Sync,
{
    fn create(&self, context: &ExecutionContext) -> Result<Box<dyn RowSink>> {
        self(context)
    }
}

/// Appends the selected fields as a row of a context sheet. The sheet is
/// replaced by an empty one when the shop opens.
#[derive(Debug)]
pub struct SheetSink {
    sheet: String,
    columns: Vec<String>,
}

impl SheetSink {
    pub fn new(sheet: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            sheet: sheet.into(),
            columns,
        }
    }
}

impl RowSink for SheetSink {
    fn open_shop(&mut self, context: &mut ExecutionContext) -> Result<()> {
        context.put_sheet(self.sheet.clone(), DataSheet::new(self.columns.iter().cloned()));
        Ok(())
    }

    fn output_row(&mut self, context: &mut ExecutionContext) -> Result<bool> {
        let row: Vec<Value> = self.columns.iter().map(|column| context.value_or_null(column)).collect();
        if context.sheet(&self.sheet).is_none() {
            context.put_sheet(self.sheet.clone(), DataSheet::new(self.columns.iter().cloned()));
        }
        let Some(sheet) = context.sheet_mut(&self.sheet) else {
            return Ok(false);
        };
        sheet
            .push_row(row)
            .with_context(|| format!("failed to append a row to sheet '{}'", self.sheet))?;
        Ok(true)
    }

    fn close_shop(&mut self, _context: &mut ExecutionContext) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sheet_sink_collects_selected_fields() {
        let mut context = ExecutionContext::new();
        let mut sink = SheetSink::new("out", vec!["id".to_string(), "total".to_string()]);
        sink.open_shop(&mut context).unwrap();
        context.set_value("id", 7i64);
        assert!(sink.output_row(&mut context).unwrap());
        context.set_value("total", 2.5);
        assert!(sink.output_row(&mut context).unwrap());

        let sheet = context.sheet("out").unwrap();
        assert_eq!(sheet.len(), 2);
        assert_eq!(sheet.value(0, "total"), Some(&Value::Null));
        assert_eq!(sheet.value(1, "total"), Some(&Value::Decimal(2.5)));
    }
}
