//! Blocks and loops: steps whose body is a nested sequence.

use batchflow_types::{AccessLevel, BlockDefinition, ControlSignal, LoopDefinition, Value};
use tracing::debug;

use super::{JumpTarget, StepOutcome};
use crate::context::ExecutionContext;
use crate::db::DbHandle;
use crate::errors::{EngineError, EngineResult};
use crate::expression::Expression;
use crate::runtime::Runtime;
use crate::sequence::{PrepareScope, StepSequence};
use crate::transaction::negotiate;

/// Column-to-field selection; `["*"]` selects every column.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ColumnSelection {
    All,
    Named(Vec<String>),
}

impl ColumnSelection {
    fn from_list(columns: &[String]) -> Self {
        if columns.iter().any(|column| column == "*") {
            ColumnSelection::All
        } else {
            ColumnSelection::Named(columns.to_vec())
        }
    }

    fn resolve(&self, available: &[String]) -> Vec<(usize, String)> {
        available
            .iter()
            .enumerate()
            .filter(|(_, column)| match self {
                ColumnSelection::All => true,
                ColumnSelection::Named(names) => names.contains(column),
            })
            .map(|(index, column)| (index, column.clone()))
            .collect()
    }
}

fn signal_outcome(signal: Option<ControlSignal>, context: &ExecutionContext) -> StepOutcome {
    match signal {
        Some(signal) => StepOutcome::Jump(JumpTarget::Signal(signal)),
        None => StepOutcome::Completed(Value::Boolean(!context.in_error())),
    }
}

#[derive(Debug)]
pub(crate) struct BlockStep {
    declared: Option<AccessLevel>,
    access: AccessLevel,
    body: StepSequence,
}

impl BlockStep {
    pub(crate) fn prepare(definition: &BlockDefinition, name: &str, scope: &PrepareScope<'_>) -> EngineResult<BlockStep> {
        let body = StepSequence::prepare(&definition.steps, scope)?;
        if let Some(declared) = definition.access {
            body.validate_access(declared, &format!("block '{name}'"))?;
        }
        Ok(BlockStep {
            declared: definition.access,
            access: definition.access.unwrap_or_else(|| body.required_access()),
            body,
        })
    }

    pub(crate) fn access(&self) -> AccessLevel {
        self.access
    }

    /// Runs the nested sequence; signals propagate to the caller unchanged.
    pub(crate) fn execute(
        &self,
        runtime: &Runtime,
        context: &mut ExecutionContext,
        db: Option<&mut DbHandle>,
    ) -> EngineResult<StepOutcome> {
        let signal = match self.declared {
            Some(level) => negotiate(runtime, level, None, context, db, |context, db| {
                self.body.run(runtime, context, db)
            })?,
            None => self.body.run(runtime, context, db)?,
        };
        Ok(signal_outcome(signal, context))
    }
}

#[derive(Debug)]
enum LoopMode {
    Sheet(String),
    While(Expression),
}

#[derive(Debug)]
pub(crate) struct LoopStep {
    mode: LoopMode,
    columns_to_fields: ColumnSelection,
    fields_to_columns: ColumnSelection,
    declared: Option<AccessLevel>,
    access: AccessLevel,
    body: StepSequence,
}

impl LoopStep {
    pub(crate) fn prepare(definition: &LoopDefinition, name: &str, scope: &PrepareScope<'_>) -> EngineResult<LoopStep> {
        let sheet = definition.sheet.as_deref().map(str::trim).filter(|sheet| !sheet.is_empty());
        let mode = match (sheet, definition.while_condition.as_deref()) {
            (Some(sheet), None) => {
                if scope.loop_sheets.iter().any(|outer| outer == sheet) {
                    return Err(EngineError::configuration(format!(
                        "loop '{name}' in service '{}' iterates sheet '{sheet}' which an enclosing loop already iterates",
                        scope.service
                    )));
                }
                LoopMode::Sheet(sheet.to_string())
            }
            (None, Some(condition)) => LoopMode::While(Expression::parse(condition).map_err(|error| {
                EngineError::configuration(format!("loop '{name}' in service '{}': {error}", scope.service))
            })?),
            _ => {
                return Err(EngineError::configuration(format!(
                    "loop '{name}' in service '{}' needs exactly one of 'sheet' or 'while'",
                    scope.service
                )));
            }
        };

        let body_scope = scope.inside_loop(match &mode {
            LoopMode::Sheet(sheet) => Some(sheet.as_str()),
            LoopMode::While(_) => None,
        });
        let body = StepSequence::prepare(&definition.steps, &body_scope)?;
        if let Some(declared) = definition.access {
            body.validate_access(declared, &format!("loop '{name}'"))?;
        }
        Ok(LoopStep {
            mode,
            columns_to_fields: ColumnSelection::from_list(&definition.columns_to_fields),
            fields_to_columns: ColumnSelection::from_list(&definition.fields_to_columns),
            declared: definition.access,
            access: definition.access.unwrap_or_else(|| body.required_access()),
            body,
        })
    }

    pub(crate) fn access(&self) -> AccessLevel {
        self.access
    }

    pub(crate) fn execute(
        &self,
        runtime: &Runtime,
        step: &str,
        context: &mut ExecutionContext,
        db: Option<&mut DbHandle>,
    ) -> EngineResult<StepOutcome> {
        match self.declared {
            Some(level) => negotiate(runtime, level, None, context, db, |context, db| {
                self.iterate(runtime, step, context, db)
            }),
            None => self.iterate(runtime, step, context, db),
        }
    }

    fn iterate(
        &self,
        runtime: &Runtime,
        step: &str,
        context: &mut ExecutionContext,
        mut db: Option<&mut DbHandle>,
    ) -> EngineResult<StepOutcome> {
        match &self.mode {
            LoopMode::While(condition) => {
                let mut iterations = 0usize;
                while condition.is_satisfied(context)? {
                    iterations += 1;
                    match self.body.run(runtime, context, db.as_deref_mut())? {
                        None | Some(ControlSignal::Continue) => {}
                        Some(ControlSignal::Break) => break,
                        Some(ControlSignal::Stop) => return Ok(StepOutcome::stop()),
                    }
                }
                debug!(step = %step, iterations, "while loop finished");
                Ok(StepOutcome::Completed(Value::Boolean(true)))
            }
            LoopMode::Sheet(sheet) => self.iterate_sheet(runtime, step, sheet, context, db),
        }
    }

    fn iterate_sheet(
        &self,
        runtime: &Runtime,
        step: &str,
        sheet_name: &str,
        context: &mut ExecutionContext,
        mut db: Option<&mut DbHandle>,
    ) -> EngineResult<StepOutcome> {
        let Some(sheet) = context.sheet(sheet_name) else {
            debug!(step = %step, sheet = %sheet_name, "loop sheet does not exist");
            return Ok(StepOutcome::Completed(Value::Boolean(true)));
        };
        let copied = self.columns_to_fields.resolve(sheet.columns());
        let saved: Vec<(String, Option<Value>)> = copied
            .iter()
            .map(|(_, column)| (column.clone(), context.value(column).cloned()))
            .collect();

        let mut row = 0usize;
        let mut stopped = false;
        loop {
            let Some(values) = context.sheet(sheet_name).and_then(|sheet| {
                let cells = sheet.row(row)?;
                Some(
                    copied
                        .iter()
                        .filter_map(|(index, column)| cells.get(*index).map(|value| (column.clone(), value.clone())))
                        .collect::<Vec<_>>(),
                )
            }) else {
                break;
            };
            for (column, value) in values {
                context.set_value(column, value);
            }

            let signal = self.body.run(runtime, context, db.as_deref_mut())?;
            self.write_back(context, sheet_name, row);
            row += 1;
            match signal {
                None | Some(ControlSignal::Continue) => {}
                Some(ControlSignal::Break) => break,
                Some(ControlSignal::Stop) => {
                    stopped = true;
                    break;
                }
            }
        }

        for (field, value) in saved {
            match value {
                Some(value) => context.set_value(field, value),
                None => {
                    context.remove_value(&field);
                }
            }
        }
        debug!(step = %step, sheet = %sheet_name, rows = row, "sheet loop finished");
        if stopped {
            return Ok(StepOutcome::stop());
        }
        Ok(StepOutcome::Completed(Value::Boolean(true)))
    }

    /// Copies the selected fields back into the current row.
    fn write_back(&self, context: &mut ExecutionContext, sheet_name: &str, row: usize) {
        if self.fields_to_columns == ColumnSelection::Named(Vec::new()) {
            return;
        }
        let Some(sheet) = context.sheet(sheet_name) else { return };
        let updates: Vec<(String, Value)> = self
            .fields_to_columns
            .resolve(sheet.columns())
            .into_iter()
            .filter_map(|(_, column)| context.value(&column).cloned().map(|value| (column, value)))
            .collect();
        if let Some(sheet) = context.sheet_mut(sheet_name) {
            for (column, value) in updates {
                sheet.set_value(row, &column, value);
            }
        }
    }
}
