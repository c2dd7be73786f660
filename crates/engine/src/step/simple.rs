//! In-memory step kinds.

use std::fmt;
use std::sync::Arc;

use batchflow_types::{AccessLevel, DataSheet, StepBodyDefinition, Value};
use batchflow_util::field_reference;
use tracing::info;

use super::{BoundMessage, JumpTarget, StepOutcome};
use crate::context::ExecutionContext;
use crate::db::DbHandle;
use crate::errors::{EngineError, EngineResult};
use crate::registry::StepLogic;
use crate::runtime::Runtime;
use crate::sequence::{JumpTable, PrepareScope};
use crate::transaction::negotiate;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ValueSource {
    Literal(Value),
    Field(String),
}

pub(crate) enum SimpleStep {
    SetValue { field: String, source: ValueSource },
    RemoveValue { field: String },
    AddMessage(BoundMessage),
    JumpTo(JumpTarget),
    Log { fields: Vec<String> },
    CreateSheet { sheet: String, template: DataSheet },
    Logic { name: String, logic: Arc<dyn StepLogic> },
    DropIntoMessageBox { field: String },
    PickupFromMessageBox { field: String },
}

impl fmt::Debug for SimpleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimpleStep::Logic { name, logic } => f
                .debug_struct("Logic")
                .field("name", name)
                .field("access", &logic.access())
                .finish(),
            SimpleStep::SetValue { field, source } => {
                f.debug_struct("SetValue").field("field", field).field("source", source).finish()
            }
            SimpleStep::RemoveValue { field } => f.debug_struct("RemoveValue").field("field", field).finish(),
            SimpleStep::AddMessage(message) => f.debug_tuple("AddMessage").field(message).finish(),
            SimpleStep::JumpTo(target) => f.debug_tuple("JumpTo").field(target).finish(),
            SimpleStep::Log { fields } => f.debug_struct("Log").field("fields", fields).finish(),
            SimpleStep::CreateSheet { sheet, template } => f
                .debug_struct("CreateSheet")
                .field("sheet", sheet)
                .field("rows", &template.len())
                .finish(),
            SimpleStep::DropIntoMessageBox { field } => {
                f.debug_struct("DropIntoMessageBox").field("field", field).finish()
            }
            SimpleStep::PickupFromMessageBox { field } => {
                f.debug_struct("PickupFromMessageBox").field("field", field).finish()
            }
        }
    }
}

impl SimpleStep {
    pub(crate) fn prepare(
        body: &StepBodyDefinition,
        name: &str,
        jumps: &JumpTable,
        scope: &PrepareScope<'_>,
    ) -> EngineResult<SimpleStep> {
        let step = match body {
            StepBodyDefinition::SetValue { field, value } => {
                let source = match value.as_text().and_then(field_reference) {
                    Some(reference) => ValueSource::Field(reference.to_string()),
                    None => ValueSource::Literal(value.clone()),
                };
                SimpleStep::SetValue {
                    field: field.clone(),
                    source,
                }
            }
            StepBodyDefinition::RemoveValue { field } => SimpleStep::RemoveValue { field: field.clone() },
            StepBodyDefinition::AddMessage { message, params } => {
                SimpleStep::AddMessage(BoundMessage::lookup(message, params, scope, name)?)
            }
            StepBodyDefinition::JumpTo { target } => SimpleStep::JumpTo(jumps.target(target, name, scope)?),
            StepBodyDefinition::Log { fields } => SimpleStep::Log { fields: fields.clone() },
            StepBodyDefinition::CreateSheet { sheet, columns, rows } => {
                let mut template = DataSheet::new(columns.iter().cloned());
                for row in rows {
                    template.push_row(row.clone()).map_err(|error| {
                        EngineError::configuration(format!("sheet '{sheet}' in step '{name}': {error}"))
                    })?;
                }
                SimpleStep::CreateSheet {
                    sheet: sheet.clone(),
                    template,
                }
            }
            StepBodyDefinition::Logic { logic } => {
                let implementation = scope.registry.logic(logic).ok_or_else(|| {
                    EngineError::configuration(format!(
                        "step '{name}' in service '{}' uses unregistered logic '{logic}'",
                        scope.service
                    ))
                })?;
                SimpleStep::Logic {
                    name: logic.clone(),
                    logic: implementation,
                }
            }
            StepBodyDefinition::DropIntoMessageBox { field } => {
                SimpleStep::DropIntoMessageBox { field: field.clone() }
            }
            StepBodyDefinition::PickupFromMessageBox { field } => {
                SimpleStep::PickupFromMessageBox { field: field.clone() }
            }
            other => {
                return Err(EngineError::configuration(format!(
                    "step '{name}' has a body that is not a simple step: {other:?}"
                )));
            }
        };
        Ok(step)
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            SimpleStep::SetValue { .. } => "set_value",
            SimpleStep::RemoveValue { .. } => "remove_value",
            SimpleStep::AddMessage(_) => "add_message",
            SimpleStep::JumpTo(_) => "jump_to",
            SimpleStep::Log { .. } => "log",
            SimpleStep::CreateSheet { .. } => "create_sheet",
            SimpleStep::Logic { .. } => "logic",
            SimpleStep::DropIntoMessageBox { .. } => "drop_into_message_box",
            SimpleStep::PickupFromMessageBox { .. } => "pickup_from_message_box",
        }
    }

    pub(crate) fn access(&self) -> AccessLevel {
        match self {
            SimpleStep::Logic { logic, .. } => logic.access(),
            _ => AccessLevel::None,
        }
    }

    pub(crate) fn execute(
        &self,
        runtime: &Runtime,
        step: &str,
        context: &mut ExecutionContext,
        db: Option<&mut DbHandle>,
    ) -> EngineResult<StepOutcome> {
        let result = match self {
            SimpleStep::SetValue { field, source } => {
                let value = match source {
                    ValueSource::Literal(value) => value.clone(),
                    ValueSource::Field(other) => context.value_or_null(other),
                };
                context.set_value(field.clone(), value);
                Value::Boolean(true)
            }
            SimpleStep::RemoveValue { field } => Value::Boolean(context.remove_value(field).is_some()),
            SimpleStep::AddMessage(binding) => {
                let message = binding.render(context);
                let is_error = message.is_error();
                context.add_message(message);
                Value::Boolean(!is_error)
            }
            SimpleStep::JumpTo(target) => return Ok(StepOutcome::Jump(*target)),
            SimpleStep::Log { fields } => {
                let rendered = if fields.is_empty() {
                    render_fields(context.fields().iter().map(|(name, value)| (name.as_str(), value.clone())))
                } else {
                    render_fields(fields.iter().map(|name| (name.as_str(), context.value_or_null(name))))
                };
                info!(step = %step, fields = %rendered, "log");
                Value::Boolean(true)
            }
            SimpleStep::CreateSheet { sheet, template } => {
                context.put_sheet(sheet.clone(), template.clone());
                Value::Boolean(true)
            }
            SimpleStep::Logic { logic, .. } => negotiate(runtime, logic.access(), None, context, db, |context, db| {
                Ok(logic.execute(context, db)?)
            })?,
            SimpleStep::DropIntoMessageBox { field } => {
                let value = context.value_or_null(field);
                context.drop_into_message_box(value);
                Value::Boolean(true)
            }
            SimpleStep::PickupFromMessageBox { field } => match context.pickup_from_message_box() {
                Some(value) => {
                    context.set_value(field.clone(), value);
                    Value::Boolean(true)
                }
                None => Value::Boolean(false),
            },
        };
        Ok(StepOutcome::Completed(result))
    }
}

fn render_fields<'a>(fields: impl Iterator<Item = (&'a str, Value)>) -> String {
    fields
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}
