use batchflow_types::{AccessLevel, SqlOperation, SqlStepDefinition, Value};

use super::StepOutcome;
use crate::context::ExecutionContext;
use crate::db::DbHandle;
use crate::errors::{EngineError, EngineResult};
use crate::runtime::Runtime;
use crate::sequence::PrepareScope;
use crate::transaction::negotiate;

/// Database-bound step: an update returning its row count, or a query
/// storing its rows as a sheet.
#[derive(Debug)]
pub(crate) struct SqlStep {
    statement: String,
    operation: SqlOperation,
    sheet: String,
    access: AccessLevel,
    schema: Option<String>,
}

impl SqlStep {
    pub(crate) fn prepare(definition: &SqlStepDefinition, name: &str, scope: &PrepareScope<'_>) -> EngineResult<SqlStep> {
        if definition.statement.trim().is_empty() {
            return Err(EngineError::configuration(format!(
                "sql step '{name}' in service '{}' has an empty statement",
                scope.service
            )));
        }
        let access = definition.access.unwrap_or(match definition.operation {
            SqlOperation::Update => AccessLevel::ReadWrite,
            SqlOperation::Query => AccessLevel::ReadOnly,
        });
        if matches!(access, AccessLevel::None | AccessLevel::Delegated) {
            return Err(EngineError::configuration(format!(
                "sql step '{name}' in service '{}' cannot run with {access} access",
                scope.service
            )));
        }
        if definition.operation == SqlOperation::Update && !access.updates_database() {
            return Err(EngineError::configuration(format!(
                "update step '{name}' in service '{}' needs read_write access",
                scope.service
            )));
        }
        Ok(SqlStep {
            statement: definition.statement.clone(),
            operation: definition.operation,
            sheet: definition.sheet.clone().unwrap_or_else(|| name.to_string()),
            access,
            schema: definition.schema.clone(),
        })
    }

    pub(crate) fn access(&self) -> AccessLevel {
        self.access
    }

    pub(crate) fn execute(
        &self,
        runtime: &Runtime,
        context: &mut ExecutionContext,
        db: Option<&mut DbHandle>,
    ) -> EngineResult<StepOutcome> {
        let rows = negotiate(runtime, self.access, self.schema.as_deref(), context, db, |context, db| {
            let handle = db.ok_or_else(|| EngineError::configuration("sql step ran without a database connection"))?;
            match self.operation {
                SqlOperation::Update => Ok(handle.execute(&self.statement, context)?),
                SqlOperation::Query => {
                    let sheet = handle.query(&self.statement, context)?;
                    let rows = sheet.len() as u64;
                    context.put_sheet(self.sheet.clone(), sheet);
                    Ok(rows)
                }
            }
        })?;
        Ok(StepOutcome::Completed(Value::Integer(i64::try_from(rows).unwrap_or(i64::MAX))))
    }
}
