use batchflow_types::AccessLevel;

use super::StepOutcome;
use crate::context::ExecutionContext;
use crate::db::DbHandle;
use crate::errors::{EngineError, EngineResult};
use crate::runtime::Runtime;
use crate::sequence::PrepareScope;

/// Invokes another service on the caller's context. The callee reuses the
/// caller's handle when its own declared access allows it.
#[derive(Debug)]
pub(crate) struct SubServiceStep {
    service: String,
    access: AccessLevel,
}

impl SubServiceStep {
    pub(crate) fn prepare(service: &str, name: &str, scope: &PrepareScope<'_>) -> EngineResult<SubServiceStep> {
        let callee = scope.registry.service(service).ok_or_else(|| {
            EngineError::configuration(format!(
                "step '{name}' in service '{}' calls unknown service '{service}'",
                scope.service
            ))
        })?;
        Ok(SubServiceStep {
            service: service.to_string(),
            access: callee.access,
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
        runtime.service(&self.service)?.execute_as_step(runtime, context, db)
    }
}
