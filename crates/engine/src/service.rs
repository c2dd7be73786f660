//! Prepared services and top-level invocation.

use std::cell::Cell;

use batchflow_types::{AccessLevel, ControlSignal, ServiceDefinition, Value};
use serde::Serialize;
use tracing::{info, warn};

use crate::context::ExecutionContext;
use crate::db::DbHandle;
use crate::errors::{EngineError, EngineResult};
use crate::registry::ComponentRegistry;
use crate::runtime::Runtime;
use crate::sequence::{PrepareScope, StepSequence};
use crate::step::{JumpTarget, StepOutcome};
use crate::transaction::{negotiate, run_scoped};

/// How a top-level invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// Every step ran to the end of the sequence.
    Completed,
    /// A step raised STOP; work done so far was still committed.
    Stopped,
}

#[derive(Debug)]
pub struct Service {
    name: String,
    access: AccessLevel,
    schema: Option<String>,
    steps: StepSequence,
}

impl Service {
    pub(crate) fn prepare(definition: &ServiceDefinition, registry: &ComponentRegistry) -> EngineResult<Service> {
        let generated_names = Cell::new(0);
        let scope = PrepareScope::root(registry, &definition.service, &generated_names);
        let steps = StepSequence::prepare(&definition.steps, &scope)?;
        steps.validate_access(definition.access, &format!("service '{}'", definition.service))?;
        Ok(Service {
            name: definition.service.clone(),
            access: definition.access,
            schema: definition.schema.clone(),
            steps,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn access(&self) -> AccessLevel {
        self.access
    }

    pub fn steps(&self) -> &StepSequence {
        &self.steps
    }

    /// Runs the service as the outermost component, owning its transaction.
    pub(crate) fn invoke(&self, runtime: &Runtime, context: &mut ExecutionContext) -> EngineResult<InvocationStatus> {
        info!(service = %self.name, access = %self.access, "invoking service");
        let result = match self.access.connection_level() {
            Some(level) => run_scoped(runtime, level, self.schema.as_deref(), context, |context, db| {
                self.steps.run(runtime, context, db)
            }),
            None => self.steps.run(runtime, context, None),
        };
        let signal = match result {
            Ok(signal) => signal,
            Err(error) => {
                warn!(service = %self.name, error = %error, "invocation failed");
                return Err(error);
            }
        };
        let status = match signal {
            None => InvocationStatus::Completed,
            Some(ControlSignal::Stop) => InvocationStatus::Stopped,
            Some(other) => {
                return Err(EngineError::configuration(format!(
                    "'{other}' escaped service '{}' outside of a loop",
                    self.name
                )));
            }
        };
        info!(
            service = %self.name,
            status = ?status,
            in_error = context.in_error(),
            messages = context.messages().len(),
            "invocation finished"
        );
        Ok(status)
    }

    /// Runs the service as a step of another service. STOP propagates so the
    /// whole invocation ends; the step result is whether the context is
    /// free of errors.
    pub(crate) fn execute_as_step(
        &self,
        runtime: &Runtime,
        context: &mut ExecutionContext,
        db: Option<&mut DbHandle>,
    ) -> EngineResult<StepOutcome> {
        let signal = negotiate(runtime, self.access, self.schema.as_deref(), context, db, |context, db| {
            self.steps.run(runtime, context, db)
        })?;
        Ok(match signal {
            Some(signal) => StepOutcome::Jump(JumpTarget::Signal(signal)),
            None => StepOutcome::Completed(Value::Boolean(!context.in_error())),
        })
    }
}
