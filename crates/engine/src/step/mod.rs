//! Prepared steps and the shared execution contract.
//!
//! Every step runs the same envelope: precondition, sheet-row guards, the
//! kind-specific body, then post-processing of the body's result into a jump
//! or a message.

use std::time::Instant;

use batchflow_types::{
    AccessLevel, ControlSignal, Message, MessageBinding, MessageDefinition, StepBodyDefinition, StepDefinition, Value,
};
use batchflow_util::format_positional;
use tracing::{debug, info};

use crate::batch::BatchStep;
use crate::context::ExecutionContext;
use crate::db::DbHandle;
use crate::errors::{EngineError, EngineResult};
use crate::expression::Expression;
use crate::fanout::FanOutStep;
use crate::runtime::Runtime;
use crate::sequence::{JumpTable, PrepareScope};

mod control;
mod simple;
mod sql;
mod sub_service;

pub(crate) use control::{BlockStep, LoopStep};
pub(crate) use simple::SimpleStep;
pub(crate) use sql::SqlStep;
pub(crate) use sub_service::SubServiceStep;

/// Where control goes after a step asked to jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpTarget {
    Signal(ControlSignal),
    /// Position within the enclosing sequence.
    Step(usize),
}

/// Result of running one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Precondition or guard not met; nothing ran.
    Skipped,
    Completed(Value),
    Jump(JumpTarget),
}

impl StepOutcome {
    pub(crate) fn stop() -> StepOutcome {
        StepOutcome::Jump(JumpTarget::Signal(ControlSignal::Stop))
    }

    pub(crate) fn is_stop(&self) -> bool {
        matches!(self, StepOutcome::Jump(JumpTarget::Signal(ControlSignal::Stop)))
    }
}

/// Catalog message bound to the fields that fill its placeholders.
#[derive(Debug, Clone)]
pub(crate) struct BoundMessage {
    name: String,
    definition: MessageDefinition,
    params: Vec<String>,
}

impl BoundMessage {
    pub(crate) fn bind(binding: &MessageBinding, scope: &PrepareScope<'_>, step: &str) -> EngineResult<BoundMessage> {
        Self::lookup(&binding.name, &binding.params, scope, step)
    }

    pub(crate) fn lookup(
        name: &str,
        params: &[String],
        scope: &PrepareScope<'_>,
        step: &str,
    ) -> EngineResult<BoundMessage> {
        let definition = scope.registry.message(name).cloned().ok_or_else(|| {
            EngineError::configuration(format!(
                "step '{step}' in service '{}' uses unknown message '{name}'",
                scope.service
            ))
        })?;
        Ok(BoundMessage {
            name: name.to_string(),
            definition,
            params: params.to_vec(),
        })
    }

    pub(crate) fn render(&self, context: &ExecutionContext) -> Message {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|field| context.value_or_null(field).to_string())
            .collect();
        Message::new(
            self.name.clone(),
            self.definition.severity,
            format_positional(&self.definition.text, &params),
        )
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StepHeader {
    name: String,
    condition: Option<Expression>,
    only_if_rows_in: Option<String>,
    only_if_no_rows_in: Option<String>,
    on_success: Option<JumpTarget>,
    on_failure: Option<JumpTarget>,
    success_message: Option<BoundMessage>,
    failure_message: Option<BoundMessage>,
    stop_if_message_is_error: bool,
}

#[derive(Debug)]
pub(crate) enum StepKind {
    Simple(SimpleStep),
    Sql(SqlStep),
    Block(BlockStep),
    Loop(LoopStep),
    SubService(SubServiceStep),
    FanOut(FanOutStep),
    Batch(Box<BatchStep>),
}

impl StepKind {
    fn label(&self) -> &'static str {
        match self {
            StepKind::Simple(simple) => simple.label(),
            StepKind::Sql(_) => "sql",
            StepKind::Block(_) => "block",
            StepKind::Loop(_) => "loop",
            StepKind::SubService(_) => "sub_service",
            StepKind::FanOut(_) => "fan_out",
            StepKind::Batch(_) => "batch",
        }
    }
}

/// A step ready to run: names resolved, expressions parsed, access computed.
#[derive(Debug)]
pub struct PreparedStep {
    header: StepHeader,
    kind: StepKind,
    access: AccessLevel,
}

impl PreparedStep {
    pub(crate) fn prepare(
        definition: &StepDefinition,
        name: String,
        jumps: &JumpTable,
        scope: &PrepareScope<'_>,
    ) -> EngineResult<PreparedStep> {
        let header_definition = &definition.header;
        let condition = Expression::parse_optional(header_definition.condition.as_deref()).map_err(|error| {
            EngineError::configuration(format!("step '{name}' in service '{}': {error}", scope.service))
        })?;
        let on_success = header_definition
            .on_success
            .as_deref()
            .map(|target| jumps.target(target, &name, scope))
            .transpose()?;
        let on_failure = header_definition
            .on_failure
            .as_deref()
            .map(|target| jumps.target(target, &name, scope))
            .transpose()?;
        let success_message = header_definition
            .success_message
            .as_ref()
            .map(|binding| BoundMessage::bind(binding, scope, &name))
            .transpose()?;
        let failure_message = header_definition
            .failure_message
            .as_ref()
            .map(|binding| BoundMessage::bind(binding, scope, &name))
            .transpose()?;

        let kind = match &definition.body {
            StepBodyDefinition::Sql(sql) => StepKind::Sql(SqlStep::prepare(sql, &name, scope)?),
            StepBodyDefinition::Block(block) => StepKind::Block(BlockStep::prepare(block, &name, scope)?),
            StepBodyDefinition::Loop(definition) => StepKind::Loop(LoopStep::prepare(definition, &name, scope)?),
            StepBodyDefinition::SubService { service } => {
                StepKind::SubService(SubServiceStep::prepare(service, &name, scope)?)
            }
            StepBodyDefinition::FanOut(fan_out) => StepKind::FanOut(FanOutStep::prepare(fan_out, &name, scope)?),
            StepBodyDefinition::Batch(batch) => StepKind::Batch(Box::new(BatchStep::prepare(batch, &name, scope)?)),
            simple => StepKind::Simple(SimpleStep::prepare(simple, &name, jumps, scope)?),
        };
        let access = match &kind {
            StepKind::Simple(simple) => simple.access(),
            StepKind::Sql(sql) => sql.access(),
            StepKind::Block(block) => block.access(),
            StepKind::Loop(looped) => looped.access(),
            StepKind::SubService(sub_service) => sub_service.access(),
            StepKind::FanOut(_) | StepKind::Batch(_) => AccessLevel::Delegated,
        };

        Ok(PreparedStep {
            header: StepHeader {
                name,
                condition,
                only_if_rows_in: header_definition.only_if_rows_in.clone(),
                only_if_no_rows_in: header_definition.only_if_no_rows_in.clone(),
                on_success,
                on_failure,
                success_message,
                failure_message,
                stop_if_message_is_error: header_definition.stop_if_message_is_error,
            },
            kind,
            access,
        })
    }

    /// Prepares a step that lives outside any sequence, such as a fan-out
    /// branch or a batch row step. Only reserved jump names can resolve.
    pub(crate) fn prepare_detached(
        definition: &StepDefinition,
        role: &str,
        scope: &PrepareScope<'_>,
    ) -> EngineResult<PreparedStep> {
        let name = match definition.header.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("{role}{}", scope.generated_name()),
        };
        PreparedStep::prepare(definition, name, &JumpTable::default(), &scope.detached())
    }

    pub fn name(&self) -> &str {
        &self.header.name
    }

    /// Declared or computed database requirement of this step.
    pub fn access(&self) -> AccessLevel {
        self.access
    }

    pub(crate) fn is_sub_service(&self) -> bool {
        matches!(self.kind, StepKind::SubService(_))
    }

    pub(crate) fn execute(
        &self,
        runtime: &Runtime,
        context: &mut ExecutionContext,
        db: Option<&mut DbHandle>,
    ) -> EngineResult<StepOutcome> {
        let name = self.header.name.as_str();
        if let Some(condition) = &self.header.condition
            && !condition.is_satisfied(context)?
        {
            info!(step = %name, condition = %condition.source(), "condition not met; skipping step");
            return Ok(StepOutcome::Skipped);
        }
        if let Some(sheet) = &self.header.only_if_rows_in
            && context.rows_in_sheet(sheet) == 0
        {
            debug!(step = %name, sheet = %sheet, "sheet has no rows; skipping step");
            return Ok(StepOutcome::Skipped);
        }
        if let Some(sheet) = &self.header.only_if_no_rows_in
            && context.rows_in_sheet(sheet) > 0
        {
            debug!(step = %name, sheet = %sheet, "sheet has rows; skipping step");
            return Ok(StepOutcome::Skipped);
        }

        let started = Instant::now();
        debug!(step = %name, kind = self.kind.label(), "step started");
        let outcome = match &self.kind {
            StepKind::Simple(simple) => simple.execute(runtime, name, context, db),
            StepKind::Sql(sql) => sql.execute(runtime, context, db),
            StepKind::Block(block) => block.execute(runtime, context, db),
            StepKind::Loop(looped) => looped.execute(runtime, name, context, db),
            StepKind::SubService(sub_service) => sub_service.execute(runtime, context, db),
            StepKind::FanOut(fan_out) => fan_out.execute(runtime, name, context, db),
            StepKind::Batch(batch) => batch.execute(runtime, context),
        }?;
        debug!(
            step = %name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = ?outcome,
            "step finished"
        );

        match outcome {
            StepOutcome::Completed(result) => Ok(self.post_process(context, result)),
            other => Ok(other),
        }
    }

    /// Turns a completed result into the configured jump or message.
    fn post_process(&self, context: &mut ExecutionContext, result: Value) -> StepOutcome {
        let header = &self.header;
        let (jump, message) = if result.is_truthy() {
            (header.on_success, header.success_message.as_ref())
        } else {
            (header.on_failure, header.failure_message.as_ref())
        };
        if let Some(target) = jump {
            return StepOutcome::Jump(target);
        }
        if let Some(binding) = message {
            let message = binding.render(context);
            let is_error = message.is_error();
            context.add_message(message);
            if is_error && header.stop_if_message_is_error {
                info!(step = %header.name, "error message raised; stopping invocation");
                return StepOutcome::stop();
            }
        }
        StepOutcome::Completed(result)
    }
}
