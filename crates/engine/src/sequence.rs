//! Ordered step lists with named jumps.
//!
//! A sequence is an instruction pointer walking a flat list of prepared
//! steps. Jump names are resolved to positions once at prepare time; control
//! signals leave the sequence and are handed to the caller.

use std::cell::Cell;

use batchflow_types::{AccessLevel, ControlSignal, StepDefinition};
use indexmap::IndexMap;
use tracing::trace;

use crate::context::ExecutionContext;
use crate::db::DbHandle;
use crate::errors::{EngineError, EngineResult};
use crate::registry::ComponentRegistry;
use crate::runtime::Runtime;
use crate::step::{JumpTarget, PreparedStep, StepOutcome};

/// Suffix of the context field holding a completed step's result.
pub const RESULT_SUFFIX: &str = "Result";

/// Step name to position within one sequence.
#[derive(Debug, Clone, Default)]
pub struct JumpTable {
    positions: IndexMap<String, usize>,
}

impl JumpTable {
    pub fn resolve(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Resolves a jump written by step `step`. Reserved names become signals;
    /// break and continue are only accepted inside a loop.
    pub(crate) fn target(&self, name: &str, step: &str, scope: &PrepareScope<'_>) -> EngineResult<JumpTarget> {
        if let Some(signal) = ControlSignal::from_jump_name(name) {
            if signal.requires_loop() && !scope.in_loop {
                return Err(EngineError::configuration(format!(
                    "step '{step}' in service '{}' jumps to '{name}' outside of a loop",
                    scope.service
                )));
            }
            return Ok(JumpTarget::Signal(signal));
        }
        self.resolve(name).map(JumpTarget::Step).ok_or_else(|| {
            EngineError::configuration(format!(
                "step '{step}' in service '{}' jumps to unknown step '{name}'",
                scope.service
            ))
        })
    }
}

/// Lexical information threaded through step preparation.
pub(crate) struct PrepareScope<'a> {
    pub(crate) registry: &'a ComponentRegistry,
    pub(crate) service: &'a str,
    pub(crate) in_loop: bool,
    pub(crate) loop_sheets: Vec<String>,
    generated_names: &'a Cell<usize>,
}

impl<'a> PrepareScope<'a> {
    pub(crate) fn root(registry: &'a ComponentRegistry, service: &'a str, generated_names: &'a Cell<usize>) -> Self {
        Self {
            registry,
            service,
            in_loop: false,
            loop_sheets: Vec::new(),
            generated_names,
        }
    }

    /// Scope for the body of a loop, optionally iterating `sheet`.
    pub(crate) fn inside_loop(&self, sheet: Option<&str>) -> PrepareScope<'a> {
        let mut loop_sheets = self.loop_sheets.clone();
        loop_sheets.extend(sheet.map(str::to_string));
        PrepareScope {
            registry: self.registry,
            service: self.service,
            in_loop: true,
            loop_sheets,
            generated_names: self.generated_names,
        }
    }

    /// Scope for steps that run detached from the enclosing loop, such as
    /// concurrent branches and batch row steps.
    pub(crate) fn detached(&self) -> PrepareScope<'a> {
        PrepareScope {
            registry: self.registry,
            service: self.service,
            in_loop: false,
            loop_sheets: self.loop_sheets.clone(),
            generated_names: self.generated_names,
        }
    }

    /// Unique name for a step declared without one. Unique per service so
    /// result fields of unnamed steps in different blocks never collide.
    pub(crate) fn generated_name(&self) -> String {
        let index = self.generated_names.get();
        self.generated_names.set(index + 1);
        format!("_a{index}")
    }
}

#[derive(Debug)]
pub struct StepSequence {
    steps: Vec<PreparedStep>,
    jumps: JumpTable,
}

impl StepSequence {
    pub(crate) fn prepare(definitions: &[StepDefinition], scope: &PrepareScope<'_>) -> EngineResult<StepSequence> {
        let mut jumps = JumpTable::default();
        let mut names = Vec::with_capacity(definitions.len());
        for (index, definition) in definitions.iter().enumerate() {
            let name = match definition.header.name.as_deref().map(str::trim) {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => scope.generated_name(),
            };
            if ControlSignal::from_jump_name(&name).is_some() {
                return Err(EngineError::configuration(format!(
                    "step name '{name}' in service '{}' is reserved",
                    scope.service
                )));
            }
            if jumps.positions.insert(name.clone(), index).is_some() {
                return Err(EngineError::configuration(format!(
                    "step name '{name}' appears more than once in a sequence of service '{}'",
                    scope.service
                )));
            }
            names.push(name);
        }

        let steps = definitions
            .iter()
            .zip(names)
            .map(|(definition, name)| PreparedStep::prepare(definition, name, &jumps, scope))
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(StepSequence { steps, jumps })
    }

    pub fn steps(&self) -> &[PreparedStep] {
        &self.steps
    }

    pub fn jumps(&self) -> &JumpTable {
        &self.jumps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Least access level covering every step in the sequence.
    pub fn required_access(&self) -> AccessLevel {
        self.steps
            .iter()
            .fold(AccessLevel::None, |level, step| level.join(step.access()))
    }

    /// Checks that `declared` can host every step. Under a delegated owner,
    /// sub-service steps manage their own transaction and are exempt.
    pub(crate) fn validate_access(&self, declared: AccessLevel, owner: &str) -> EngineResult<()> {
        for step in &self.steps {
            if declared == AccessLevel::Delegated && step.is_sub_service() {
                continue;
            }
            if !declared.admits(step.access()) {
                return Err(EngineError::configuration(format!(
                    "step '{}' requires {} access but {owner} is declared {declared}",
                    step.name(),
                    step.access()
                )));
            }
        }
        Ok(())
    }

    /// Runs the sequence and returns the signal that ended it, if any.
    pub(crate) fn run(
        &self,
        runtime: &Runtime,
        context: &mut ExecutionContext,
        mut db: Option<&mut DbHandle>,
    ) -> EngineResult<Option<ControlSignal>> {
        let mut pointer = 0usize;
        while let Some(step) = self.steps.get(pointer) {
            match step.execute(runtime, context, db.as_deref_mut())? {
                StepOutcome::Skipped => pointer += 1,
                StepOutcome::Completed(result) => {
                    context.set_value(format!("{}{RESULT_SUFFIX}", step.name()), result);
                    pointer += 1;
                }
                StepOutcome::Jump(JumpTarget::Step(target)) => {
                    if target >= self.steps.len() {
                        return Err(EngineError::configuration(format!(
                            "step '{}' jumped to position {target} outside its sequence",
                            step.name()
                        )));
                    }
                    trace!(from = %step.name(), to = %self.steps[target].name(), "jump");
                    pointer = target;
                }
                StepOutcome::Jump(JumpTarget::Signal(signal)) => {
                    trace!(step = %step.name(), signal = %signal, "signal leaves sequence");
                    return Ok(Some(signal));
                }
            }
        }
        Ok(None)
    }
}
