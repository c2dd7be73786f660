//! Fan-out coordinator: runs branch steps concurrently and joins them.
//!
//! Each branch runs on its own scoped thread against a fork of the caller's
//! context and without the caller's database handle; branches needing a
//! connection negotiate their own. After every branch has terminated, the
//! forks are merged back in branch order. Two branches writing the same key
//! fail the merge.

use std::thread;

use anyhow::anyhow;
use batchflow_types::{FanOutDefinition, Value};
use tracing::{debug, error, info};

use crate::context::ExecutionContext;
use crate::db::DbHandle;
use crate::errors::{EngineError, EngineResult};
use crate::runtime::Runtime;
use crate::sequence::PrepareScope;
use crate::step::{PreparedStep, StepOutcome};

#[derive(Debug)]
pub(crate) struct FanOutStep {
    gate: Option<Box<PreparedStep>>,
    branches: Vec<PreparedStep>,
    finally: Option<Box<PreparedStep>>,
}

impl FanOutStep {
    pub(crate) fn prepare(definition: &FanOutDefinition, name: &str, scope: &PrepareScope<'_>) -> EngineResult<FanOutStep> {
        if definition.branches.is_empty() {
            return Err(EngineError::configuration(format!(
                "fan-out '{name}' in service '{}' has no branches",
                scope.service
            )));
        }
        let gate = definition
            .gate
            .as_deref()
            .map(|gate| PreparedStep::prepare_detached(gate, "gate", scope).map(Box::new))
            .transpose()?;
        let branches = definition
            .branches
            .iter()
            .map(|branch| PreparedStep::prepare_detached(branch, "branch", scope))
            .collect::<EngineResult<Vec<_>>>()?;
        let finally = definition
            .finally
            .as_deref()
            .map(|step| PreparedStep::prepare_detached(step, "finally", scope).map(Box::new))
            .transpose()?;
        Ok(FanOutStep { gate, branches, finally })
    }

    pub(crate) fn execute(
        &self,
        runtime: &Runtime,
        step: &str,
        context: &mut ExecutionContext,
        mut db: Option<&mut DbHandle>,
    ) -> EngineResult<StepOutcome> {
        if let Some(gate) = &self.gate {
            match gate.execute(runtime, context, db.as_deref_mut())? {
                StepOutcome::Completed(result) if result.is_truthy() => {}
                outcome if outcome.is_stop() => return Ok(outcome),
                _ => {
                    info!(step = %step, "gate not satisfied; skipping fan-out");
                    return Ok(StepOutcome::Skipped);
                }
            }
        }

        let forks: Vec<ExecutionContext> = self.branches.iter().map(|_| context.fork()).collect();
        debug!(step = %step, branches = forks.len(), "starting fan-out branches");
        let joined = thread::scope(|scope| {
            let workers: Vec<_> = self
                .branches
                .iter()
                .zip(forks)
                .map(|(branch, mut fork)| {
                    scope.spawn(move || {
                        let outcome = branch.execute(runtime, &mut fork, None);
                        (fork, outcome)
                    })
                })
                .collect();
            workers.into_iter().map(|worker| worker.join()).collect::<Vec<_>>()
        });

        let mut merged = Vec::with_capacity(joined.len());
        let mut first_error: Option<EngineError> = None;
        let mut stopped = false;
        for (branch, result) in self.branches.iter().zip(joined) {
            match result {
                Ok((fork, outcome)) => {
                    merged.push(fork);
                    match outcome {
                        Ok(outcome) => stopped |= outcome.is_stop(),
                        Err(branch_error) => {
                            error!(step = %step, branch = %branch.name(), error = %branch_error, "fan-out branch failed");
                            if first_error.is_none() {
                                first_error = Some(branch_error);
                            }
                        }
                    }
                }
                Err(_) => {
                    error!(step = %step, branch = %branch.name(), "fan-out branch panicked");
                    if first_error.is_none() {
                        first_error = Some(EngineError::Execution(anyhow!("fan-out branch '{}' panicked", branch.name())));
                    }
                }
            }
        }

        let merge_result = context.merge(merged);
        if let Some(branch_error) = first_error {
            return Err(branch_error);
        }
        merge_result.map_err(|conflict| EngineError::Execution(anyhow!(conflict)))?;
        if stopped {
            info!(step = %step, "fan-out branch raised stop");
            return Ok(StepOutcome::stop());
        }

        if let Some(finally) = &self.finally {
            let outcome = finally.execute(runtime, context, db)?;
            if outcome.is_stop() {
                return Ok(outcome);
            }
        }
        Ok(StepOutcome::Completed(Value::Boolean(!context.in_error())))
    }
}
