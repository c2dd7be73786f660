//! Batch processing: a driver row processor fed by files, queries, sheets or
//! queues, with child processors matched to each driver row.
//!
//! Every driver row runs inside its own transaction boundary and ends with
//! exactly one commit or one rollback. Child rows never commit on their own.
//! Invalid rows are handed to the invalid-row handler and do not count as
//! transactional failures. Any other row failure, a failed commit included,
//! rolls the row back and the run continues with the next row.

use std::path::{Path, PathBuf};

use anyhow::Context;
use batchflow_types::{AccessLevel, BatchDefinition, Message, QueueUsage, Value};
use batchflow_util::{expand_tilde, is_wildcard, matching_files, resolve_reference};
use tracing::{debug, info, warn};

use crate::context::ExecutionContext;
use crate::errors::{EngineError, EngineResult};
use crate::runtime::Runtime;
use crate::sequence::PrepareScope;
use crate::step::{PreparedStep, StepOutcome};

mod aggregate;
mod boundary;
mod file;
mod processor;
mod sink;
mod source;

use boundary::RowBoundary;
use processor::{ProcessorRules, ProcessorState, RowFlow, RowProcessor, RunEnv, apply_row};

pub use file::{DelimitedFileSink, DelimitedFileSource};
pub use sink::{RowSink, RowSinkFactory, SheetSink};
pub use source::{RowError, RowSource, RowSourceFactory, SheetSource, SqlSource, validate_row};

/// How one run over a file or query ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Exhausted,
    Stopped,
    Interrupted,
}

#[derive(Debug, Default, Clone, Copy)]
struct BatchStats {
    runs: usize,
    rows: usize,
    committed: i64,
    rolled_back: usize,
    invalid: usize,
}

#[derive(Debug)]
pub(crate) struct BatchStep {
    origin: String,
    input_folder: Option<String>,
    output_folder: Option<String>,
    file_name_field: Option<String>,
    processor: RowProcessor,
    on_invalid_row: Option<PreparedStep>,
    on_error: Option<PreparedStep>,
    interruptible: Option<bool>,
    access: AccessLevel,
    schema: Option<String>,
    queue: Option<QueueUsage>,
    user_transaction: bool,
}

impl BatchStep {
    pub(crate) fn prepare(definition: &BatchDefinition, name: &str, scope: &PrepareScope<'_>) -> EngineResult<BatchStep> {
        let rules = ProcessorRules {
            step: name,
            access: definition.access,
            has_queue: definition.queue.is_some(),
        };
        let processor = RowProcessor::prepare(&definition.processor, &rules, scope, None, 0)?;
        let on_invalid_row = definition
            .on_invalid_row
            .as_deref()
            .map(|step| PreparedStep::prepare_detached(step, "onInvalidRow", scope))
            .transpose()?;
        let on_error = definition
            .on_error
            .as_deref()
            .map(|step| PreparedStep::prepare_detached(step, "onError", scope))
            .transpose()?;
        Ok(BatchStep {
            origin: format!("{}.{name}", scope.service),
            input_folder: definition.input_folder.clone(),
            output_folder: definition.output_folder.clone(),
            file_name_field: definition.file_name_field.clone(),
            processor,
            on_invalid_row,
            on_error,
            interruptible: definition.interruptible,
            access: definition.access,
            schema: definition.schema.clone(),
            queue: definition.queue,
            user_transaction: definition.user_transaction,
        })
    }

    /// Runs the batch over every planned input. The result is the number of
    /// committed driver rows; a STOP raised by a row ends the batch and
    /// propagates.
    pub(crate) fn execute(&self, runtime: &Runtime, context: &mut ExecutionContext) -> EngineResult<StepOutcome> {
        let input_folder = resolve_folder(self.input_folder.as_deref(), context)?;
        let output_folder = match self.output_folder.as_deref() {
            Some(raw) => resolve_folder(Some(raw), context)?,
            None => input_folder.clone(),
        };
        let runs = self.plan_runs(&input_folder, context)?;
        let interruptible = self.interruptible.unwrap_or_else(|| runtime.interruptible_by_default());
        info!(batch = %self.origin, runs = runs.len(), interruptible, "starting batch");

        let mut stats = BatchStats::default();
        let mut end = RunEnd::Exhausted;
        for file in runs {
            if let (Some(field), Some(file)) = (&self.file_name_field, &file) {
                let name = file
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                context.set_value(field.clone(), name);
            }
            let env = RunEnv {
                runtime,
                origin: &self.origin,
                interruptible,
                input_folder: input_folder.clone(),
                output_folder: output_folder.clone(),
                driver_file: file,
                queue: None,
            };
            match self.run(env, context, &mut stats) {
                Ok(RunEnd::Exhausted) => {}
                Ok(other) => {
                    end = other;
                    break;
                }
                Err(error) if error.is_configuration() => return Err(error),
                Err(error) => {
                    warn!(batch = %self.origin, error = %error, "batch run failed");
                    runtime.reporter().report(&self.origin, &error, context);
                }
            }
        }

        info!(
            batch = %self.origin,
            runs = stats.runs,
            rows = stats.rows,
            committed = stats.committed,
            rolled_back = stats.rolled_back,
            invalid = stats.invalid,
            end = ?end,
            "batch finished"
        );
        if end == RunEnd::Stopped {
            return Ok(StepOutcome::stop());
        }
        Ok(StepOutcome::Completed(Value::Integer(stats.committed)))
    }

    /// One run per matching file for file-fed drivers, a single run otherwise.
    fn plan_runs(&self, folder: &Path, context: &ExecutionContext) -> EngineResult<Vec<Option<PathBuf>>> {
        let Some(format) = self.processor.input_file() else {
            return Ok(vec![None]);
        };
        let pattern = resolve_reference(&format.file_name, |field| field_text(context, field)).ok_or_else(|| {
            anyhow::anyhow!(
                "field '{}' naming the batch input is not set",
                format.file_name.trim_start_matches('$')
            )
        })?;
        let files = matching_files(folder, &pattern)
            .with_context(|| format!("failed to list '{pattern}' in {}", folder.display()))?;
        if files.is_empty() && is_wildcard(&pattern) {
            info!(batch = %self.origin, pattern = %pattern, folder = %folder.display(), "no input files match");
        }
        Ok(files.into_iter().map(Some).collect())
    }

    fn run(&self, mut env: RunEnv<'_>, context: &mut ExecutionContext, stats: &mut BatchStats) -> EngineResult<RunEnd> {
        let runtime = env.runtime;
        let mut boundary = RowBoundary::open(
            runtime,
            self.access,
            self.schema.as_deref(),
            self.queue,
            self.user_transaction,
        )?;
        env.queue = boundary.queue_session();
        stats.runs += 1;
        if let Some(file) = &env.driver_file {
            info!(batch = %self.origin, file = %file.display(), "processing input file");
        }

        let mut state = ProcessorState::new(&self.processor);
        let outcome = match state.open(&env, context, boundary.db_mut(), true) {
            Ok(()) => self.drive(&env, &mut state, &mut boundary, context, stats),
            Err(error) => Err(error),
        };
        if outcome.is_ok() {
            state.write_aggregates(context);
        }
        let closed = state.close(context);
        drop(state);
        drop(env);
        let finished = boundary.finish(runtime);

        let end = outcome?;
        closed?;
        finished?;
        Ok(end)
    }

    fn drive(
        &self,
        env: &RunEnv<'_>,
        state: &mut ProcessorState<'_>,
        boundary: &mut RowBoundary,
        context: &mut ExecutionContext,
        stats: &mut BatchStats,
    ) -> EngineResult<RunEnd> {
        loop {
            if env.interruptible && env.runtime.interrupt().is_raised() {
                info!(batch = %self.origin, "interrupt raised; ending batch run between rows");
                return Ok(RunEnd::Interrupted);
            }
            context.reset_messages();
            let row = match state.read_row(context) {
                Ok(Some(row)) => row,
                Ok(None) => return Ok(RunEnd::Exhausted),
                Err(RowError::Invalid { row, messages }) => {
                    apply_row(context, row);
                    stats.invalid += 1;
                    if self.handle_invalid(env, context, messages) == RowFlow::Stop {
                        return Ok(RunEnd::Stopped);
                    }
                    continue;
                }
                Err(RowError::Failed(error)) => return Err(error.into()),
            };
            stats.rows += 1;
            apply_row(context, row);

            if let Err(error) = boundary.begin() {
                stats.rolled_back += 1;
                if self.handle_error(env, context, EngineError::Execution(error)) == RowFlow::Stop {
                    return Ok(RunEnd::Stopped);
                }
                continue;
            }
            let flow = match state.process_row(env, context, boundary.db_mut()) {
                Ok(flow) if !context.in_error() => match boundary.commit() {
                    Ok(()) => {
                        stats.committed += 1;
                        flow
                    }
                    Err(error) => {
                        warn!(batch = %self.origin, error = %error, "row commit failed");
                        self.roll_back(boundary);
                        stats.rolled_back += 1;
                        match self.handle_error(env, context, EngineError::Execution(error)) {
                            RowFlow::Stop => RowFlow::Stop,
                            RowFlow::Continue => flow,
                        }
                    }
                },
                Ok(flow) => {
                    debug!(batch = %self.origin, messages = context.messages().len(), "row left the context in error");
                    self.roll_back(boundary);
                    stats.rolled_back += 1;
                    flow
                }
                Err(EngineError::InvalidRow(messages)) => {
                    self.roll_back(boundary);
                    stats.invalid += 1;
                    self.handle_invalid(env, context, messages)
                }
                Err(error) if error.is_configuration() => {
                    self.roll_back(boundary);
                    return Err(error);
                }
                Err(error) => {
                    self.roll_back(boundary);
                    stats.rolled_back += 1;
                    self.handle_error(env, context, error)
                }
            };
            if flow == RowFlow::Stop {
                info!(batch = %self.origin, "row raised stop; ending batch");
                return Ok(RunEnd::Stopped);
            }
        }
    }

    /// A failed rollback only costs the current row; the run moves on.
    fn roll_back(&self, boundary: &mut RowBoundary) {
        if let Err(error) = boundary.rollback() {
            warn!(batch = %self.origin, error = %error, "row rollback failed");
        }
    }

    fn handle_invalid(&self, env: &RunEnv<'_>, context: &mut ExecutionContext, messages: Vec<Message>) -> RowFlow {
        warn!(batch = %self.origin, messages = messages.len(), "invalid input row");
        for message in &messages {
            context.add_message(message.clone());
        }
        match &self.on_invalid_row {
            Some(handler) => run_handler(handler, env, context),
            None => {
                env.runtime
                    .reporter()
                    .report(&self.origin, &EngineError::InvalidRow(messages), context);
                RowFlow::Continue
            }
        }
    }

    fn handle_error(&self, env: &RunEnv<'_>, context: &mut ExecutionContext, error: EngineError) -> RowFlow {
        warn!(batch = %self.origin, error = %error, "row failed and was rolled back");
        match &self.on_error {
            Some(handler) => run_handler(handler, env, context),
            None => {
                env.runtime.reporter().report(&self.origin, &error, context);
                RowFlow::Continue
            }
        }
    }
}

/// Handlers run outside the row boundary. Their own failures go to the
/// error reporter.
fn run_handler(handler: &PreparedStep, env: &RunEnv<'_>, context: &mut ExecutionContext) -> RowFlow {
    match handler.execute(env.runtime, context, None) {
        Ok(outcome) if outcome.is_stop() => RowFlow::Stop,
        Ok(_) => RowFlow::Continue,
        Err(error) => {
            env.runtime.reporter().report(env.origin, &error, context);
            RowFlow::Continue
        }
    }
}

fn field_text(context: &ExecutionContext, field: &str) -> Option<String> {
    context
        .value(field)
        .filter(|value| !value.is_null())
        .map(Value::to_string)
}

fn resolve_folder(raw: Option<&str>, context: &ExecutionContext) -> EngineResult<PathBuf> {
    let Some(raw) = raw else {
        return Ok(PathBuf::from("."));
    };
    let folder = resolve_reference(raw, |field| field_text(context, field))
        .ok_or_else(|| anyhow::anyhow!("field '{}' naming a batch folder is not set", raw.trim_start_matches('$')))?;
    Ok(expand_tilde(&folder))
}
