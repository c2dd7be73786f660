//! The driver/child processor tree and its per-run state.
//!
//! A [`RowProcessor`] is the prepared, immutable description of one level.
//! A [`ProcessorState`] mirrors the tree for one batch run and owns the open
//! sources, sinks, accumulators and merge lookahead.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use batchflow_types::{
    AccessLevel, ColumnDefinition, FileFormatDefinition, LinkDefinition, Message, Row, RowInputDefinition,
    RowOutputDefinition, RowProcessorDefinition, Value,
};
use batchflow_util::{expand_tilde, resolve_reference, substitute_parent};
use tracing::{debug, warn};

use super::aggregate::{Accumulator, Aggregator};
use super::file::{DelimitedFileSink, DelimitedFileSource};
use super::sink::{RowSink, RowSinkFactory, SheetSink};
use super::source::{QueueSource, RowError, RowSource, RowSourceFactory, SheetSource, SqlSource};
use crate::context::ExecutionContext;
use crate::db::DbHandle;
use crate::errors::{EngineError, EngineResult};
use crate::messaging::SharedSession;
use crate::runtime::Runtime;
use crate::sequence::PrepareScope;
use crate::step::PreparedStep;

/// Whether a processed row lets the run continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RowFlow {
    Continue,
    Stop,
}

/// How a child processor finds the rows belonging to its parent row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildMode {
    /// Sorted merge over a source opened once per run.
    Merge,
    /// Exactly one row read per parent row from a source opened once per run.
    SingleRow,
    /// Source reopened for each parent row, filtered by the link when present.
    PerParent,
}

/// Everything one batch run resolves before its rows are processed.
pub(crate) struct RunEnv<'r> {
    pub(crate) runtime: &'r Runtime,
    pub(crate) origin: &'r str,
    pub(crate) interruptible: bool,
    pub(crate) input_folder: PathBuf,
    pub(crate) output_folder: PathBuf,
    pub(crate) driver_file: Option<PathBuf>,
    pub(crate) queue: Option<SharedSession>,
}

impl RunEnv<'_> {
    /// Resolves a configured file name against `folder`, reading `$field`
    /// names from the context and substituting the driver file stem.
    fn resolve_file(&self, folder: &Path, raw: &str, context: &ExecutionContext) -> EngineResult<PathBuf> {
        let name = resolve_reference(raw, |field| context.value(field).filter(|value| !value.is_null()).map(Value::to_string))
            .ok_or_else(|| anyhow!("field '{}' naming a batch file is not set", raw.trim_start_matches('$')))?;
        let path = expand_tilde(&substitute_parent(&name, self.driver_file.as_deref()));
        Ok(if path.is_absolute() { path } else { folder.join(path) })
    }
}

/// Prepare-time facts about the enclosing batch that constrain its processors.
pub(crate) struct ProcessorRules<'a> {
    pub(crate) step: &'a str,
    pub(crate) access: AccessLevel,
    pub(crate) has_queue: bool,
}

pub(crate) enum InputPlan {
    File(FileFormatDefinition),
    Sql { statement: String, columns: Vec<ColumnDefinition> },
    Sheet { sheet: String, columns: Vec<ColumnDefinition> },
    Queue { queue: String, columns: Vec<ColumnDefinition> },
    Custom { name: String, factory: Arc<dyn RowSourceFactory> },
}

impl fmt::Debug for InputPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputPlan::File(format) => f.debug_tuple("File").field(&format.file_name).finish(),
            InputPlan::Sql { statement, .. } => f.debug_struct("Sql").field("statement", statement).finish(),
            InputPlan::Sheet { sheet, .. } => f.debug_struct("Sheet").field("sheet", sheet).finish(),
            InputPlan::Queue { queue, .. } => f.debug_struct("Queue").field("queue", queue).finish(),
            InputPlan::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
        }
    }
}

impl InputPlan {
    fn create(&self, env: &RunEnv<'_>, context: &ExecutionContext, is_driver: bool) -> EngineResult<Box<dyn RowSource>> {
        let source: Box<dyn RowSource> = match self {
            InputPlan::File(format) => {
                let path = if is_driver {
                    env.driver_file
                        .clone()
                        .ok_or_else(|| anyhow!("no input file was planned for the batch run"))?
                } else {
                    env.resolve_file(&env.input_folder, &format.file_name, context)?
                };
                Box::new(DelimitedFileSource::new(path, format.clone()))
            }
            InputPlan::Sql { statement, columns } => Box::new(SqlSource::new(statement.clone(), columns.clone())),
            InputPlan::Sheet { sheet, columns } => Box::new(SheetSource::new(sheet.clone(), columns.clone())),
            InputPlan::Queue { queue, columns } => {
                let session = env
                    .queue
                    .clone()
                    .ok_or_else(|| EngineError::configuration(format!("queue '{queue}' has no session for this run")))?;
                Box::new(QueueSource::new(queue.clone(), columns.clone(), session))
            }
            InputPlan::Custom { factory, .. } => factory.create(context)?,
        };
        Ok(source)
    }
}

pub(crate) enum OutputPlan {
    File(FileFormatDefinition),
    Sheet { sheet: String, columns: Vec<String> },
    Custom { name: String, factory: Arc<dyn RowSinkFactory> },
}

impl fmt::Debug for OutputPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputPlan::File(format) => f.debug_tuple("File").field(&format.file_name).finish(),
            OutputPlan::Sheet { sheet, .. } => f.debug_struct("Sheet").field("sheet", sheet).finish(),
            OutputPlan::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
        }
    }
}

impl OutputPlan {
    fn create(&self, env: &RunEnv<'_>, context: &ExecutionContext) -> EngineResult<Box<dyn RowSink>> {
        let sink: Box<dyn RowSink> = match self {
            OutputPlan::File(format) => {
                let path = env.resolve_file(&env.output_folder, &format.file_name, context)?;
                Box::new(DelimitedFileSink::new(path, format.clone()))
            }
            OutputPlan::Sheet { sheet, columns } => Box::new(SheetSink::new(sheet.clone(), columns.clone())),
            OutputPlan::Custom { factory, .. } => factory.create(context)?,
        };
        Ok(sink)
    }
}

#[derive(Debug)]
pub(crate) struct RowProcessor {
    label: String,
    input: InputPlan,
    output: Option<OutputPlan>,
    link: Option<LinkDefinition>,
    mode: ChildMode,
    before_children: Option<PreparedStep>,
    aggregators: Vec<Aggregator>,
    children: Vec<RowProcessor>,
    after_children: Option<PreparedStep>,
}

impl RowProcessor {
    /// Prepares the processor tree. `parent` is the label of the parent
    /// processor, `None` for the driver.
    pub(crate) fn prepare(
        definition: &RowProcessorDefinition,
        rules: &ProcessorRules<'_>,
        scope: &PrepareScope<'_>,
        parent: Option<&str>,
        index: usize,
    ) -> EngineResult<RowProcessor> {
        let label = match parent {
            None => format!("{}.driver", rules.step),
            Some(parent) => format!("{parent}.child{index}"),
        };
        let fail = |reason: String| {
            EngineError::configuration(format!("batch processor '{label}' in service '{}': {reason}", scope.service))
        };

        match (&definition.link, parent) {
            (Some(_), None) => return Err(fail("the driver processor cannot declare a link".to_string())),
            (Some(link), Some(_)) if link.child_fields.is_empty() || link.child_fields.len() != link.parent_fields.len() => {
                return Err(fail("link needs the same non-zero number of child and parent fields".to_string()));
            }
            _ => {}
        }

        let input = match &definition.input {
            RowInputDefinition::File(format) => InputPlan::File(format.clone()),
            RowInputDefinition::Sql { statement, columns } => {
                if rules.access.connection_level().is_none() {
                    return Err(fail("sql input needs a batch access level with a connection".to_string()));
                }
                InputPlan::Sql {
                    statement: statement.clone(),
                    columns: columns.clone(),
                }
            }
            RowInputDefinition::Sheet { sheet, columns } => InputPlan::Sheet {
                sheet: sheet.clone(),
                columns: columns.clone(),
            },
            RowInputDefinition::Queue { queue, columns } => {
                if !rules.has_queue {
                    return Err(fail(format!("queue input '{queue}' needs the batch 'queue' setting")));
                }
                InputPlan::Queue {
                    queue: queue.clone(),
                    columns: columns.clone(),
                }
            }
            RowInputDefinition::Custom { source } => InputPlan::Custom {
                name: source.clone(),
                factory: scope
                    .registry
                    .source(source)
                    .ok_or_else(|| fail(format!("unknown row source '{source}'")))?,
            },
        };
        let output = match &definition.output {
            None => None,
            Some(RowOutputDefinition::File(format)) => Some(OutputPlan::File(format.clone())),
            Some(RowOutputDefinition::Sheet { sheet, columns }) => Some(OutputPlan::Sheet {
                sheet: sheet.clone(),
                columns: columns.clone(),
            }),
            Some(RowOutputDefinition::Custom { sink }) => Some(OutputPlan::Custom {
                name: sink.clone(),
                factory: scope
                    .registry
                    .sink(sink)
                    .ok_or_else(|| fail(format!("unknown row sink '{sink}'")))?,
            }),
        };
        let mode = match (&input, &definition.link) {
            (InputPlan::File(_) | InputPlan::Queue { .. }, Some(_)) => ChildMode::Merge,
            (InputPlan::File(_) | InputPlan::Queue { .. }, None) => ChildMode::SingleRow,
            _ => ChildMode::PerParent,
        };

        let before_children = definition
            .before_children
            .as_deref()
            .map(|step| PreparedStep::prepare_detached(step, "beforeChildren", scope))
            .transpose()?;
        let after_children = definition
            .after_children
            .as_deref()
            .map(|step| PreparedStep::prepare_detached(step, "afterChildren", scope))
            .transpose()?;
        let owner = format!("batch processor '{label}'");
        let aggregators = definition
            .aggregators
            .iter()
            .map(|aggregator| Aggregator::prepare(aggregator, &owner))
            .collect::<EngineResult<Vec<_>>>()?;
        let children = definition
            .children
            .iter()
            .enumerate()
            .map(|(index, child)| RowProcessor::prepare(child, rules, scope, Some(&label), index + 1))
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(RowProcessor {
            label,
            input,
            output,
            link: definition.link.clone(),
            mode,
            before_children,
            aggregators,
            children,
            after_children,
        })
    }

    /// Wildcard pattern of a file-fed driver.
    pub(crate) fn input_file(&self) -> Option<&FileFormatDefinition> {
        match &self.input {
            InputPlan::File(format) => Some(format),
            _ => None,
        }
    }
}

pub(crate) fn apply_row(context: &mut ExecutionContext, row: Row) {
    for (field, value) in row {
        context.set_value(field, value);
    }
}

/// Copies an invalid row into the context and converts the failure.
fn row_failure(context: &mut ExecutionContext, error: RowError) -> EngineError {
    match error {
        RowError::Invalid { row, messages } => {
            apply_row(context, row);
            EngineError::InvalidRow(messages)
        }
        RowError::Failed(error) => EngineError::Execution(error),
    }
}

fn child_key(link: &LinkDefinition, row: &Row) -> String {
    link.child_fields
        .iter()
        .map(|field| row.get(field).map(Value::to_string).unwrap_or_default())
        .collect::<String>()
        .to_lowercase()
}

pub(crate) struct ProcessorState<'p> {
    processor: &'p RowProcessor,
    source: Option<Box<dyn RowSource>>,
    sink: Option<Box<dyn RowSink>>,
    accumulators: Vec<Accumulator>,
    children: Vec<ProcessorState<'p>>,
    lookahead: Option<Row>,
}

impl<'p> ProcessorState<'p> {
    pub(crate) fn new(processor: &'p RowProcessor) -> Self {
        Self {
            processor,
            source: None,
            sink: None,
            accumulators: vec![Accumulator::default(); processor.aggregators.len()],
            children: processor.children.iter().map(ProcessorState::new).collect(),
            lookahead: None,
        }
    }

    /// Opens sources and sinks for the whole tree. Children reading their
    /// source once per parent row open it later.
    pub(crate) fn open(
        &mut self,
        env: &RunEnv<'_>,
        context: &mut ExecutionContext,
        mut db: Option<&mut DbHandle>,
        is_driver: bool,
    ) -> EngineResult<()> {
        let processor = self.processor;
        if is_driver || processor.mode != ChildMode::PerParent {
            let mut source = processor.input.create(env, context, is_driver)?;
            source.open_shop(context, db.as_deref_mut())?;
            self.source = Some(source);
        }
        if let Some(output) = &processor.output {
            let mut sink = output.create(env, context)?;
            sink.open_shop(context)?;
            self.sink = Some(sink);
        }
        for child in &mut self.children {
            child.open(env, context, db.as_deref_mut(), false)?;
        }
        Ok(())
    }

    pub(crate) fn read_row(&mut self, context: &ExecutionContext) -> Result<Option<Row>, RowError> {
        match self.source.as_mut() {
            Some(source) => source.input_row(context),
            None => Ok(None),
        }
    }

    fn next_child_row(&mut self, context: &mut ExecutionContext) -> EngineResult<Option<Row>> {
        if let Some(row) = self.lookahead.take() {
            return Ok(Some(row));
        }
        self.read_row(context).map_err(|error| row_failure(context, error))
    }

    /// Runs one row through this level: before step, aggregation, child
    /// scans, after step and output.
    pub(crate) fn process_row(
        &mut self,
        env: &RunEnv<'_>,
        context: &mut ExecutionContext,
        mut db: Option<&mut DbHandle>,
    ) -> EngineResult<RowFlow> {
        let processor = self.processor;
        if let Some(step) = &processor.before_children
            && step.execute(env.runtime, context, db.as_deref_mut())?.is_stop()
        {
            return Ok(RowFlow::Stop);
        }
        // Aggregate before the children load their rows over this row's fields.
        for (aggregator, accumulator) in processor.aggregators.iter().zip(self.accumulators.iter_mut()) {
            aggregator.accumulate(accumulator, context)?;
        }
        for child in &mut self.children {
            if child.scan(env, context, db.as_deref_mut())? == RowFlow::Stop {
                return Ok(RowFlow::Stop);
            }
        }
        if let Some(step) = &processor.after_children
            && step.execute(env.runtime, context, db.as_deref_mut())?.is_stop()
        {
            return Ok(RowFlow::Stop);
        }
        if let Some(sink) = self.sink.as_mut()
            && !sink.output_row(context)?
        {
            debug!(processor = %processor.label, "sink declined the row");
        }
        Ok(RowFlow::Continue)
    }

    /// Processes the child rows belonging to the current parent row.
    /// Aggregators restart with every parent row and publish at its end.
    fn scan(
        &mut self,
        env: &RunEnv<'_>,
        context: &mut ExecutionContext,
        db: Option<&mut DbHandle>,
    ) -> EngineResult<RowFlow> {
        self.accumulators.fill(Accumulator::default());
        let parent_key = self.parent_key(context)?;
        let mut matched = 0usize;
        let flow = match self.processor.mode {
            ChildMode::SingleRow => match self.next_child_row(context)? {
                Some(row) => {
                    matched = 1;
                    apply_row(context, row);
                    self.process_row(env, context, db)?
                }
                None => RowFlow::Continue,
            },
            ChildMode::Merge => self.merge_scan(env, context, db, parent_key.as_deref().unwrap_or_default(), &mut matched)?,
            ChildMode::PerParent => self.reopen_scan(env, context, db, parent_key.as_deref(), &mut matched)?,
        };
        self.write_aggregates(context);
        debug!(processor = %self.processor.label, rows = matched, "child scan finished");
        Ok(flow)
    }

    /// Lower-cased concatenation of the parent's link fields.
    fn parent_key(&self, context: &ExecutionContext) -> EngineResult<Option<String>> {
        let Some(link) = &self.processor.link else {
            return Ok(None);
        };
        let mut key = String::new();
        for field in &link.parent_fields {
            match context.value(field) {
                Some(value) if !value.is_null() => key.push_str(&value.to_string()),
                _ => {
                    let text = format!("{field} has no value to match child rows of {}", self.processor.label);
                    return Err(EngineError::InvalidRow(vec![
                        Message::error("missing_link_value", text).for_field(field),
                    ]));
                }
            }
        }
        Ok(Some(key.to_lowercase()))
    }

    fn merge_scan(
        &mut self,
        env: &RunEnv<'_>,
        context: &mut ExecutionContext,
        mut db: Option<&mut DbHandle>,
        parent: &str,
        matched: &mut usize,
    ) -> EngineResult<RowFlow> {
        let processor = self.processor;
        let Some(link) = &processor.link else {
            return Ok(RowFlow::Continue);
        };
        while let Some(row) = self.next_child_row(context)? {
            let key = child_key(link, &row);
            match key.as_str().cmp(parent) {
                Ordering::Less => {
                    warn!(processor = %processor.label, key = %key, parent = %parent, "child row sorts before its parent; skipping");
                }
                Ordering::Greater => {
                    self.lookahead = Some(row);
                    break;
                }
                Ordering::Equal => {
                    *matched += 1;
                    apply_row(context, row);
                    if self.process_row(env, context, db.as_deref_mut())? == RowFlow::Stop {
                        return Ok(RowFlow::Stop);
                    }
                }
            }
        }
        Ok(RowFlow::Continue)
    }

    fn reopen_scan(
        &mut self,
        env: &RunEnv<'_>,
        context: &mut ExecutionContext,
        mut db: Option<&mut DbHandle>,
        parent: Option<&str>,
        matched: &mut usize,
    ) -> EngineResult<RowFlow> {
        let processor = self.processor;
        let mut source = processor.input.create(env, context, false)?;
        source.open_shop(context, db.as_deref_mut())?;
        let outcome = loop {
            let row = match source.input_row(context) {
                Ok(Some(row)) => row,
                Ok(None) => break Ok(RowFlow::Continue),
                Err(error) => break Err(row_failure(context, error)),
            };
            if let (Some(link), Some(parent)) = (&processor.link, parent)
                && child_key(link, &row) != parent
            {
                continue;
            }
            *matched += 1;
            apply_row(context, row);
            match self.process_row(env, context, db.as_deref_mut()) {
                Ok(RowFlow::Continue) => {}
                other => break other,
            }
        };
        let closed = source.close_shop(context);
        let flow = outcome?;
        closed?;
        Ok(flow)
    }

    pub(crate) fn write_aggregates(&self, context: &mut ExecutionContext) {
        for (aggregator, accumulator) in self.processor.aggregators.iter().zip(&self.accumulators) {
            aggregator.write(accumulator, context);
        }
    }

    /// Closes every open source and sink, reporting the first failure.
    pub(crate) fn close(&mut self, context: &mut ExecutionContext) -> EngineResult<()> {
        let mut result = Ok(());
        for child in &mut self.children {
            let closed = child.close(context);
            if result.is_ok() {
                result = closed;
            }
        }
        if let Some(mut source) = self.source.take()
            && let Err(error) = source.close_shop(context)
            && result.is_ok()
        {
            result = Err(error.into());
        }
        if let Some(mut sink) = self.sink.take()
            && let Err(error) = sink.close_shop(context)
            && result.is_ok()
        {
            result = Err(error.into());
        }
        self.lookahead = None;
        result
    }
}
