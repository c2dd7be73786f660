//! Transaction negotiation between nested components.
//!
//! A component needing database access either reuses the handle inherited
//! from its caller or opens a handle scoped to its own execution. A scoped
//! handle is committed when the work succeeded and left the context free of
//! errors, and rolled back otherwise.

use batchflow_types::AccessLevel;
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::db::DbHandle;
use crate::errors::EngineResult;
use crate::runtime::Runtime;

/// Runs `work` with a handle adequate for `required`.
///
/// Components that need no connection receive the inherited handle
/// unchanged so their own children can still reuse it.
pub(crate) fn negotiate<T>(
    runtime: &Runtime,
    required: AccessLevel,
    schema: Option<&str>,
    context: &mut ExecutionContext,
    inherited: Option<&mut DbHandle>,
    work: impl FnOnce(&mut ExecutionContext, Option<&mut DbHandle>) -> EngineResult<T>,
) -> EngineResult<T> {
    let Some(level) = required.connection_level() else {
        return work(context, inherited);
    };
    if let Some(handle) = inherited {
        if handle.satisfies(level, schema) {
            return work(context, Some(handle));
        }
        debug!(
            inherited = %handle.access(),
            required = %level,
            schema = schema.unwrap_or("<default>"),
            "inherited connection cannot be reused"
        );
    }
    run_scoped(runtime, level, schema, context, work)
}

/// Opens a handle at `level`, runs `work` on it, then commits or rolls back.
pub(crate) fn run_scoped<T>(
    runtime: &Runtime,
    level: AccessLevel,
    schema: Option<&str>,
    context: &mut ExecutionContext,
    work: impl FnOnce(&mut ExecutionContext, Option<&mut DbHandle>) -> EngineResult<T>,
) -> EngineResult<T> {
    let schema = schema.or(runtime.default_schema());
    let mut handle = DbHandle::open(runtime.driver(), level, schema)?;
    let outcome = work(context, Some(&mut handle));
    let commit = outcome.is_ok() && !context.in_error();
    debug!(access = %level, commit, "closing scoped connection");
    match (handle.finish(commit), outcome) {
        (Ok(()), outcome) => outcome,
        (Err(error), Ok(_)) => Err(error.into()),
        (Err(error), Err(original)) => {
            warn!(error = %error, "rollback failed after step error");
            Err(original)
        }
    }
}
