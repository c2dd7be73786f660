//! Error taxonomy of the engine.

use batchflow_types::Message;
use thiserror::Error;

use crate::expression::ExpressionError;

/// Failure raised while preparing or executing steps.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Definition fault: unresolved jump, lattice violation, bad expression.
    /// Raised at prepare time, or at run time for expression type errors.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Input row failed validation. Batch runs continue with the next row.
    #[error("invalid row: {}", render_messages(.0))]
    InvalidRow(Vec<Message>),
    /// Database, IO or adapter fault.
    #[error(transparent)]
    Execution(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        EngineError::Configuration(message.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, EngineError::Configuration(_))
    }
}

impl From<ExpressionError> for EngineError {
    fn from(error: ExpressionError) -> Self {
        EngineError::Configuration(error.to_string())
    }
}

fn render_messages(messages: &[Message]) -> String {
    messages.iter().map(|message| message.text.as_str()).collect::<Vec<_>>().join("; ")
}
