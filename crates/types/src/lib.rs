//! Shared types for batchflow: typed values, sheets, messages, access levels,
//! control signals and the declarative service definitions the engine prepares.

use indexmap::IndexMap;

pub mod access;
pub mod message;
pub mod service;
pub mod sheet;
pub mod signal;
pub mod value;

pub use access::AccessLevel;
pub use message::{Message, MessageDefinition, MessageSeverity};
pub use service::{
    AggregationFunction, AggregatorDefinition, BatchDefinition, BlockDefinition, ColumnDefinition, FanOutDefinition,
    FileFormatDefinition, LinkDefinition, LoopDefinition, MessageBinding, MessageCatalogDefinition, QueueUsage,
    RowInputDefinition, RowOutputDefinition, RowProcessorDefinition, ServiceDefinition, SqlOperation,
    SqlStepDefinition, StepBodyDefinition, StepDefinition, StepHeaderDefinition,
};
pub use sheet::{DataSheet, SheetError};
pub use signal::{BREAK_JUMP, CONTINUE_JUMP, ControlSignal, STOP_JUMP};
pub use value::{Value, ValueParseError, ValueType};

/// One input or output row: column name to typed value, in column order.
pub type Row = IndexMap<String, Value>;
