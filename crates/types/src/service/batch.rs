//! Batch step definitions: driver/child row processors, their row sources,
//! outputs and aggregators.

use serde::{Deserialize, Serialize};

use super::StepDefinition;
use crate::{AccessLevel, ValueType};

/// Processes rows from files, queries, sheets or queues with one transaction
/// per driver row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchDefinition {
    /// Folder scanned for input files; `$field` reads it from the context.
    #[serde(default)]
    pub input_folder: Option<String>,
    /// Folder receiving output files; `$field` reads it from the context.
    #[serde(default)]
    pub output_folder: Option<String>,
    /// Field that receives the name of the file being processed.
    #[serde(default)]
    pub file_name_field: Option<String>,
    pub processor: RowProcessorDefinition,
    #[serde(default)]
    pub on_invalid_row: Option<Box<StepDefinition>>,
    #[serde(default)]
    pub on_error: Option<Box<StepDefinition>>,
    /// Stop cleanly between rows when the runtime interrupt flag is raised.
    /// Falls back to the runtime default when absent.
    #[serde(default)]
    pub interruptible: Option<bool>,
    /// Connection policy for the run. `read_write` commits once per driver row.
    #[serde(default)]
    pub access: AccessLevel,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub queue: Option<QueueUsage>,
    /// Drive each row boundary through the runtime's user transaction manager.
    #[serde(default)]
    pub user_transaction: bool,
}

/// How a batch run uses the message broker session it borrows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueUsage {
    /// The session commits and rolls back with every driver row.
    ServiceManaged,
    /// The session is borrowed for the run; its boundary is owned elsewhere.
    ExternallyManaged,
}

/// One level of the driver/child processor tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RowProcessorDefinition {
    pub input: RowInputDefinition,
    #[serde(default)]
    pub output: Option<RowOutputDefinition>,
    /// Key link to the parent row; only meaningful for child processors.
    #[serde(default)]
    pub link: Option<LinkDefinition>,
    #[serde(default)]
    pub before_children: Option<Box<StepDefinition>>,
    #[serde(default)]
    pub aggregators: Vec<AggregatorDefinition>,
    #[serde(default)]
    pub children: Vec<RowProcessorDefinition>,
    #[serde(default)]
    pub after_children: Option<Box<StepDefinition>>,
}

/// Where rows come from, tagged by `from`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum RowInputDefinition {
    File(FileFormatDefinition),
    Sql {
        statement: String,
        #[serde(default)]
        columns: Vec<ColumnDefinition>,
    },
    Sheet {
        sheet: String,
        #[serde(default)]
        columns: Vec<ColumnDefinition>,
    },
    Queue {
        queue: String,
        #[serde(default)]
        columns: Vec<ColumnDefinition>,
    },
    /// Source registered with the component registry.
    Custom {
        source: String,
    },
}

/// Where processed rows go, tagged by `to`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "to", rename_all = "snake_case")]
pub enum RowOutputDefinition {
    File(FileFormatDefinition),
    Sheet { sheet: String, columns: Vec<String> },
    Custom { sink: String },
}

/// Delimited text layout shared by input and output files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileFormatDefinition {
    /// Wildcard pattern for driver inputs, `$field` for a context-provided
    /// name, or a name with `{parent}` standing for the parent file stem.
    pub file_name: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// First line holds column names and is skipped on input, written on output.
    #[serde(default)]
    pub header: bool,
    pub columns: Vec<ColumnDefinition>,
}

fn default_delimiter() -> char {
    ','
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(default, rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub required: bool,
}

/// Fields joining a child row to its parent row. Keys are compared as the
/// concatenated text of the listed fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkDefinition {
    pub child_fields: Vec<String>,
    pub parent_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatorDefinition {
    pub function: AggregationFunction,
    /// Field accumulated from each row; ignored by `count`.
    #[serde(default)]
    pub input_field: Option<String>,
    pub output_field: String,
    /// Only rows satisfying this condition are accumulated.
    #[serde(default, rename = "if")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AggregationFunction {
    Sum,
    Average,
    Count,
    Min,
    Max,
    First,
    Last,
}
