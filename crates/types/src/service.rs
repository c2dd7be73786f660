//! Declarative service and step definitions.
//!
//! These are the authoring shapes deserialized from YAML/JSON documents. The
//! engine prepares them into executable form once; nothing here carries
//! runtime state. Authoring order is preserved so step positions and jump
//! targets are stable.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{AccessLevel, MessageDefinition, Value};

pub mod batch;

pub use batch::{
    AggregationFunction, AggregatorDefinition, BatchDefinition, ColumnDefinition, FileFormatDefinition, LinkDefinition,
    QueueUsage, RowInputDefinition, RowOutputDefinition, RowProcessorDefinition,
};

/// A named service: an ordered list of steps run under one access policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceDefinition {
    /// Unique service name used for invocation and sub-service lookups.
    pub service: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Transaction policy applied when the service is invoked at the top level.
    #[serde(default)]
    pub access: AccessLevel,
    /// Schema used when the service opens its own connection.
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

/// Message catalog document: named messages keyed in authoring order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MessageCatalogDefinition {
    #[serde(default)]
    pub messages: IndexMap<String, MessageDefinition>,
}

/// One step: the attributes shared by every kind plus the kind-specific body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    #[serde(flatten)]
    pub header: StepHeaderDefinition,
    #[serde(flatten)]
    pub body: StepBodyDefinition,
}

impl StepDefinition {
    pub fn new(body: StepBodyDefinition) -> Self {
        Self {
            header: StepHeaderDefinition::default(),
            body,
        }
    }

    pub fn named(name: impl Into<String>, body: StepBodyDefinition) -> Self {
        let mut step = Self::new(body);
        step.header.name = Some(name.into());
        step
    }
}

/// Attributes common to every step kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StepHeaderDefinition {
    /// Name unique within the enclosing sequence; generated when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Precondition; the step is skipped when it evaluates to false.
    #[serde(default, rename = "if")]
    pub condition: Option<String>,
    /// Run only when this sheet exists and has at least one row.
    #[serde(default)]
    pub only_if_rows_in: Option<String>,
    /// Run only when this sheet is missing or empty.
    #[serde(default)]
    pub only_if_no_rows_in: Option<String>,
    /// Jump taken when the step result is true.
    #[serde(default)]
    pub on_success: Option<String>,
    /// Jump taken when the step result is false.
    #[serde(default)]
    pub on_failure: Option<String>,
    #[serde(default)]
    pub success_message: Option<MessageBinding>,
    #[serde(default)]
    pub failure_message: Option<MessageBinding>,
    /// Stop the invocation when a raised success/failure message is an error.
    #[serde(default)]
    pub stop_if_message_is_error: bool,
}

/// Reference to a catalog message plus the fields that fill its placeholders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageBinding {
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
}

/// Kind-specific part of a step, tagged by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepBodyDefinition {
    /// Sets a field to a literal, or to another field's value with `$name`.
    SetValue {
        field: String,
        #[serde(default)]
        value: Value,
    },
    RemoveValue {
        field: String,
    },
    AddMessage {
        message: String,
        #[serde(default)]
        params: Vec<String>,
    },
    JumpTo {
        target: String,
    },
    /// Logs the listed fields, or every field when the list is empty.
    Log {
        #[serde(default)]
        fields: Vec<String>,
    },
    CreateSheet {
        sheet: String,
        columns: Vec<String>,
        #[serde(default)]
        rows: Vec<Vec<Value>>,
    },
    /// Runs custom logic registered under this name.
    Logic {
        logic: String,
    },
    DropIntoMessageBox {
        field: String,
    },
    PickupFromMessageBox {
        field: String,
    },
    Sql(SqlStepDefinition),
    Block(BlockDefinition),
    Loop(LoopDefinition),
    SubService {
        service: String,
    },
    FanOut(FanOutDefinition),
    Batch(BatchDefinition),
}

/// Database-bound step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SqlStepDefinition {
    pub statement: String,
    #[serde(default)]
    pub operation: SqlOperation,
    /// Sheet receiving query results; defaults to the step name.
    #[serde(default)]
    pub sheet: Option<String>,
    /// Overrides the access implied by the operation.
    #[serde(default)]
    pub access: Option<AccessLevel>,
    #[serde(default)]
    pub schema: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqlOperation {
    #[default]
    Update,
    Query,
}

/// Nested sequence with its own jump table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BlockDefinition {
    /// Declared access; computed from the children when absent.
    #[serde(default)]
    pub access: Option<AccessLevel>,
    pub steps: Vec<StepDefinition>,
}

/// Repeats a nested sequence over the rows of a sheet or while a condition holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LoopDefinition {
    #[serde(default)]
    pub sheet: Option<String>,
    #[serde(default, rename = "while")]
    pub while_condition: Option<String>,
    /// Columns copied into fields before each iteration; `["*"]` copies all.
    #[serde(default)]
    pub columns_to_fields: Vec<String>,
    /// Fields copied back into the current row after each iteration; `["*"]` copies all.
    #[serde(default)]
    pub fields_to_columns: Vec<String>,
    #[serde(default)]
    pub access: Option<AccessLevel>,
    pub steps: Vec<StepDefinition>,
}

/// Runs branches concurrently between an optional gate and final step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FanOutDefinition {
    #[serde(default)]
    pub gate: Option<Box<StepDefinition>>,
    pub branches: Vec<StepDefinition>,
    #[serde(default)]
    pub finally: Option<Box<StepDefinition>>,
}
