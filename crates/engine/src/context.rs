//! Per-invocation execution context.
//!
//! Holds named field values, named sheets, accumulated messages, the error
//! flag and a single message-box slot used to hand a value from one step to
//! a later one. A context forked for a concurrent branch records the keys it
//! writes so the branches can be merged back without silently overwriting
//! each other.

use batchflow_types::{DataSheet, Message, Value};
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use thiserror::Error;

/// Raised when forked contexts wrote the same key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("concurrent branches both wrote {kind} '{key}'")]
pub struct MergeConflict {
    pub kind: &'static str,
    pub key: String,
}

#[derive(Debug, Clone, Default)]
struct WriteJournal {
    fields: IndexSet<String>,
    sheets: IndexSet<String>,
    message_box: bool,
    inherited_messages: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionContext {
    fields: IndexMap<String, Value>,
    sheets: IndexMap<String, DataSheet>,
    messages: Vec<Message>,
    in_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_box: Option<Value>,
    #[serde(skip)]
    journal: Option<WriteJournal>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Field value, `Null` when unset.
    pub fn value_or_null(&self, name: &str) -> Value {
        self.fields.get(name).cloned().unwrap_or_default()
    }

    pub fn set_value(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        self.note_field(&name);
        self.fields.insert(name, value.into());
    }

    pub fn remove_value(&mut self, name: &str) -> Option<Value> {
        self.note_field(name);
        self.fields.shift_remove(name)
    }

    pub fn fields(&self) -> &IndexMap<String, Value> {
        &self.fields
    }

    pub fn sheet(&self, name: &str) -> Option<&DataSheet> {
        self.sheets.get(name)
    }

    pub fn sheet_mut(&mut self, name: &str) -> Option<&mut DataSheet> {
        if self.sheets.contains_key(name) {
            self.note_sheet(name);
        }
        self.sheets.get_mut(name)
    }

    /// Adds or replaces a sheet.
    pub fn put_sheet(&mut self, name: impl Into<String>, sheet: DataSheet) {
        let name = name.into();
        self.note_sheet(&name);
        self.sheets.insert(name, sheet);
    }

    pub fn remove_sheet(&mut self, name: &str) -> Option<DataSheet> {
        self.note_sheet(name);
        self.sheets.shift_remove(name)
    }

    /// Row count of a sheet; zero when the sheet does not exist.
    pub fn rows_in_sheet(&self, name: &str) -> usize {
        self.sheets.get(name).map(DataSheet::len).unwrap_or(0)
    }

    pub fn sheets(&self) -> &IndexMap<String, DataSheet> {
        &self.sheets
    }

    /// Appends a message. An error-severity message puts the context in error.
    pub fn add_message(&mut self, message: Message) {
        if message.is_error() {
            self.in_error = true;
        }
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn in_error(&self) -> bool {
        self.in_error
    }

    pub fn mark_in_error(&mut self) {
        self.in_error = true;
    }

    /// Clears messages and the error flag. Batch drivers call this per row.
    pub fn reset_messages(&mut self) {
        self.messages.clear();
        self.in_error = false;
        if let Some(journal) = self.journal.as_mut() {
            journal.inherited_messages = 0;
        }
    }

    pub fn drop_into_message_box(&mut self, value: Value) {
        self.note_message_box();
        self.message_box = Some(value);
    }

    /// Takes the value out of the message box, leaving it empty.
    pub fn pickup_from_message_box(&mut self) -> Option<Value> {
        self.note_message_box();
        self.message_box.take()
    }

    /// Copy of this context for a concurrent branch. The copy records every
    /// key it writes so [`ExecutionContext::merge`] can detect overlaps.
    pub fn fork(&self) -> ExecutionContext {
        let mut fork = self.clone();
        fork.journal = Some(WriteJournal {
            inherited_messages: self.messages.len(),
            ..WriteJournal::default()
        });
        fork
    }

    /// Applies the writes of forked contexts in order. Fails without applying
    /// anything when two forks wrote the same field, sheet or message box.
    pub fn merge(&mut self, forks: Vec<ExecutionContext>) -> Result<(), MergeConflict> {
        let mut written_fields: IndexSet<&str> = IndexSet::new();
        let mut written_sheets: IndexSet<&str> = IndexSet::new();
        let mut message_box_written = false;
        for fork in &forks {
            let Some(journal) = fork.journal.as_ref() else { continue };
            for field in &journal.fields {
                if !written_fields.insert(field.as_str()) {
                    return Err(MergeConflict {
                        kind: "field",
                        key: field.clone(),
                    });
                }
            }
            for sheet in &journal.sheets {
                if !written_sheets.insert(sheet.as_str()) {
                    return Err(MergeConflict {
                        kind: "sheet",
                        key: sheet.clone(),
                    });
                }
            }
            if journal.message_box {
                if message_box_written {
                    return Err(MergeConflict {
                        kind: "message box",
                        key: "inbox".to_string(),
                    });
                }
                message_box_written = true;
            }
        }

        for mut fork in forks {
            let Some(journal) = fork.journal.take() else { continue };
            for field in journal.fields {
                match fork.fields.shift_remove(&field) {
                    Some(value) => self.set_value(field, value),
                    None => {
                        self.remove_value(&field);
                    }
                }
            }
            for name in journal.sheets {
                match fork.sheets.shift_remove(&name) {
                    Some(sheet) => self.put_sheet(name, sheet),
                    None => {
                        self.remove_sheet(&name);
                    }
                }
            }
            if journal.message_box {
                self.note_message_box();
                self.message_box = fork.message_box.take();
            }
            let inherited = journal.inherited_messages.min(fork.messages.len());
            for message in fork.messages.drain(inherited..) {
                self.add_message(message);
            }
            if fork.in_error {
                self.in_error = true;
            }
        }
        Ok(())
    }

    fn note_field(&mut self, name: &str) {
        if let Some(journal) = self.journal.as_mut() {
            journal.fields.insert(name.to_string());
        }
    }

    fn note_sheet(&mut self, name: &str) {
        if let Some(journal) = self.journal.as_mut() {
            journal.sheets.insert(name.to_string());
        }
    }

    fn note_message_box(&mut self) {
        if let Some(journal) = self.journal.as_mut() {
            journal.message_box = true;
        }
    }
}
