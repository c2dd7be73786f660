//! Severity-tagged messages accumulated on the execution context, and the
//! catalog entries they are formatted from.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageSeverity {
    Success,
    #[default]
    Info,
    Warning,
    Error,
}

impl fmt::Display for MessageSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MessageSeverity::Success => "success",
            MessageSeverity::Info => "info",
            MessageSeverity::Warning => "warning",
            MessageSeverity::Error => "error",
        };
        f.write_str(label)
    }
}

/// Catalog entry for a named message.
///
/// `text` may carry positional placeholders (`{0}`, `{1}`, ...) that are filled
/// from the parameters supplied when the message is raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDefinition {
    #[serde(default)]
    pub severity: MessageSeverity,
    pub text: String,
}

/// A formatted message raised during an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Catalog name, or an ad-hoc code for engine-generated messages.
    pub name: String,
    pub severity: MessageSeverity,
    pub text: String,
    /// Field the message refers to, when it concerns one input value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl Message {
    pub fn new(name: impl Into<String>, severity: MessageSeverity, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            severity,
            text: text.into(),
            field: None,
        }
    }

    pub fn error(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name, MessageSeverity::Error, text)
    }

    pub fn for_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == MessageSeverity::Error
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "[{}] {} ({field})", self.severity, self.text),
            None => write!(f, "[{}] {}", self.severity, self.text),
        }
    }
}
