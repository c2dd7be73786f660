//! # Batchflow Engine
//!
//! The Batchflow Engine prepares declarative service definitions and runs
//! them against a per-invocation [`ExecutionContext`]. It covers conditional
//! steps, named jumps and STOP/BREAK/CONTINUE signals, nested blocks and
//! loops, sub-service calls, transaction negotiation between nested
//! components, concurrent fan-out, and batch row processing with one
//! transaction per driver row.
//!
//! ## Usage
//!
//! ```rust
//! use batchflow_engine::{ComponentRegistry, ExecutionContext, NoopDriver, Runtime, parse_service_file};
//!
//! let temp_dir = tempfile::tempdir()?;
//! let service_path = temp_dir.path().join("greet.yaml");
//! std::fs::write(&service_path, r#"
//! service: greet
//! steps:
//!   - kind: set_value
//!     field: greeting
//!     value: hello
//! "#)?;
//!
//! let mut registry = ComponentRegistry::new();
//! registry.add_services(parse_service_file(&service_path)?)?;
//! let runtime = Runtime::prepare(&registry, NoopDriver::shared())?;
//!
//! let mut context = ExecutionContext::new();
//! runtime.invoke("greet", &mut context)?;
//! assert_eq!(context.value("greeting").and_then(|value| value.as_text()), Some("hello"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - **`registry`**: services, messages and custom components resolved by name
//! - **`service`** / **`sequence`** / **`step`**: prepared step trees and the sequence executor
//! - **`transaction`**: reuse-or-open decisions for database handles
//! - **`batch`**: driver/child row processors, row sources and sinks
//! - **`fanout`**: concurrent branches over forked contexts
//! - **`db`** / **`messaging`**: contracts for external collaborators

use std::{fs, path::Path};

use anyhow::{Context, Result};
use batchflow_types::{MessageCatalogDefinition, MessageDefinition, ServiceDefinition};
use indexmap::IndexMap;
use serde_yaml::Value as YamlValue;

pub mod batch;
pub mod context;
pub mod db;
pub mod errors;
pub mod expression;
mod fanout;
pub mod messaging;
pub mod registry;
pub mod runtime;
pub mod sequence;
pub mod service;
pub mod step;
mod transaction;

pub use batch::{
    DelimitedFileSink, DelimitedFileSource, RowError, RowSink, RowSinkFactory, RowSource, RowSourceFactory, SheetSink,
    SheetSource, SqlSource, validate_row,
};
pub use context::{ExecutionContext, MergeConflict};
pub use db::{Connection, DatabaseDriver, DbHandle, NoopDriver};
pub use errors::{EngineError, EngineResult};
pub use expression::{Expression, ExpressionError};
pub use messaging::{MessageBroker, QueueSession, UserTransactionManager};
pub use registry::{ComponentRegistry, LogicFn, StepLogic};
pub use runtime::{ErrorReporter, InterruptFlag, LoggingErrorReporter, Runtime};
pub use sequence::{JumpTable, RESULT_SUFFIX, StepSequence};
pub use service::{InvocationStatus, Service};
pub use step::{JumpTarget, PreparedStep, StepOutcome};

/// Loads the service definitions held by one YAML or JSON file.
///
/// A file holds either a single service (a document with a `service` key) or
/// several services under a `services` map keyed by service name. Entries of
/// the map may omit `service`; the key is used instead.
///
/// # Errors
///
/// Returns an error when the file cannot be read, is not valid YAML/JSON, or
/// does not match either document shape.
pub fn parse_service_file(file_path: impl AsRef<Path>) -> Result<Vec<ServiceDefinition>> {
    let file_path = file_path.as_ref();
    let content =
        fs::read_to_string(file_path).with_context(|| format!("Failed to read service file: {}", file_path.display()))?;
    let document: YamlValue = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse service file: {}", file_path.display()))?;

    if let Some(services) = document.get("services") {
        let services: IndexMap<String, YamlValue> = serde_yaml::from_value(services.clone())
            .with_context(|| format!("'services' in {} must be a map of service definitions", file_path.display()))?;
        let mut definitions = Vec::with_capacity(services.len());
        for (name, mut body) in services {
            if let YamlValue::Mapping(mapping) = &mut body
                && !mapping.contains_key("service")
            {
                mapping.insert(YamlValue::from("service"), YamlValue::from(name.clone()));
            }
            let definition: ServiceDefinition = serde_yaml::from_value(body)
                .with_context(|| format!("Invalid service '{name}' in {}", file_path.display()))?;
            definitions.push(definition);
        }
        return Ok(definitions);
    }

    if document.get("service").is_some() {
        let definition: ServiceDefinition = serde_yaml::from_value(document)
            .with_context(|| format!("Invalid service definition in {}", file_path.display()))?;
        return Ok(vec![definition]);
    }

    anyhow::bail!(
        "Unsupported service document format in {}. Expected one of:\n\
         - Single service definition with 'service' and 'steps' fields\n\
         - Multi-service document with services under the 'services' key\n",
        file_path.display()
    );
}

/// Loads every `*.yaml`, `*.yml` and `*.json` file of `directory`, in file
/// name order.
pub fn load_services_dir(directory: impl AsRef<Path>) -> Result<Vec<ServiceDefinition>> {
    let directory = directory.as_ref();
    let entries = fs::read_dir(directory)
        .with_context(|| format!("Failed to read services directory: {}", directory.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_definition = path
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| matches!(extension, "yaml" | "yml" | "json"));
        if is_definition && path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    let mut definitions = Vec::new();
    for file in files {
        definitions.extend(parse_service_file(&file)?);
    }
    Ok(definitions)
}

/// Loads a message catalog document (`messages:` map of name to definition).
pub fn parse_message_catalog(file_path: impl AsRef<Path>) -> Result<IndexMap<String, MessageDefinition>> {
    let file_path = file_path.as_ref();
    let content =
        fs::read_to_string(file_path).with_context(|| format!("Failed to read message catalog: {}", file_path.display()))?;
    let catalog: MessageCatalogDefinition = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse message catalog: {}", file_path.display()))?;
    Ok(catalog.messages)
}

#[cfg(test)]
mod tests {
    use batchflow_types::{AccessLevel, MessageSeverity};

    use super::*;

    #[test]
    fn parses_single_service_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let service_path = temp_dir.path().join("orders.yaml");
        fs::write(
            &service_path,
            r#"
service: orders
access: read_only
steps:
  - kind: set_value
    field: status
    value: open
"#,
        )
        .unwrap();

        let services = parse_service_file(&service_path).unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].service, "orders");
        assert_eq!(services[0].access, AccessLevel::ReadOnly);
        assert_eq!(services[0].steps.len(), 1);
    }

    #[test]
    fn map_keys_name_services_without_their_own_name() {
        let temp_dir = tempfile::tempdir().unwrap();
        let service_path = temp_dir.path().join("bundle.yaml");
        fs::write(
            &service_path,
            r#"
services:
  load:
    steps: []
  purge:
    service: purge-all
    steps: []
"#,
        )
        .unwrap();

        let services = parse_service_file(&service_path).expect("parse multi-service bundle");
        let names: Vec<&str> = services.iter().map(|service| service.service.as_str()).collect();
        assert_eq!(names, vec!["load", "purge-all"]);
    }

    #[test]
    fn unsupported_documents_are_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let service_path = temp_dir.path().join("other.yaml");
        fs::write(&service_path, "workflow: nope\n").unwrap();
        let error = parse_service_file(&service_path).unwrap_err();
        assert!(error.to_string().contains("Unsupported service document format"));
    }

    #[test]
    fn directory_loading_skips_other_files_and_sorts() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("b.yaml"), "service: second\n").unwrap();
        fs::write(temp_dir.path().join("a.yml"), "service: first\n").unwrap();
        fs::write(temp_dir.path().join("notes.txt"), "not a service").unwrap();

        let services = load_services_dir(temp_dir.path()).unwrap();
        let names: Vec<&str> = services.iter().map(|service| service.service.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn message_catalog_keeps_authoring_order() {
        let temp_dir = tempfile::tempdir().unwrap();
        let catalog_path = temp_dir.path().join("messages.yaml");
        fs::write(
            &catalog_path,
            r#"
messages:
  order_missing:
    severity: error
    text: "Order {0} does not exist"
  order_loaded:
    text: "Loaded order {0}"
"#,
        )
        .unwrap();

        let messages = parse_message_catalog(&catalog_path).unwrap();
        let names: Vec<&String> = messages.keys().collect();
        assert_eq!(names, vec!["order_missing", "order_loaded"]);
        assert_eq!(messages["order_missing"].severity, MessageSeverity::Error);
    }
}
