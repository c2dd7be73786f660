//! Named components resolved while services are prepared.
//!
//! The registry is an explicit value handed to [`crate::Runtime::prepare`];
//! every lookup is a pure function of the registry contents and a name.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use batchflow_types::{AccessLevel, MessageDefinition, ServiceDefinition, Value};
use indexmap::IndexMap;

use crate::batch::{RowSinkFactory, RowSourceFactory};
use crate::context::ExecutionContext;
use crate::db::DbHandle;
use crate::errors::{EngineError, EngineResult};

/// Custom step body registered under a name and run by `logic` steps.
pub trait StepLogic: Send + Sync {
    /// Access the logic needs; the step negotiates a handle accordingly.
    fn access(&self) -> AccessLevel {
        AccessLevel::None
    }

    fn execute(&self, context: &mut ExecutionContext, db: Option<&mut DbHandle>) -> Result<Value>;
}

/// Adapter registering a plain closure as [`StepLogic`].
pub struct LogicFn<F>(pub F);

impl<F> StepLogic for LogicFn<F>
where
    F: Fn(&mut ExecutionContext) -> Result<Value> + Send + Sync,
{
    fn execute(&self, context: &mut ExecutionContext, _db: Option<&mut DbHandle>) -> Result<Value> {
        (self.0)(context)
    }
}

#[derive(Default)]
pub struct ComponentRegistry {
    services: IndexMap<String, ServiceDefinition>,
    messages: IndexMap<String, MessageDefinition>,
    logic: IndexMap<String, Arc<dyn StepLogic>>,
    sources: IndexMap<String, Arc<dyn RowSourceFactory>>,
    sinks: IndexMap<String, Arc<dyn RowSinkFactory>>,
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .field("messages", &self.messages.len())
            .field("logic", &self.logic.keys().collect::<Vec<_>>())
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("sinks", &self.sinks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a service definition. Names must be unique.
    pub fn add_service(&mut self, definition: ServiceDefinition) -> EngineResult<()> {
        if self.services.contains_key(&definition.service) {
            return Err(EngineError::configuration(format!(
                "service '{}' is defined more than once",
                definition.service
            )));
        }
        self.services.insert(definition.service.clone(), definition);
        Ok(())
    }

    pub fn add_services(&mut self, definitions: impl IntoIterator<Item = ServiceDefinition>) -> EngineResult<()> {
        definitions.into_iter().try_for_each(|definition| self.add_service(definition))
    }

    /// Merges catalog entries; later entries replace earlier ones.
    pub fn add_messages(&mut self, messages: IndexMap<String, MessageDefinition>) {
        self.messages.extend(messages);
    }

    pub fn add_message(&mut self, name: impl Into<String>, definition: MessageDefinition) {
        self.messages.insert(name.into(), definition);
    }

    pub fn register_logic(&mut self, name: impl Into<String>, logic: impl StepLogic + 'static) {
        self.logic.insert(name.into(), Arc::new(logic));
    }

    /// Registers a closure that needs no database access.
    pub fn register_logic_fn<F>(&mut self, name: impl Into<String>, logic: F)
    where
        F: Fn(&mut ExecutionContext) -> Result<Value> + Send + Sync + 'static,
    {
        self.register_logic(name, LogicFn(logic));
    }

    pub fn register_source(&mut self, name: impl Into<String>, factory: impl RowSourceFactory + 'static) {
        self.sources.insert(name.into(), Arc::new(factory));
    }

    pub fn register_sink(&mut self, name: impl Into<String>, factory: impl RowSinkFactory + 'static) {
        self.sinks.insert(name.into(), Arc::new(factory));
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.get(name)
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceDefinition> {
        self.services.values()
    }

    pub fn message(&self, name: &str) -> Option<&MessageDefinition> {
        self.messages.get(name)
    }

    pub fn logic(&self, name: &str) -> Option<Arc<dyn StepLogic>> {
        self.logic.get(name).cloned()
    }

    pub fn source(&self, name: &str) -> Option<Arc<dyn RowSourceFactory>> {
        self.sources.get(name).cloned()
    }

    pub fn sink(&self, name: &str) -> Option<Arc<dyn RowSinkFactory>> {
        self.sinks.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(name: &str) -> ServiceDefinition {
        ServiceDefinition {
            service: name.to_string(),
            description: None,
            access: AccessLevel::None,
            schema: None,
            steps: Vec::new(),
        }
    }

    #[test]
    fn duplicate_services_are_rejected() {
        let mut registry = ComponentRegistry::new();
        registry.add_service(definition("orders")).unwrap();
        let error = registry.add_service(definition("orders")).unwrap_err();
        assert!(error.is_configuration());
    }

    #[test]
    fn closures_register_as_logic() {
        let mut registry = ComponentRegistry::new();
        registry.register_logic_fn("double", |context: &mut ExecutionContext| {
            let value = context.value("n").and_then(Value::as_integer).unwrap_or(0);
            Ok(Value::Integer(value * 2))
        });
        let logic = registry.logic("double").unwrap();
        let mut context = ExecutionContext::new();
        context.set_value("n", 21i64);
        assert_eq!(logic.execute(&mut context, None).unwrap(), Value::Integer(42));
        assert_eq!(logic.access(), AccessLevel::None);
    }
}
