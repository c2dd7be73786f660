//! Prepared services plus the collaborators they run against.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use batchflow_util::EngineConfig;
use indexmap::IndexMap;
use tracing::{error, info};

use crate::context::ExecutionContext;
use crate::db::DatabaseDriver;
use crate::errors::{EngineError, EngineResult};
use crate::messaging::{MessageBroker, UserTransactionManager};
use crate::registry::ComponentRegistry;
use crate::service::{InvocationStatus, Service};

/// Receives execution errors no handler step took care of.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, origin: &str, error: &EngineError, context: &ExecutionContext);
}

/// Default reporter: logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorReporter;

impl ErrorReporter for LoggingErrorReporter {
    fn report(&self, origin: &str, error: &EngineError, context: &ExecutionContext) {
        error!(
            origin = %origin,
            error = %error,
            messages = context.messages().len(),
            in_error = context.in_error(),
            "unhandled execution error"
        );
    }
}

/// Cooperative cancellation flag polled by interruptible batch runs between rows.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Runtime {
    services: IndexMap<String, Service>,
    driver: Arc<dyn DatabaseDriver>,
    reporter: Arc<dyn ErrorReporter>,
    broker: Option<Arc<dyn MessageBroker>>,
    user_transactions: Option<Arc<dyn UserTransactionManager>>,
    interrupt: InterruptFlag,
    default_schema: Option<String>,
    interruptible: bool,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .field("broker", &self.broker.is_some())
            .field("user_transactions", &self.user_transactions.is_some())
            .field("default_schema", &self.default_schema)
            .field("interruptible", &self.interruptible)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Prepares every registered service. The first configuration error
    /// aborts preparation so an invalid service can never be invoked.
    pub fn prepare(registry: &ComponentRegistry, driver: Arc<dyn DatabaseDriver>) -> EngineResult<Runtime> {
        let mut services = IndexMap::new();
        for definition in registry.services() {
            let service = Service::prepare(definition, registry)?;
            services.insert(definition.service.clone(), service);
        }
        info!(services = services.len(), "prepared services");
        Ok(Runtime {
            services,
            driver,
            reporter: Arc::new(LoggingErrorReporter),
            broker: None,
            user_transactions: None,
            interrupt: InterruptFlag::new(),
            default_schema: None,
            interruptible: true,
        })
    }

    /// Applies the default schema and interrupt policy from the configuration file.
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.default_schema = config.default_schema.clone();
        self.interruptible = config.interruptible;
        self
    }

    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_message_broker(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_user_transactions(mut self, manager: Arc<dyn UserTransactionManager>) -> Self {
        self.user_transactions = Some(manager);
        self
    }

    pub fn with_interrupt_flag(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Runs a service as a top-level invocation against `context`.
    pub fn invoke(&self, service: &str, context: &mut ExecutionContext) -> EngineResult<InvocationStatus> {
        self.service(service)?.invoke(self, context)
    }

    pub fn service(&self, name: &str) -> EngineResult<&Service> {
        self.services
            .get(name)
            .ok_or_else(|| EngineError::configuration(format!("unknown service '{name}'")))
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn interrupt(&self) -> &InterruptFlag {
        &self.interrupt
    }

    pub(crate) fn driver(&self) -> &dyn DatabaseDriver {
        self.driver.as_ref()
    }

    pub(crate) fn reporter(&self) -> &dyn ErrorReporter {
        self.reporter.as_ref()
    }

    pub(crate) fn broker(&self) -> Option<&Arc<dyn MessageBroker>> {
        self.broker.as_ref()
    }

    pub(crate) fn user_transactions(&self) -> Option<&Arc<dyn UserTransactionManager>> {
        self.user_transactions.as_ref()
    }

    pub(crate) fn default_schema(&self) -> Option<&str> {
        self.default_schema.as_deref()
    }

    pub(crate) fn interruptible_by_default(&self) -> bool {
        self.interruptible
    }
}
