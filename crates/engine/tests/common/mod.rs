#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use batchflow_engine::{
    ComponentRegistry, Connection, DatabaseDriver, EngineError, ErrorReporter, ExecutionContext, MessageBroker,
    QueueSession, Runtime, UserTransactionManager,
};
use batchflow_types::{AccessLevel, DataSheet, Row, ServiceDefinition};

/// Driver recording every connection event as `"{access}:{event}"`.
#[derive(Default)]
pub struct RecordingDriver {
    events: Arc<Mutex<Vec<String>>>,
    fail_on: Option<String>,
    fail_commit: Option<usize>,
    commits: Arc<AtomicUsize>,
}

impl RecordingDriver {
    pub fn new() -> Arc<RecordingDriver> {
        Arc::new(RecordingDriver::default())
    }

    /// Driver whose connections fail any statement containing `fragment`.
    pub fn failing_on(fragment: &str) -> Arc<RecordingDriver> {
        Arc::new(RecordingDriver {
            fail_on: Some(fragment.to_string()),
            ..RecordingDriver::default()
        })
    }

    /// Driver whose `nth` commit, counted across all its connections, fails.
    pub fn failing_commit(nth: usize) -> Arc<RecordingDriver> {
        Arc::new(RecordingDriver {
            fail_commit: Some(nth),
            ..RecordingDriver::default()
        })
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|recorded| recorded.as_str() == event).count()
    }
}

impl DatabaseDriver for RecordingDriver {
    fn open(&self, access: AccessLevel, _schema: Option<&str>) -> Result<Box<dyn Connection>> {
        self.events.lock().expect("events lock").push(format!("{access}:open"));
        Ok(Box::new(RecordingConnection {
            access,
            events: Arc::clone(&self.events),
            fail_on: self.fail_on.clone(),
            fail_commit: self.fail_commit,
            commits: Arc::clone(&self.commits),
        }))
    }
}

struct RecordingConnection {
    access: AccessLevel,
    events: Arc<Mutex<Vec<String>>>,
    fail_on: Option<String>,
    fail_commit: Option<usize>,
    commits: Arc<AtomicUsize>,
}

impl RecordingConnection {
    fn record(&self, event: impl AsRef<str>) {
        self.events
            .lock()
            .expect("events lock")
            .push(format!("{}:{}", self.access, event.as_ref()));
    }
}

impl Connection for RecordingConnection {
    fn execute(&mut self, statement: &str, _context: &ExecutionContext) -> Result<u64> {
        self.record(format!("execute {statement}"));
        if let Some(fragment) = &self.fail_on
            && statement.contains(fragment.as_str())
        {
            bail!("statement failed: {statement}");
        }
        Ok(1)
    }

    fn query(&mut self, statement: &str, _context: &ExecutionContext) -> Result<DataSheet> {
        self.record(format!("query {statement}"));
        Ok(DataSheet::new(Vec::<String>::new()))
    }

    fn commit(&mut self) -> Result<()> {
        self.record("commit");
        let nth = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_commit == Some(nth) {
            bail!("commit {nth} failed");
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.record("rollback");
        Ok(())
    }
}

/// Broker serving one in-memory queue. Sessions record `borrow`, `commit`,
/// `rollback` and `return` events.
#[derive(Default)]
pub struct InMemoryBroker {
    pending: Arc<Mutex<VecDeque<Row>>>,
    events: Arc<Mutex<Vec<String>>>,
}

impl InMemoryBroker {
    pub fn with_rows(rows: impl IntoIterator<Item = Row>) -> Arc<InMemoryBroker> {
        Arc::new(InMemoryBroker {
            pending: Arc::new(Mutex::new(rows.into_iter().collect())),
            events: Arc::default(),
        })
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|recorded| recorded.as_str() == event).count()
    }
}

impl MessageBroker for InMemoryBroker {
    fn borrow_session(&self) -> Result<Box<dyn QueueSession>> {
        self.events.lock().expect("events lock").push("borrow".to_string());
        Ok(Box::new(InMemorySession {
            pending: Arc::clone(&self.pending),
            events: Arc::clone(&self.events),
        }))
    }

    fn return_session(&self, _session: Box<dyn QueueSession>) {
        self.events.lock().expect("events lock").push("return".to_string());
    }
}

struct InMemorySession {
    pending: Arc<Mutex<VecDeque<Row>>>,
    events: Arc<Mutex<Vec<String>>>,
}

impl QueueSession for InMemorySession {
    fn receive(&mut self, _queue: &str) -> Result<Option<Row>> {
        Ok(self.pending.lock().expect("pending lock").pop_front())
    }

    fn commit(&mut self) -> Result<()> {
        self.events.lock().expect("events lock").push("commit".to_string());
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.events.lock().expect("events lock").push("rollback".to_string());
        Ok(())
    }
}

/// Transaction manager recording `begin`, `commit` and `rollback`.
#[derive(Default)]
pub struct RecordingTransactions {
    events: Mutex<Vec<&'static str>>,
}

impl RecordingTransactions {
    pub fn new() -> Arc<RecordingTransactions> {
        Arc::new(RecordingTransactions::default())
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().expect("events lock").clone()
    }

    fn record(&self, event: &'static str) -> Result<()> {
        self.events.lock().expect("events lock").push(event);
        Ok(())
    }
}

impl UserTransactionManager for RecordingTransactions {
    fn begin(&self) -> Result<()> {
        self.record("begin")
    }

    fn commit(&self) -> Result<()> {
        self.record("commit")
    }

    fn rollback(&self) -> Result<()> {
        self.record("rollback")
    }
}

/// Reporter keeping the text of every unhandled error.
#[derive(Default)]
pub struct CollectingReporter {
    reports: Mutex<Vec<String>>,
}

impl CollectingReporter {
    pub fn new() -> Arc<CollectingReporter> {
        Arc::new(CollectingReporter::default())
    }

    pub fn reports(&self) -> Vec<String> {
        self.reports.lock().expect("reports lock").clone()
    }
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, origin: &str, error: &EngineError, _context: &ExecutionContext) {
        self.reports.lock().expect("reports lock").push(format!("{origin}: {error}"));
    }
}

/// Parses a YAML list of service documents into a fresh registry.
pub fn registry_from_yaml(yaml: &str) -> ComponentRegistry {
    let definitions: Vec<ServiceDefinition> = serde_yaml::from_str(yaml).expect("parse service definitions");
    let mut registry = ComponentRegistry::new();
    registry.add_services(definitions).expect("register services");
    registry
}

pub fn runtime_with(registry: &ComponentRegistry, driver: Arc<RecordingDriver>) -> Runtime {
    Runtime::prepare(registry, driver).expect("prepare runtime")
}
