//! Queue and user-transaction contracts used by batch runs.

use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use batchflow_types::Row;

/// A session on the message broker. Received messages stay pending until
/// the session commits; a rollback makes them available again.
pub trait QueueSession: Send {
    /// Next message on `queue` as a row, or `None` when the queue is drained.
    fn receive(&mut self, queue: &str) -> Result<Option<Row>>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;
}

/// Lends sessions to batch runs.
pub trait MessageBroker: Send + Sync {
    fn borrow_session(&self) -> Result<Box<dyn QueueSession>>;

    fn return_session(&self, session: Box<dyn QueueSession>);
}

/// Externally managed transaction spanning every resource a row touches.
pub trait UserTransactionManager: Send + Sync {
    fn begin(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;
}

/// Session shared between a queue row source and the row boundary that
/// commits it.
#[derive(Clone)]
pub(crate) struct SharedSession(Arc<Mutex<Box<dyn QueueSession>>>);

impl SharedSession {
    pub(crate) fn new(session: Box<dyn QueueSession>) -> Self {
        Self(Arc::new(Mutex::new(session)))
    }

    pub(crate) fn with<T>(&self, action: impl FnOnce(&mut dyn QueueSession) -> Result<T>) -> Result<T> {
        let mut session = self.0.lock().map_err(|_| anyhow!("queue session lock poisoned"))?;
        action(session.as_mut())
    }

    /// Recovers the session once every other holder has been dropped.
    pub(crate) fn into_inner(self) -> Option<Box<dyn QueueSession>> {
        Arc::try_unwrap(self.0).ok().and_then(|mutex| mutex.into_inner().ok())
    }
}
