//! Per-row transaction boundary of a batch run.

use std::sync::Arc;

use anyhow::Result;
use batchflow_types::{AccessLevel, QueueUsage};
use tracing::{debug, warn};

use crate::db::DbHandle;
use crate::errors::{EngineError, EngineResult};
use crate::messaging::{SharedSession, UserTransactionManager};
use crate::runtime::Runtime;

/// Resources committed or rolled back together once per driver row.
///
/// With a user transaction manager the manager owns the boundary and the
/// database and queue sessions are left to it. Otherwise the run's database
/// handle and, for service-managed queues, its queue session are ended
/// directly.
pub(crate) struct RowBoundary {
    db: Option<DbHandle>,
    queue: Option<(SharedSession, QueueUsage)>,
    user: Option<Arc<dyn UserTransactionManager>>,
}

impl RowBoundary {
    pub(crate) fn open(
        runtime: &Runtime,
        access: AccessLevel,
        schema: Option<&str>,
        queue: Option<QueueUsage>,
        user_transaction: bool,
    ) -> EngineResult<RowBoundary> {
        let db = access
            .connection_level()
            .map(|level| DbHandle::open(runtime.driver(), level, schema.or(runtime.default_schema())))
            .transpose()?;
        let queue = match queue {
            Some(usage) => {
                let broker = runtime.broker().ok_or_else(|| {
                    EngineError::configuration("batch reads a queue but the runtime has no message broker")
                })?;
                Some((SharedSession::new(broker.borrow_session()?), usage))
            }
            None => None,
        };
        let user = if user_transaction {
            let manager = runtime.user_transactions().cloned().ok_or_else(|| {
                EngineError::configuration("batch uses user transactions but the runtime has no transaction manager")
            })?;
            Some(manager)
        } else {
            None
        };
        Ok(RowBoundary { db, queue, user })
    }

    pub(crate) fn db_mut(&mut self) -> Option<&mut DbHandle> {
        self.db.as_mut()
    }

    pub(crate) fn queue_session(&self) -> Option<SharedSession> {
        self.queue.as_ref().map(|(session, _)| session.clone())
    }

    pub(crate) fn begin(&mut self) -> Result<()> {
        if let Some(user) = &self.user {
            user.begin()?;
        }
        Ok(())
    }

    pub(crate) fn commit(&mut self) -> Result<()> {
        if let Some(user) = &self.user {
            return user.commit();
        }
        if let Some(db) = self.db.as_mut() {
            db.commit()?;
        }
        if let Some((session, QueueUsage::ServiceManaged)) = &self.queue {
            session.with(|session| session.commit())?;
        }
        Ok(())
    }

    pub(crate) fn rollback(&mut self) -> Result<()> {
        if let Some(user) = &self.user {
            return user.rollback();
        }
        if let Some(db) = self.db.as_mut() {
            db.rollback()?;
        }
        if let Some((session, QueueUsage::ServiceManaged)) = &self.queue {
            session.with(|session| session.rollback())?;
        }
        Ok(())
    }

    /// Ends the run: the connection is rolled back and closed, the queue
    /// session goes back to the broker.
    pub(crate) fn finish(self, runtime: &Runtime) -> Result<()> {
        if let Some((session, _)) = self.queue {
            match (session.into_inner(), runtime.broker()) {
                (Some(session), Some(broker)) => broker.return_session(session),
                _ => warn!("queue session still in use at end of batch run; not returned"),
            }
        }
        if let Some(db) = self.db {
            debug!(access = %db.access(), "closing batch connection");
            db.finish(false)?;
        }
        Ok(())
    }
}
