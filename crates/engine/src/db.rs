//! Database driver contract and the handle passed down through steps.
//!
//! Drivers are external collaborators. The engine only opens connections at
//! a requested access level, runs statements against them, and ends each
//! connection with exactly one commit or rollback.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use batchflow_types::{AccessLevel, DataSheet};
use tracing::debug;

use crate::context::ExecutionContext;

/// An open database connection with its own transaction.
pub trait Connection: Send {
    /// Runs an update statement and returns the affected row count.
    fn execute(&mut self, statement: &str, context: &ExecutionContext) -> Result<u64>;

    /// Runs a query and returns its rows.
    fn query(&mut self, statement: &str, context: &ExecutionContext) -> Result<DataSheet>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;
}

/// Opens connections. Shared by every invocation of a runtime.
pub trait DatabaseDriver: Send + Sync {
    fn open(&self, access: AccessLevel, schema: Option<&str>) -> Result<Box<dyn Connection>>;
}

/// A connection together with the access level and schema it was opened
/// for, so nested components can decide whether to reuse it.
pub struct DbHandle {
    access: AccessLevel,
    schema: Option<String>,
    connection: Box<dyn Connection>,
}

impl fmt::Debug for DbHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbHandle")
            .field("access", &self.access)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl DbHandle {
    pub fn open(driver: &dyn DatabaseDriver, access: AccessLevel, schema: Option<&str>) -> Result<DbHandle> {
        debug!(access = %access, schema = schema.unwrap_or("<default>"), "opening database connection");
        let connection = driver.open(access, schema)?;
        Ok(DbHandle {
            access,
            schema: schema.map(str::to_string),
            connection,
        })
    }

    pub fn access(&self) -> AccessLevel {
        self.access
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Whether work needing `required` on `schema` can run on this handle.
    /// A step that names no schema accepts any handle.
    pub fn satisfies(&self, required: AccessLevel, schema: Option<&str>) -> bool {
        let access_ok = match required {
            AccessLevel::ReadWrite => self.access.updates_database(),
            _ => true,
        };
        let schema_ok = schema.is_none() || schema == self.schema.as_deref();
        access_ok && schema_ok
    }

    pub fn execute(&mut self, statement: &str, context: &ExecutionContext) -> Result<u64> {
        self.connection.execute(statement, context)
    }

    pub fn query(&mut self, statement: &str, context: &ExecutionContext) -> Result<DataSheet> {
        self.connection.query(statement, context)
    }

    pub fn commit(&mut self) -> Result<()> {
        self.connection.commit()
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.connection.rollback()
    }

    /// Ends the handle's transaction: commit when `commit` is set, else rollback.
    pub fn finish(mut self, commit: bool) -> Result<()> {
        if commit { self.commit() } else { self.rollback() }
    }
}

/// Driver whose connections log statements and touch nothing. Queries
/// return empty sheets and updates affect zero rows.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDriver;

impl NoopDriver {
    pub fn shared() -> Arc<dyn DatabaseDriver> {
        Arc::new(NoopDriver)
    }
}

impl DatabaseDriver for NoopDriver {
    fn open(&self, access: AccessLevel, schema: Option<&str>) -> Result<Box<dyn Connection>> {
        Ok(Box::new(NoopConnection {
            access,
            schema: schema.map(str::to_string),
        }))
    }
}

struct NoopConnection {
    access: AccessLevel,
    schema: Option<String>,
}

impl Connection for NoopConnection {
    fn execute(&mut self, statement: &str, _context: &ExecutionContext) -> Result<u64> {
        debug!(access = %self.access, schema = ?self.schema, statement = %statement, "noop execute");
        Ok(0)
    }

    fn query(&mut self, statement: &str, _context: &ExecutionContext) -> Result<DataSheet> {
        debug!(access = %self.access, schema = ?self.schema, statement = %statement, "noop query");
        Ok(DataSheet::default())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}
