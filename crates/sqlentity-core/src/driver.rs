//! Driver boundary traits.
//!
//! Everything above this seam is backend-agnostic. A driver hands out
//! prepared statements; statements execute with positional parameters;
//! query results come back as cursors. All calls block the calling
//! thread until the server answers.

use crate::Result;
use crate::backend::Backend;
use crate::row::Row;
use crate::statement::StatementDesc;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Outcome of an insert/update/delete.
///
/// Unique-key violations are an expected condition in this system (the
/// counter bootstrap and user-visible duplicate keys both produce them),
/// so the execution path reports them as a value instead of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecOutcome {
    /// Statement ran; this many rows were affected.
    Rows(u64),
    /// Statement hit a unique-constraint violation and changed nothing.
    UniqueViolation,
}

impl ExecOutcome {
    /// Affected row count, treating a unique violation as zero rows.
    pub fn rows_affected(self) -> u64 {
        match self {
            ExecOutcome::Rows(n) => n,
            ExecOutcome::UniqueViolation => 0,
        }
    }

    pub fn is_unique_violation(self) -> bool {
        matches!(self, ExecOutcome::UniqueViolation)
    }
}

/// A live connection owned by a driver.
///
/// Implementations wrap whatever native handle the backend needs. They
/// are `Send` (a connection migrates between threads via the pool) but
/// not `Sync`: a connection serves one thread at a time.
pub trait Driver: Send {
    /// Which backend this driver talks to; selects the dialect table.
    fn backend(&self) -> Backend;

    /// Prepare a statement on this connection.
    fn prepare(&mut self, desc: &StatementDesc) -> Result<Box<dyn DriverStatement>>;

    /// Toggle autocommit.
    fn set_auto_commit(&mut self, on: bool) -> Result<()>;

    /// Commit the open transaction.
    fn commit(&mut self) -> Result<()>;

    /// Roll back the open transaction.
    fn rollback(&mut self) -> Result<()>;

    /// Round-trip liveness probe.
    fn ping(&mut self) -> Result<()>;

    /// Close the native connection. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// A prepared statement held by a driver connection.
pub trait DriverStatement: Send {
    /// Execute as a mutation; returns the affected row count.
    ///
    /// Unique violations surface as `Error::Query` with SQLSTATE 23505;
    /// the session layer converts them to [`ExecOutcome::UniqueViolation`].
    fn execute_update(&mut self, params: &[Value]) -> Result<u64>;

    /// Execute as a query; returns a cursor over the result set.
    fn execute_query(&mut self, params: &[Value]) -> Result<Box<dyn DriverCursor>>;
}

/// A positioned result set.
///
/// `previous` and `absolute` are honored only for statements registered
/// with a scrollable cursor mode; forward-only cursors answer them with
/// a consistency error.
pub trait DriverCursor: Send {
    /// Move to the first row. Returns false on an empty result.
    fn first(&mut self) -> Result<bool>;

    /// Advance one row. Returns false past the end.
    fn next(&mut self) -> Result<bool>;

    /// Move back one row. Returns false before the start.
    fn previous(&mut self) -> Result<bool>;

    /// Move to the 1-based row `pos`. Returns false if out of range.
    fn absolute(&mut self, pos: u64) -> Result<bool>;

    /// Read the row under the cursor.
    fn fetch(&mut self) -> Result<Row>;

    /// Release the result set. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Drains a cursor into a vector. Convenience for callers that want the
/// whole result set up front.
pub fn collect_rows(cursor: &mut dyn DriverCursor) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    while cursor.next()? {
        rows.push(cursor.fetch()?);
    }
    cursor.close()?;
    Ok(rows)
}

/// Factory for driver connections; the pool calls this to grow.
pub trait DriverFactory: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Driver>>;
}

impl<F> DriverFactory for F
where
    F: Fn() -> Result<Box<dyn Driver>> + Send + Sync,
{
    fn connect(&self) -> Result<Box<dyn Driver>> {
        self()
    }
}
