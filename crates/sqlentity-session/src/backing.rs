//! Connection backings: the capability seam between a logical
//! connection and whatever actually executes its work.
//!
//! A logical connection selects its [`Backing`] exactly once, at open
//! time. A [`LocalBacking`] checks physical connections out of a pool
//! and runs registered statements directly; a remote backing (in the
//! remote crate) serializes whole operations to a server-side peer.
//! Code above this seam never branches on the mode again: statement
//! execution is the local capability, [`Backing::forward`] the remote
//! one, and each backing answers the other with a consistency error.

use crate::entity::PersistState;
use serde::{Deserialize, Serialize};
use sqlentity_core::backend::Backend;
use sqlentity_core::driver::collect_rows;
use sqlentity_core::error::Error;
use sqlentity_core::row::{Row, RowSet};
use sqlentity_core::statement::{ConcurrencyMode, CursorMode, StatementId};
use sqlentity_core::value::Value;
use sqlentity_core::Result;
use sqlentity_pool::{Pool, PooledConn};

/// Entity operation forwarded to a remote peer as one unit.
///
/// The peer resolves `class` through its own entity registry and runs
/// the full operation (transaction bracket, counters, logging) on its
/// side; the reply carries the resulting state back.
#[derive(Debug, Clone)]
pub enum EntityOp {
    Select {
        class: &'static str,
        id: i64,
        locked: bool,
    },
    Insert {
        class: &'static str,
        state: PersistState,
        values: Vec<Value>,
    },
    Update {
        class: &'static str,
        state: PersistState,
        values: Vec<Value>,
    },
    Delete {
        class: &'static str,
        state: PersistState,
    },
    Save {
        class: &'static str,
        state: PersistState,
        values: Vec<Value>,
    },
    Sync {
        class: &'static str,
        state: PersistState,
        values: Vec<Value>,
    },
    DeleteAll {
        class: &'static str,
    },
    ReserveId {
        class: &'static str,
    },
}

/// Modification-counter operation forwarded to a remote peer.
#[derive(Debug, Clone)]
pub enum CounterOp {
    Bump {
        table: String,
        uses_table_serial: bool,
        optimize: bool,
    },
    Read {
        table: String,
    },
    ReadMaster,
}

/// Cursor positioning request, shared with the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Seek {
    First,
    Next,
    Previous,
    Absolute(u64),
}

/// An operation a remote backing carries to its peer.
#[derive(Debug, Clone)]
pub enum RemoteOp {
    Entity(EntityOp),
    Counter(CounterOp),
    CursorOpen {
        sql: String,
        cursor: CursorMode,
        concurrency: ConcurrencyMode,
        params: Vec<Value>,
    },
    CursorSeek {
        cursor: u64,
        seek: Seek,
    },
    CursorFetch {
        cursor: u64,
    },
    CursorClose {
        cursor: u64,
    },
}

/// Reply to a forwarded operation.
#[derive(Debug, Clone)]
pub enum OpReply {
    /// Mutation finished; `state` is the object state after the call.
    Done {
        ok: bool,
        unique_violation: bool,
        state: PersistState,
    },
    /// Select result.
    Fetched(Option<Row>),
    /// Row count (delete-all).
    Count(u64),
    /// Counter serial.
    Serial(i64),
    /// Reserved identity (already negated).
    Ident(i64),
    /// Opened cursor handle.
    Cursor(u64),
    /// Seek result.
    Positioned(bool),
    /// Fetched cursor row.
    Row(Row),
    /// Operation with no payload (cursor close).
    Unit,
}

impl OpReply {
    /// Consistency error for a reply that does not match the request.
    pub fn unexpected(self, expected: &'static str) -> Error {
        Error::consistency(format!("peer replied {self:?} where {expected} was expected"))
    }
}

/// What executes a logical connection's work.
///
/// Implementations are stateful: a backing owns at most one physical
/// connection (local) or one server session (remote) at a time.
pub trait Backing: Send {
    /// Dialect of the store behind this backing.
    fn backend(&self) -> Backend;

    /// True when operations are forwarded to a remote peer.
    fn is_remote(&self) -> bool;

    /// Establish the backing (probe the pool, or log in remotely).
    #[allow(clippy::result_large_err)]
    fn open(&mut self) -> Result<()>;

    /// Release everything held. Idempotent.
    #[allow(clippy::result_large_err)]
    fn close(&mut self) -> Result<()>;

    /// Server-side session id (remote) or the local instance number.
    #[allow(clippy::result_large_err)]
    fn connection_id(&mut self) -> Result<i64>;

    /// Produce an independent, already-open backing against the same
    /// store for a cloned logical connection. Shares the pool or the
    /// transport, never the transaction state.
    #[allow(clippy::result_large_err)]
    fn split(&mut self, instance: i64) -> Result<Box<dyn Backing>>;

    /// Enter manual-commit mode, holding the physical connection.
    #[allow(clippy::result_large_err)]
    fn begin(&mut self, name: &str) -> Result<()>;

    /// Commit and leave manual-commit mode.
    #[allow(clippy::result_large_err)]
    fn commit(&mut self) -> Result<()>;

    /// Roll back and leave manual-commit mode.
    #[allow(clippy::result_large_err)]
    fn rollback(&mut self) -> Result<()>;

    /// Run a registered mutation statement. `release_after` lets go of
    /// the physical connection once done (autocommit mode).
    ///
    /// Local capability; remote backings answer with a consistency
    /// error.
    #[allow(clippy::result_large_err)]
    fn execute_update(
        &mut self,
        stmt: StatementId,
        params: &[Value],
        release_after: bool,
    ) -> Result<u64>;

    /// Run a registered query statement, buffering the result.
    ///
    /// Local capability; remote backings answer with a consistency
    /// error.
    #[allow(clippy::result_large_err)]
    fn execute_query(
        &mut self,
        stmt: StatementId,
        params: &[Value],
        release_after: bool,
    ) -> Result<RowSet>;

    /// Carry a whole operation to the remote peer.
    ///
    /// Remote capability; local backings answer with a consistency
    /// error.
    #[allow(clippy::result_large_err)]
    fn forward(&mut self, op: RemoteOp) -> Result<OpReply>;
}

/// Pool-backed local execution.
///
/// The physical connection is held only while needed: for the duration
/// of one statement in autocommit mode, or from `begin` to
/// `commit`/`rollback` in a transaction. Attach/detach pairs bracket
/// every use, so the re-entrancy counting on the physical side stays
/// balanced however calls nest.
pub struct LocalBacking {
    pool: Pool,
    backend: Backend,
    instance: i64,
    active: Option<PooledConn>,
}

impl LocalBacking {
    pub fn new(pool: Pool, backend: Backend, instance: i64) -> Self {
        Self {
            pool,
            backend,
            instance,
            active: None,
        }
    }

    #[allow(clippy::result_large_err)]
    fn active(&mut self) -> Result<&mut PooledConn> {
        if self.active.is_none() {
            self.active = Some(self.pool.acquire()?);
        }
        match self.active.as_mut() {
            Some(conn) => Ok(conn),
            None => Err(Error::consistency("physical connection slot empty")),
        }
    }

    fn release_if_unattached(&mut self) {
        if let Some(conn) = &self.active {
            if !conn.is_attached() {
                self.active = None;
            }
        }
    }

    #[allow(clippy::result_large_err)]
    fn local_only(op: &RemoteOp) -> Error {
        Error::consistency(format!(
            "remote operation {op:?} invoked on a locally backed connection"
        ))
    }
}

impl Backing for LocalBacking {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn is_remote(&self) -> bool {
        false
    }

    fn open(&mut self) -> Result<()> {
        // Round trip through the pool so connectivity problems surface
        // here instead of on the first statement.
        let conn = self.pool.acquire()?;
        drop(conn);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the checkout returns (or discards) the physical
        // connection; the pool itself belongs to the database.
        self.active = None;
        Ok(())
    }

    fn connection_id(&mut self) -> Result<i64> {
        Ok(self.instance)
    }

    fn split(&mut self, instance: i64) -> Result<Box<dyn Backing>> {
        Ok(Box::new(LocalBacking::new(
            self.pool.clone(),
            self.backend,
            instance,
        )))
    }

    fn begin(&mut self, _name: &str) -> Result<()> {
        let instance = self.instance;
        let conn = self.active()?;
        conn.attach(instance)?;
        if let Err(e) = conn.set_auto_commit(false) {
            if let Err(detach) = conn.detach(instance) {
                tracing::warn!(error = %detach, "detach after failed begin");
            }
            self.release_if_unattached();
            return Err(e);
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let instance = self.instance;
        let Some(conn) = self.active.as_mut() else {
            return Err(Error::consistency("commit without a held connection"));
        };
        conn.commit()?;
        conn.set_auto_commit(true)?;
        conn.detach(instance)?;
        self.release_if_unattached();
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        let instance = self.instance;
        let Some(conn) = self.active.as_mut() else {
            return Err(Error::consistency("rollback without a held connection"));
        };
        let rolled_back = conn.rollback();
        let restored = match &rolled_back {
            Ok(()) => conn.set_auto_commit(true),
            // The session state is unknown; the pool must not reuse it.
            Err(_) => {
                conn.mark_dead();
                Ok(())
            }
        };
        if let Err(e) = conn.detach(instance) {
            tracing::warn!(error = %e, "detach during rollback");
        }
        self.release_if_unattached();
        rolled_back?;
        restored
    }

    fn execute_update(
        &mut self,
        stmt: StatementId,
        params: &[Value],
        release_after: bool,
    ) -> Result<u64> {
        let instance = self.instance;
        let conn = self.active()?;
        conn.attach(instance)?;
        let result = conn.execute_update(stmt, params);
        if let Err(e) = conn.detach(instance) {
            tracing::warn!(error = %e, "detach after statement");
        }
        if release_after {
            self.release_if_unattached();
        }
        result
    }

    fn execute_query(
        &mut self,
        stmt: StatementId,
        params: &[Value],
        release_after: bool,
    ) -> Result<RowSet> {
        let instance = self.instance;
        let conn = self.active()?;
        conn.attach(instance)?;
        let result = conn
            .execute_query(stmt, params)
            .and_then(|mut cursor| collect_rows(cursor.as_mut()))
            .map(RowSet::new);
        if let Err(e) = conn.detach(instance) {
            tracing::warn!(error = %e, "detach after statement");
        }
        if release_after {
            self.release_if_unattached();
        }
        result
    }

    fn forward(&mut self, op: RemoteOp) -> Result<OpReply> {
        Err(Self::local_only(&op))
    }
}

impl std::fmt::Debug for LocalBacking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBacking")
            .field("backend", &self.backend)
            .field("instance", &self.instance)
            .field("holding", &self.active.is_some())
            .finish()
    }
}
