//! The client side of remote sessions.
//!
//! A [`RemoteBacking`] logs in over a [`Transport`] and carries every
//! forwarded operation to the server as one request, so a remotely
//! backed logical connection behaves like a local one, entity
//! operations and the transaction bracket included. Statement execution
//! stays a local capability: the only way a query reaches the server is
//! as a [`RemoteCursor`], which scrolls a server-side result set by
//! handle.

use crate::protocol::{Request, Response, WireRow};
use crate::transport::Transport;
use sqlentity_core::Result;
use sqlentity_core::backend::Backend;
use sqlentity_core::config::ConnectConfig;
use sqlentity_core::error::{ConfigError, Error, RemoteError};
use sqlentity_core::row::{Row, RowSet};
use sqlentity_core::statement::{StatementDesc, StatementId};
use sqlentity_core::value::Value;
use sqlentity_session::{Backing, CounterOp, EntityOp, LogicalConnection, OpReply, RemoteOp, Seek};
use std::sync::Arc;

/// Transport-backed execution.
///
/// Holds a server-side session id from `open` to `close`. Work arrives
/// at the server as whole operations through [`Backing::forward`] and
/// runs there on a server-side logical connection, which is where the
/// transaction bracket, the counters and the modification log live.
pub struct RemoteBacking {
    transport: Arc<dyn Transport>,
    config: ConnectConfig,
    backend: Backend,
    session: Option<i64>,
}

impl RemoteBacking {
    /// A backing that logs in over `transport` when opened.
    ///
    /// `backend` names the dialect this connection's statements were
    /// generated for; login verifies the server speaks the same one.
    pub fn new(transport: Arc<dyn Transport>, config: ConnectConfig, backend: Backend) -> Self {
        Self {
            transport,
            config,
            backend,
            session: None,
        }
    }

    #[allow(clippy::result_large_err)]
    fn session(&self) -> Result<i64> {
        self.session
            .ok_or_else(|| Error::consistency("remote backing is not logged in"))
    }

    /// One round trip, with server faults unfolded into local errors.
    #[allow(clippy::result_large_err)]
    fn call(&self, request: Request) -> Result<Response> {
        match self.transport.call(request)? {
            Response::Failed(fault) => Err(fault.into_error()),
            reply => Ok(reply),
        }
    }

    fn remote_only(stmt: StatementId) -> Error {
        Error::consistency(format!(
            "statement {stmt:?} executed locally on a remotely backed connection"
        ))
    }
}

impl Backing for RemoteBacking {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn open(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let reply = self.call(Request::Login {
            target: self.config.target.clone(),
            user: self.config.user.clone(),
            password: self.config.password.clone(),
            application: self.config.application_name.clone(),
        })?;
        match reply {
            Response::LoggedIn { session, backend } => {
                if backend != self.backend {
                    // The server already opened a session; hand it back
                    // before refusing.
                    if let Err(e) = self.call(Request::Logout { session }) {
                        tracing::debug!(error = %e, "logout after backend mismatch");
                    }
                    return Err(Error::Config(ConfigError {
                        message: format!(
                            "server speaks {backend:?} but this connection was built for {:?}",
                            self.backend
                        ),
                    }));
                }
                tracing::debug!(session, target = %self.config.target, "remote login");
                self.session = Some(session);
                Ok(())
            }
            other => Err(out_of_protocol(&other, "LoggedIn")),
        }
    }

    fn close(&mut self) -> Result<()> {
        // Cleared first so close stays idempotent even when the logout
        // call itself fails.
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        match self.call(Request::Logout { session })? {
            Response::LoggedOut => {
                tracing::debug!(session, "remote logout");
                Ok(())
            }
            other => Err(out_of_protocol(&other, "LoggedOut")),
        }
    }

    fn connection_id(&mut self) -> Result<i64> {
        let session = self.session()?;
        match self.call(Request::ConnectionId { session })? {
            Response::ConnectionId { id } => Ok(id),
            other => Err(out_of_protocol(&other, "ConnectionId")),
        }
    }

    fn split(&mut self, _instance: i64) -> Result<Box<dyn Backing>> {
        // The cloning connection takes the backing as handed back, so
        // the twin performs its own login here.
        let mut twin = RemoteBacking::new(
            Arc::clone(&self.transport),
            self.config.clone(),
            self.backend,
        );
        twin.open()?;
        Ok(Box::new(twin))
    }

    fn begin(&mut self, name: &str) -> Result<()> {
        let session = self.session()?;
        match self.call(Request::Begin {
            session,
            name: name.to_string(),
        })? {
            Response::Ok => Ok(()),
            other => Err(out_of_protocol(&other, "Ok")),
        }
    }

    fn commit(&mut self) -> Result<()> {
        let session = self.session()?;
        match self.call(Request::Commit { session })? {
            Response::Ok => Ok(()),
            other => Err(out_of_protocol(&other, "Ok")),
        }
    }

    fn rollback(&mut self) -> Result<()> {
        let session = self.session()?;
        match self.call(Request::Rollback { session })? {
            Response::Ok => Ok(()),
            other => Err(out_of_protocol(&other, "Ok")),
        }
    }

    fn execute_update(
        &mut self,
        stmt: StatementId,
        _params: &[Value],
        _release_after: bool,
    ) -> Result<u64> {
        Err(Self::remote_only(stmt))
    }

    fn execute_query(
        &mut self,
        stmt: StatementId,
        _params: &[Value],
        _release_after: bool,
    ) -> Result<RowSet> {
        Err(Self::remote_only(stmt))
    }

    fn forward(&mut self, op: RemoteOp) -> Result<OpReply> {
        let session = self.session()?;
        let reply = self.call(request_of(session, op))?;
        reply_of(reply)
    }
}

impl std::fmt::Debug for RemoteBacking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBacking")
            .field("target", &self.config.target)
            .field("backend", &self.backend)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// The wire request for a forwarded operation.
fn request_of(session: i64, op: RemoteOp) -> Request {
    match op {
        RemoteOp::Entity(op) => match op {
            EntityOp::Select { class, id, locked } => Request::Select {
                session,
                class: class.to_string(),
                id,
                locked,
            },
            EntityOp::Insert {
                class,
                state,
                values,
            } => Request::Insert {
                session,
                class: class.to_string(),
                state,
                values,
            },
            EntityOp::Update {
                class,
                state,
                values,
            } => Request::Update {
                session,
                class: class.to_string(),
                state,
                values,
            },
            EntityOp::Delete { class, state } => Request::Delete {
                session,
                class: class.to_string(),
                state,
            },
            EntityOp::Save {
                class,
                state,
                values,
            } => Request::Save {
                session,
                class: class.to_string(),
                state,
                values,
            },
            EntityOp::Sync {
                class,
                state,
                values,
            } => Request::Sync {
                session,
                class: class.to_string(),
                state,
                values,
            },
            EntityOp::DeleteAll { class } => Request::DeleteAll {
                session,
                class: class.to_string(),
            },
            EntityOp::ReserveId { class } => Request::ReserveId {
                session,
                class: class.to_string(),
            },
        },
        RemoteOp::Counter(op) => match op {
            CounterOp::Bump {
                table,
                uses_table_serial,
                optimize,
            } => Request::CounterBump {
                session,
                table,
                uses_table_serial,
                optimize,
            },
            CounterOp::Read { table } => Request::CounterRead { session, table },
            CounterOp::ReadMaster => Request::MasterRead { session },
        },
        RemoteOp::CursorOpen {
            sql,
            cursor,
            concurrency,
            params,
        } => Request::CursorOpen {
            session,
            sql,
            cursor,
            concurrency,
            params,
        },
        RemoteOp::CursorSeek { cursor, seek } => Request::CursorSeek {
            session,
            cursor,
            seek,
        },
        RemoteOp::CursorFetch { cursor } => Request::CursorFetch { session, cursor },
        RemoteOp::CursorClose { cursor } => Request::CursorClose { session, cursor },
    }
}

/// Map a reply back onto the backing contract.
#[allow(clippy::result_large_err)]
fn reply_of(reply: Response) -> Result<OpReply> {
    match reply {
        Response::Done { state } => Ok(OpReply::Done {
            ok: true,
            unique_violation: false,
            state,
        }),
        Response::Denied {
            unique_violation,
            state,
        } => Ok(OpReply::Done {
            ok: false,
            unique_violation,
            state,
        }),
        Response::Row { row } => Ok(OpReply::Fetched(row.map(WireRow::into_row))),
        Response::CursorRow { row } => Ok(OpReply::Row(row.into_row())),
        Response::Count { rows } => Ok(OpReply::Count(rows)),
        Response::Serial { serial } => Ok(OpReply::Serial(serial)),
        Response::Ident { id } => Ok(OpReply::Ident(id)),
        Response::Cursor { cursor } => Ok(OpReply::Cursor(cursor)),
        Response::Positioned { at_row } => Ok(OpReply::Positioned(at_row)),
        Response::Ok => Ok(OpReply::Unit),
        other => Err(out_of_protocol(&other, "an operation reply")),
    }
}

fn out_of_protocol(reply: &Response, expected: &'static str) -> Error {
    Error::Remote(RemoteError {
        message: format!("server replied {reply:?} where {expected} was expected"),
        source: None,
    })
}

/// A scrollable result set living on the server.
///
/// Opened from a statement description; rows are fetched one at a time
/// after an explicit positioning call, mirroring the local `RowSet`
/// surface. Dropping the cursor releases the server-side handle.
pub struct RemoteCursor<'a> {
    conn: &'a mut LogicalConnection,
    handle: u64,
    open: bool,
}

impl<'a> RemoteCursor<'a> {
    /// Open a cursor over `desc` with the given bind parameters.
    #[allow(clippy::result_large_err)]
    pub fn open(
        conn: &'a mut LogicalConnection,
        desc: StatementDesc,
        params: &[Value],
    ) -> Result<Self> {
        let reply = conn.forward(RemoteOp::CursorOpen {
            sql: desc.sql,
            cursor: desc.cursor,
            concurrency: desc.concurrency,
            params: params.to_vec(),
        })?;
        match reply {
            OpReply::Cursor(handle) => Ok(Self {
                conn,
                handle,
                open: true,
            }),
            other => Err(other.unexpected("a cursor handle")),
        }
    }

    /// Server-side cursor handle.
    pub fn handle(&self) -> u64 {
        self.handle
    }

    #[allow(clippy::result_large_err)]
    fn seek(&mut self, seek: Seek) -> Result<bool> {
        let reply = self.conn.forward(RemoteOp::CursorSeek {
            cursor: self.handle,
            seek,
        })?;
        match reply {
            OpReply::Positioned(at_row) => Ok(at_row),
            other => Err(other.unexpected("a seek result")),
        }
    }

    /// Position on the first row. `false` when the set is empty.
    #[allow(clippy::result_large_err)]
    pub fn first(&mut self) -> Result<bool> {
        self.seek(Seek::First)
    }

    /// Advance one row.
    #[allow(clippy::result_large_err)]
    pub fn next(&mut self) -> Result<bool> {
        self.seek(Seek::Next)
    }

    /// Step back one row.
    #[allow(clippy::result_large_err)]
    pub fn previous(&mut self) -> Result<bool> {
        self.seek(Seek::Previous)
    }

    /// Position on a 1-based row number.
    #[allow(clippy::result_large_err)]
    pub fn absolute(&mut self, row: u64) -> Result<bool> {
        self.seek(Seek::Absolute(row))
    }

    /// The row under the current position.
    #[allow(clippy::result_large_err)]
    pub fn fetch(&mut self) -> Result<Row> {
        let reply = self.conn.forward(RemoteOp::CursorFetch {
            cursor: self.handle,
        })?;
        match reply {
            OpReply::Row(row) => Ok(row),
            other => Err(other.unexpected("a cursor row")),
        }
    }

    /// Release the server-side handle. Runs from drop if not called.
    #[allow(clippy::result_large_err)]
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        match self.conn.forward(RemoteOp::CursorClose {
            cursor: self.handle,
        })? {
            OpReply::Unit => Ok(()),
            other => Err(other.unexpected("a close acknowledgement")),
        }
    }
}

impl Drop for RemoteCursor<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.close() {
                tracing::debug!(cursor = self.handle, error = %e, "cursor close in drop");
            }
        }
    }
}
