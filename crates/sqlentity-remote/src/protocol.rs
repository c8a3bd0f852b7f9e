//! The session wire contract.
//!
//! One [`Request`] per remotely-invoked operation, one [`Response`] per
//! reply shape. Values, persistence state and cursor positioning reuse
//! the serde representations of the core types; rows cross the wire as
//! flat [`WireRow`]s because the in-memory row shares its column
//! metadata and a transport has no use for that sharing.
//!
//! Errors never travel as serialized error types. The server folds any
//! failure into a [`Fault`] that keeps the family a caller branches on
//! (authentication, consistency, everything else) and the client
//! rebuilds a local error from it.

use serde::{Deserialize, Serialize};
use sqlentity_core::Result;
use sqlentity_core::backend::Backend;
use sqlentity_core::error::{ConnectionError, ConnectionErrorKind, Error, RemoteError};
use sqlentity_core::row::Row;
use sqlentity_core::statement::{ConcurrencyMode, CursorMode};
use sqlentity_core::value::Value;
use sqlentity_session::{PersistState, Seek};

/// A client-to-server call.
///
/// Every request except `Login` names the server session it runs on.
/// Mutation requests (`Insert` through `DeleteAll`, `CounterBump`) are
/// not retry-safe: after an ambiguous transport failure the operation
/// may or may not have committed, and a transport must surface the
/// failure instead of resending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Login {
        target: String,
        user: String,
        password: Option<String>,
        application: Option<String>,
    },
    Logout {
        session: i64,
    },
    ConnectionId {
        session: i64,
    },
    Begin {
        session: i64,
        name: String,
    },
    Commit {
        session: i64,
    },
    Rollback {
        session: i64,
    },
    Select {
        session: i64,
        class: String,
        id: i64,
        locked: bool,
    },
    Insert {
        session: i64,
        class: String,
        state: PersistState,
        values: Vec<Value>,
    },
    Update {
        session: i64,
        class: String,
        state: PersistState,
        values: Vec<Value>,
    },
    Delete {
        session: i64,
        class: String,
        state: PersistState,
    },
    Save {
        session: i64,
        class: String,
        state: PersistState,
        values: Vec<Value>,
    },
    Sync {
        session: i64,
        class: String,
        state: PersistState,
        values: Vec<Value>,
    },
    DeleteAll {
        session: i64,
        class: String,
    },
    ReserveId {
        session: i64,
        class: String,
    },
    CounterBump {
        session: i64,
        table: String,
        uses_table_serial: bool,
        optimize: bool,
    },
    CounterRead {
        session: i64,
        table: String,
    },
    MasterRead {
        session: i64,
    },
    CursorOpen {
        session: i64,
        sql: String,
        cursor: CursorMode,
        concurrency: ConcurrencyMode,
        params: Vec<Value>,
    },
    CursorSeek {
        session: i64,
        cursor: u64,
        seek: Seek,
    },
    CursorFetch {
        session: i64,
        cursor: u64,
    },
    CursorClose {
        session: i64,
        cursor: u64,
    },
}

impl Request {
    /// Short operation name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Request::Login { .. } => "login",
            Request::Logout { .. } => "logout",
            Request::ConnectionId { .. } => "connection-id",
            Request::Begin { .. } => "begin",
            Request::Commit { .. } => "commit",
            Request::Rollback { .. } => "rollback",
            Request::Select { .. } => "select",
            Request::Insert { .. } => "insert",
            Request::Update { .. } => "update",
            Request::Delete { .. } => "delete",
            Request::Save { .. } => "save",
            Request::Sync { .. } => "sync",
            Request::DeleteAll { .. } => "delete-all",
            Request::ReserveId { .. } => "reserve-id",
            Request::CounterBump { .. } => "counter-bump",
            Request::CounterRead { .. } => "counter-read",
            Request::MasterRead { .. } => "master-read",
            Request::CursorOpen { .. } => "cursor-open",
            Request::CursorSeek { .. } => "cursor-seek",
            Request::CursorFetch { .. } => "cursor-fetch",
            Request::CursorClose { .. } => "cursor-close",
        }
    }

    /// The session this request runs on, `None` for `Login`.
    pub fn session(&self) -> Option<i64> {
        match self {
            Request::Login { .. } => None,
            Request::Logout { session }
            | Request::ConnectionId { session }
            | Request::Begin { session, .. }
            | Request::Commit { session }
            | Request::Rollback { session }
            | Request::Select { session, .. }
            | Request::Insert { session, .. }
            | Request::Update { session, .. }
            | Request::Delete { session, .. }
            | Request::Save { session, .. }
            | Request::Sync { session, .. }
            | Request::DeleteAll { session, .. }
            | Request::ReserveId { session, .. }
            | Request::CounterBump { session, .. }
            | Request::CounterRead { session, .. }
            | Request::MasterRead { session }
            | Request::CursorOpen { session, .. }
            | Request::CursorSeek { session, .. }
            | Request::CursorFetch { session, .. }
            | Request::CursorClose { session, .. } => Some(*session),
        }
    }
}

/// A server-to-client reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Login accepted; `backend` is the dialect of the server's store.
    LoggedIn { session: i64, backend: Backend },
    LoggedOut,
    ConnectionId { id: i64 },
    /// Operation with no payload finished (begin, commit, rollback,
    /// cursor close).
    Ok,
    /// Mutation succeeded; `state` is the object state afterwards.
    Done { state: PersistState },
    /// Mutation reported the expected kind of failure: an optimistic
    /// race lost or, when flagged, a unique violation. The client turns
    /// this into `Ok(false)` plus the sticky flag, never an error.
    Denied {
        unique_violation: bool,
        state: PersistState,
    },
    /// Entity select result.
    Row { row: Option<WireRow> },
    /// The row under an open cursor.
    CursorRow { row: WireRow },
    Count { rows: u64 },
    Serial { serial: i64 },
    /// Reserved identity, already negated.
    Ident { id: i64 },
    /// Handle of a freshly opened server-side cursor.
    Cursor { cursor: u64 },
    Positioned { at_row: bool },
    /// The operation failed with a real error.
    Failed(Fault),
}

/// A row flattened for transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRow {
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

impl WireRow {
    pub fn from_row(row: &Row) -> Self {
        Self {
            columns: row.column_names().map(String::from).collect(),
            values: row.values().cloned().collect(),
        }
    }

    pub fn into_row(self) -> Row {
        Row::new(self.columns, self.values)
    }
}

/// A server-side failure reduced to what the client can act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// The server refused the credentials.
    pub authentication: bool,
    /// Misuse of the protocol or the connection state machine.
    pub consistency: bool,
    pub message: String,
}

impl Fault {
    /// Fold a server-side error into its wire form.
    pub fn of(err: &Error) -> Self {
        Self {
            authentication: matches!(
                err,
                Error::Connection(c) if c.kind == ConnectionErrorKind::Authentication
            ),
            consistency: matches!(err, Error::Consistency(_)),
            message: err.to_string(),
        }
    }

    /// Rebuild a client-side error in the local vocabulary.
    pub fn into_error(self) -> Error {
        if self.authentication {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Authentication,
                message: self.message,
                source: None,
            })
        } else if self.consistency {
            Error::Consistency(self.message)
        } else {
            Error::Remote(RemoteError {
                message: self.message,
                source: None,
            })
        }
    }
}

#[allow(clippy::result_large_err)]
pub fn encode_request(request: &Request) -> Result<String> {
    serde_json::to_string(request).map_err(|e| Error::Serde(e.to_string()))
}

#[allow(clippy::result_large_err)]
pub fn decode_request(text: &str) -> Result<Request> {
    serde_json::from_str(text).map_err(|e| Error::Serde(e.to_string()))
}

#[allow(clippy::result_large_err)]
pub fn encode_response(response: &Response) -> Result<String> {
    serde_json::to_string(response).map_err(|e| Error::Serde(e.to_string()))
}

#[allow(clippy::result_large_err)]
pub fn decode_response(text: &str) -> Result<Response> {
    serde_json::from_str(text).map_err(|e| Error::Serde(e.to_string()))
}
