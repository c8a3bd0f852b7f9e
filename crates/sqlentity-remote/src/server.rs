//! The server side of remote sessions.
//!
//! A [`SessionServer`] binds each logged-in client to one server-side
//! [`LogicalConnection`] and runs every request through the same
//! descriptor-driven operations a local caller would use, so remote
//! mutations get the full treatment: transaction bracket, counters,
//! modification log. Sessions are independently locked; concurrent
//! clients only contend on the short map lookup.
//!
//! How a login becomes a connection is the embedder's business: the
//! server is built around a connector callback that receives the
//! credentials and produces the connection, and may refuse them with an
//! authentication error.

use crate::protocol::{Fault, Request, Response, WireRow};
use parking_lot::Mutex;
use sqlentity_core::Result;
use sqlentity_core::config::ConnectConfig;
use sqlentity_core::error::Error;
use sqlentity_core::row::RowSet;
use sqlentity_core::statement::StatementDesc;
use sqlentity_session::{
    EntityDescriptor, LogicalConnection, PersistState, Seek, count_modification, delete_all_rows,
    delete_object, fetch_row, insert_values, reserve_ident, save_values, select_master_serial,
    select_modification, sync_values, update_values,
};
use std::collections::HashMap;
use std::sync::Arc;

type Connector = Box<dyn Fn(&ConnectConfig) -> Result<LogicalConnection> + Send + Sync>;

/// One client's server-side state.
struct Session {
    conn: LogicalConnection,
    /// The `started` token of the client's open transaction bracket.
    tx_started: bool,
    cursors: HashMap<u64, RowSet>,
    next_cursor: u64,
}

/// Dispatcher for the session wire contract.
pub struct SessionServer {
    connector: Connector,
    sessions: Mutex<HashMap<i64, Arc<Mutex<Session>>>>,
}

impl SessionServer {
    /// Build a server around a login connector.
    ///
    /// The connector receives the credentials from each `Login` request
    /// and either produces a fresh logical connection or refuses with
    /// an error (an authentication-kind connection error reaches the
    /// client as a credentials rejection).
    pub fn new(
        connector: impl Fn(&ConnectConfig) -> Result<LogicalConnection> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector: Box::new(connector),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Run one request to completion. Failures come back as
    /// [`Response::Failed`]; this never panics the transport.
    pub fn dispatch(&self, request: Request) -> Response {
        let label = request.label();
        let session = request.session();
        match self.try_dispatch(request) {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(op = label, session, error = %err, "request failed");
                Response::Failed(Fault::of(&err))
            }
        }
    }

    #[allow(clippy::result_large_err, clippy::too_many_lines)]
    fn try_dispatch(&self, request: Request) -> Result<Response> {
        match request {
            Request::Login {
                target,
                user,
                password,
                application,
            } => {
                let mut config = ConnectConfig::new(target, user.as_str());
                config.password = password;
                config.application_name = application;
                let mut conn = (self.connector)(&config)?;
                let session = conn.connection_id()?;
                let backend = conn.backend();
                self.sessions.lock().insert(
                    session,
                    Arc::new(Mutex::new(Session {
                        conn,
                        tx_started: false,
                        cursors: HashMap::new(),
                        next_cursor: 0,
                    })),
                );
                tracing::info!(session, user = %user, "remote session opened");
                Ok(Response::LoggedIn { session, backend })
            }

            Request::Logout { session } => {
                let Some(handle) = self.sessions.lock().remove(&session) else {
                    return Err(unknown_session(session));
                };
                let mut held = handle.lock();
                held.cursors.clear();
                held.conn.close()?;
                tracing::info!(session, "remote session closed");
                Ok(Response::LoggedOut)
            }

            Request::ConnectionId { session } => self.with_session(session, |s| {
                let id = s.conn.connection_id()?;
                Ok(Response::ConnectionId { id })
            }),

            Request::Begin { session, name } => self.with_session(session, |s| {
                if s.tx_started {
                    return Err(Error::consistency(
                        "transaction already open on this session",
                    ));
                }
                if !s.conn.begin(&name)? {
                    return Err(Error::consistency(
                        "server connection is unexpectedly inside a transaction",
                    ));
                }
                s.tx_started = true;
                Ok(Response::Ok)
            }),

            Request::Commit { session } => self.with_session(session, |s| {
                if !s.tx_started {
                    return Err(Error::consistency("commit outside a transaction"));
                }
                // A failed commit has already rolled itself back, so the
                // bracket is over either way.
                s.tx_started = false;
                s.conn.commit(true)?;
                Ok(Response::Ok)
            }),

            Request::Rollback { session } => self.with_session(session, |s| {
                if !s.tx_started {
                    return Err(Error::consistency("rollback outside a transaction"));
                }
                s.tx_started = false;
                s.conn.rollback(true)?;
                Ok(Response::Ok)
            }),

            Request::Select {
                session,
                class,
                id,
                locked,
            } => self.with_session(session, |s| {
                let desc = descriptor(&s.conn, &class)?;
                let row = fetch_row(&mut s.conn, &desc, id, locked)?;
                Ok(Response::Row {
                    row: row.map(|r| WireRow::from_row(&r)),
                })
            }),

            Request::Insert {
                session,
                class,
                mut state,
                values,
            } => self.with_session(session, |s| {
                let desc = descriptor(&s.conn, &class)?;
                let ok = insert_values(&mut s.conn, &desc, &mut state, &values)?;
                Ok(done_reply(&mut s.conn, ok, state))
            }),

            Request::Update {
                session,
                class,
                mut state,
                values,
            } => self.with_session(session, |s| {
                let desc = descriptor(&s.conn, &class)?;
                let ok = update_values(&mut s.conn, &desc, &mut state, &values)?;
                Ok(done_reply(&mut s.conn, ok, state))
            }),

            Request::Delete {
                session,
                class,
                mut state,
            } => self.with_session(session, |s| {
                let desc = descriptor(&s.conn, &class)?;
                let ok = delete_object(&mut s.conn, &desc, &mut state)?;
                Ok(done_reply(&mut s.conn, ok, state))
            }),

            Request::Save {
                session,
                class,
                mut state,
                values,
            } => self.with_session(session, |s| {
                let desc = descriptor(&s.conn, &class)?;
                let ok = save_values(&mut s.conn, &desc, &mut state, &values)?;
                Ok(done_reply(&mut s.conn, ok, state))
            }),

            Request::Sync {
                session,
                class,
                mut state,
                values,
            } => self.with_session(session, |s| {
                let desc = descriptor(&s.conn, &class)?;
                let ok = sync_values(&mut s.conn, &desc, &mut state, &values)?;
                Ok(done_reply(&mut s.conn, ok, state))
            }),

            Request::DeleteAll { session, class } => self.with_session(session, |s| {
                let desc = descriptor(&s.conn, &class)?;
                let rows = delete_all_rows(&mut s.conn, &desc)?;
                Ok(Response::Count { rows })
            }),

            Request::ReserveId { session, class } => self.with_session(session, |s| {
                let desc = descriptor(&s.conn, &class)?;
                let mut state = PersistState::default();
                reserve_ident(&mut s.conn, &desc, &mut state)?;
                Ok(Response::Ident { id: state.id })
            }),

            Request::CounterBump {
                session,
                table,
                uses_table_serial,
                optimize,
            } => self.with_session(session, |s| {
                let serial = count_modification(&mut s.conn, &table, uses_table_serial, optimize)?;
                Ok(Response::Serial { serial })
            }),

            Request::CounterRead { session, table } => self.with_session(session, |s| {
                let serial = select_modification(&mut s.conn, &table)?;
                Ok(Response::Serial { serial })
            }),

            Request::MasterRead { session } => self.with_session(session, |s| {
                let serial = select_master_serial(&mut s.conn)?;
                Ok(Response::Serial { serial })
            }),

            Request::CursorOpen {
                session,
                sql,
                cursor,
                concurrency,
                params,
            } => self.with_session(session, |s| {
                let stmt = s.conn.prepare_statement(
                    StatementDesc::new(sql)
                        .with_cursor(cursor)
                        .with_concurrency(concurrency),
                );
                let rows = s.conn.execute_query(stmt, &params)?;
                s.next_cursor += 1;
                let handle = s.next_cursor;
                tracing::debug!(session, cursor = handle, rows = rows.len(), "cursor opened");
                s.cursors.insert(handle, rows);
                Ok(Response::Cursor { cursor: handle })
            }),

            Request::CursorSeek {
                session,
                cursor,
                seek,
            } => self.with_session(session, |s| {
                let rows = s
                    .cursors
                    .get_mut(&cursor)
                    .ok_or_else(|| unknown_cursor(cursor))?;
                let at_row = match seek {
                    Seek::First => rows.first(),
                    Seek::Next => rows.next(),
                    Seek::Previous => rows.previous(),
                    Seek::Absolute(row) => rows.absolute(row),
                };
                Ok(Response::Positioned { at_row })
            }),

            Request::CursorFetch { session, cursor } => self.with_session(session, |s| {
                let rows = s
                    .cursors
                    .get_mut(&cursor)
                    .ok_or_else(|| unknown_cursor(cursor))?;
                let row = rows.fetch()?;
                Ok(Response::CursorRow {
                    row: WireRow::from_row(row),
                })
            }),

            Request::CursorClose { session, cursor } => self.with_session(session, |s| {
                // Closing an already-closed cursor is tolerated.
                s.cursors.remove(&cursor);
                Ok(Response::Ok)
            }),
        }
    }

    #[allow(clippy::result_large_err)]
    fn with_session<F>(&self, id: i64, op: F) -> Result<Response>
    where
        F: FnOnce(&mut Session) -> Result<Response>,
    {
        let handle = self
            .sessions
            .lock()
            .get(&id)
            .map(Arc::clone)
            .ok_or_else(|| unknown_session(id))?;
        let mut session = handle.lock();
        op(&mut session)
    }
}

impl std::fmt::Debug for SessionServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionServer")
            .field("sessions", &self.session_count())
            .finish()
    }
}

#[allow(clippy::result_large_err)]
fn descriptor(conn: &LogicalConnection, class: &str) -> Result<Arc<EntityDescriptor>> {
    conn.entities().by_class(class).ok_or_else(|| {
        Error::consistency(format!(
            "entity class '{class}' is not registered on the server"
        ))
    })
}

/// Mutation reply: success carries the resulting state, the expected
/// failures come back as `Denied` with the server's sticky flag folded
/// in.
fn done_reply(conn: &mut LogicalConnection, ok: bool, state: PersistState) -> Response {
    if ok {
        Response::Done { state }
    } else {
        Response::Denied {
            unique_violation: conn.take_unique_violation(),
            state,
        }
    }
}

fn unknown_session(id: i64) -> Error {
    Error::consistency(format!("unknown session {id}"))
}

fn unknown_cursor(handle: u64) -> Error {
    Error::consistency(format!("unknown cursor {handle}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlentity_core::backend::Backend;
    use sqlentity_core::context::Context;
    use sqlentity_core::error::{ConnectionError, ConnectionErrorKind};
    use sqlentity_core::value::Value;
    use sqlentity_mem::MemDatabase;
    use sqlentity_pool::{Pool, PoolConfig};
    use sqlentity_session::{
        ColumnDef, ColumnType, Entity, EntityRegistry, IdSourceFactories, create_entity_table,
        create_support_tables,
    };

    #[derive(Debug, Default)]
    struct Account {
        state: PersistState,
        name: String,
        balance: i64,
    }

    const ACCOUNT_COLUMNS: &[ColumnDef] = &[
        ColumnDef::new("name", ColumnType::Text),
        ColumnDef::new("balance", ColumnType::BigInt),
    ];

    impl Entity for Account {
        const TABLE: &'static str = "account";

        fn columns() -> &'static [ColumnDef] {
            ACCOUNT_COLUMNS
        }

        fn state(&self) -> &PersistState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut PersistState {
            &mut self.state
        }

        fn column_values(&self) -> Vec<Value> {
            vec![
                Value::Text(self.name.clone()),
                Value::BigInt(self.balance),
            ]
        }

        fn from_row(row: &sqlentity_core::row::Row) -> Result<Self> {
            Ok(Self {
                state: PersistState::default(),
                name: row.get_named("name")?,
                balance: row.get_named("balance")?,
            })
        }
    }

    fn test_server() -> Arc<SessionServer> {
        let db = MemDatabase::new();
        let context = Context::new();
        let entities = EntityRegistry::new(Arc::clone(&context), Backend::Memory);
        let factories = IdSourceFactories::new();
        let pool = Pool::new(
            PoolConfig::new(4),
            Box::new(db.factory()),
            Arc::clone(&context),
        )
        .unwrap();

        let desc = entities.descriptor::<Account>().unwrap();
        let mut boot = LogicalConnection::local(
            Arc::clone(&context),
            Arc::clone(&entities),
            Arc::clone(&factories),
            ConnectConfig::new("mem://", "boot").id_source("memory"),
            pool.clone(),
            Backend::Memory,
        )
        .unwrap();
        create_support_tables(&mut boot).unwrap();
        create_entity_table(&mut boot, &desc).unwrap();
        boot.close().unwrap();

        SessionServer::new(move |login| {
            if login.password.as_deref() != Some("sesame") {
                return Err(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Authentication,
                    message: format!("login refused for '{}'", login.user),
                    source: None,
                }));
            }
            LogicalConnection::local(
                Arc::clone(&context),
                Arc::clone(&entities),
                Arc::clone(&factories),
                login.clone().id_source("memory"),
                pool.clone(),
                Backend::Memory,
            )
        })
    }

    fn login(server: &SessionServer) -> i64 {
        let reply = server.dispatch(Request::Login {
            target: "mem://".to_string(),
            user: "tester".to_string(),
            password: Some("sesame".to_string()),
            application: None,
        });
        match reply {
            Response::LoggedIn { session, backend } => {
                assert_eq!(backend, Backend::Memory);
                session
            }
            other => panic!("login failed: {other:?}"),
        }
    }

    #[test]
    fn test_login_rejection_carries_the_authentication_family() {
        let server = test_server();
        let reply = server.dispatch(Request::Login {
            target: "mem://".to_string(),
            user: "intruder".to_string(),
            password: Some("wrong".to_string()),
            application: None,
        });
        let Response::Failed(fault) = reply else {
            panic!("bad password was accepted: {reply:?}");
        };
        assert!(fault.authentication);
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn test_unknown_session_is_a_consistency_fault() {
        let server = test_server();
        let Response::Failed(fault) = server.dispatch(Request::MasterRead { session: 99 }) else {
            panic!("unknown session was accepted");
        };
        assert!(fault.consistency);
        assert!(fault.message.contains("unknown session"));
    }

    #[test]
    fn test_unregistered_class_is_refused() {
        let server = test_server();
        let session = login(&server);
        let reply = server.dispatch(Request::Select {
            session,
            class: "ghost".to_string(),
            id: 1,
            locked: false,
        });
        let Response::Failed(fault) = reply else {
            panic!("unregistered class was accepted: {reply:?}");
        };
        assert!(fault.consistency);
        assert!(fault.message.contains("ghost"));
    }

    #[test]
    fn test_commit_without_begin_is_refused() {
        let server = test_server();
        let session = login(&server);
        let Response::Failed(fault) = server.dispatch(Request::Commit { session }) else {
            panic!("stray commit was accepted");
        };
        assert!(fault.consistency);
    }

    #[test]
    fn test_double_begin_is_refused() {
        let server = test_server();
        let session = login(&server);
        assert_eq!(
            server.dispatch(Request::Begin {
                session,
                name: "outer".to_string()
            }),
            Response::Ok
        );
        let Response::Failed(fault) = server.dispatch(Request::Begin {
            session,
            name: "again".to_string(),
        }) else {
            panic!("second begin was accepted");
        };
        assert!(fault.consistency);
        assert_eq!(server.dispatch(Request::Rollback { session }), Response::Ok);
    }

    #[test]
    fn test_logout_removes_the_session() {
        let server = test_server();
        let session = login(&server);
        assert_eq!(server.session_count(), 1);

        assert_eq!(
            server.dispatch(Request::Logout { session }),
            Response::LoggedOut
        );
        assert_eq!(server.session_count(), 0);

        let Response::Failed(fault) = server.dispatch(Request::MasterRead { session }) else {
            panic!("logged-out session still answers");
        };
        assert!(fault.consistency);
    }

    #[test]
    fn test_insert_replies_done_with_the_assigned_state() {
        let server = test_server();
        let session = login(&server);

        let reply = server.dispatch(Request::Insert {
            session,
            class: "account".to_string(),
            state: PersistState::default(),
            values: vec![Value::Text("alice".to_string()), Value::BigInt(100)],
        });
        let Response::Done { state } = reply else {
            panic!("insert failed: {reply:?}");
        };
        assert!(state.id > 0);
        assert_eq!(state.serial, 1);
    }

    #[test]
    fn test_duplicate_insert_replies_denied_with_the_flag() {
        let server = test_server();
        let session = login(&server);

        let taken = PersistState {
            id: 7,
            ..PersistState::default()
        };
        let values = vec![Value::Text("bob".to_string()), Value::BigInt(1)];
        let first = server.dispatch(Request::Insert {
            session,
            class: "account".to_string(),
            state: taken,
            values: values.clone(),
        });
        assert!(matches!(first, Response::Done { .. }));

        let second = server.dispatch(Request::Insert {
            session,
            class: "account".to_string(),
            state: taken,
            values,
        });
        let Response::Denied {
            unique_violation,
            state,
        } = second
        else {
            panic!("duplicate insert was accepted: {second:?}");
        };
        assert!(unique_violation);
        // The failed attempt left the caller's state untouched.
        assert_eq!(state.id, 7);
        assert_eq!(state.serial, 0);
    }

    #[test]
    fn test_cursors_are_scoped_to_their_session() {
        let server = test_server();
        let one = login(&server);
        let two = login(&server);

        for name in ["a", "b"] {
            let reply = server.dispatch(Request::Insert {
                session: one,
                class: "account".to_string(),
                state: PersistState::default(),
                values: vec![Value::Text(name.to_string()), Value::BigInt(0)],
            });
            assert!(matches!(reply, Response::Done { .. }));
        }

        let Response::Cursor { cursor } = server.dispatch(Request::CursorOpen {
            session: one,
            sql: "SELECT id, serial, name, balance FROM account ORDER BY id".to_string(),
            cursor: sqlentity_core::statement::CursorMode::Scrollable,
            concurrency: sqlentity_core::statement::ConcurrencyMode::ReadOnly,
            params: Vec::new(),
        }) else {
            panic!("cursor open failed");
        };

        // The handle means nothing on the other session.
        let Response::Failed(fault) = server.dispatch(Request::CursorSeek {
            session: two,
            cursor,
            seek: Seek::First,
        }) else {
            panic!("foreign cursor handle was accepted");
        };
        assert!(fault.message.contains("unknown cursor"));

        // On its own session it scrolls.
        assert_eq!(
            server.dispatch(Request::CursorSeek {
                session: one,
                cursor,
                seek: Seek::Absolute(2),
            }),
            Response::Positioned { at_row: true }
        );
        let Response::CursorRow { row } = server.dispatch(Request::CursorFetch {
            session: one,
            cursor,
        }) else {
            panic!("cursor fetch failed");
        };
        assert_eq!(
            row.into_row().get_named::<String>("name").unwrap(),
            "b"
        );

        assert_eq!(
            server.dispatch(Request::CursorClose {
                session: one,
                cursor
            }),
            Response::Ok
        );
        // Idempotent.
        assert_eq!(
            server.dispatch(Request::CursorClose {
                session: one,
                cursor
            }),
            Response::Ok
        );
    }

    #[test]
    fn test_unpositioned_cursor_fetch_is_refused() {
        let server = test_server();
        let session = login(&server);

        let Response::Cursor { cursor } = server.dispatch(Request::CursorOpen {
            session,
            sql: "SELECT id, serial, name, balance FROM account".to_string(),
            cursor: sqlentity_core::statement::CursorMode::ForwardOnly,
            concurrency: sqlentity_core::statement::ConcurrencyMode::ReadOnly,
            params: Vec::new(),
        }) else {
            panic!("cursor open failed");
        };
        let Response::Failed(fault) = server.dispatch(Request::CursorFetch { session, cursor })
        else {
            panic!("unpositioned fetch was accepted");
        };
        assert!(fault.consistency);
    }
}
