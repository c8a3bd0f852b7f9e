//! `Driver` implementation over the shared store.
//!
//! A [`MemDatabase`] is a handle to one set of tables; its `factory()`
//! plugs straight into the pool. Connections are cheap: each one carries
//! only its autocommit flag and open transaction, and every prepared
//! statement compiles its SQL once at prepare time.

use crate::parse::{Command, parse_command};
use crate::store::{Shared, TxState};
use parking_lot::Mutex;
use sqlentity_core::error::{ConnectionError, ConnectionErrorKind};
use sqlentity_core::{
    Backend, CursorMode, Driver, DriverCursor, DriverStatement, Error, Result, Row, StatementDesc,
    Value,
};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle to one in-memory database.
///
/// Clones share the same tables, so any number of connections can be
/// opened against a single handle from any thread.
#[derive(Clone)]
pub struct MemDatabase {
    shared: Arc<Shared>,
}

impl MemDatabase {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Like [`new`](Self::new), with a custom row-lock busy timeout.
    /// Tests use a short timeout to observe lock conflicts quickly.
    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared::new(timeout)),
        }
    }

    /// Connection factory for the pool.
    pub fn factory(&self) -> impl Fn() -> Result<Box<dyn Driver>> + Send + Sync + 'static {
        let shared = Arc::clone(&self.shared);
        move || {
            let driver: Box<dyn Driver> = Box::new(MemDriver::new(Arc::clone(&shared)));
            Ok(driver)
        }
    }

    /// Open a connection directly, without going through a pool.
    pub fn connect(&self) -> MemDriver {
        MemDriver::new(Arc::clone(&self.shared))
    }
}

impl Default for MemDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDatabase").finish_non_exhaustive()
    }
}

struct ConnState {
    auto_commit: bool,
    tx: Option<TxState>,
    closed: bool,
}

/// One connection. Statements keep a handle to the connection state so a
/// statement prepared before `close()` fails afterwards like a statement
/// on any disconnected backend would.
pub struct MemDriver {
    shared: Arc<Shared>,
    conn: Arc<Mutex<ConnState>>,
}

impl MemDriver {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            conn: Arc::new(Mutex::new(ConnState {
                auto_commit: true,
                tx: None,
                closed: false,
            })),
        }
    }
}

fn ensure_open(conn: &ConnState) -> Result<()> {
    if conn.closed {
        return Err(Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: "connection is closed".to_string(),
            source: None,
        }));
    }
    Ok(())
}

impl Driver for MemDriver {
    fn backend(&self) -> Backend {
        Backend::Memory
    }

    fn prepare(&mut self, desc: &StatementDesc) -> Result<Box<dyn DriverStatement>> {
        ensure_open(&self.conn.lock())?;
        let command = parse_command(&desc.sql)?;
        Ok(Box::new(MemStatement {
            shared: Arc::clone(&self.shared),
            conn: Arc::clone(&self.conn),
            command,
            sql: desc.sql.clone(),
            scrollable: desc.cursor == CursorMode::Scrollable,
        }))
    }

    fn set_auto_commit(&mut self, on: bool) -> Result<()> {
        let mut conn = self.conn.lock();
        ensure_open(&conn)?;
        if conn.auto_commit == on {
            return Ok(());
        }
        if on {
            // Turning autocommit back on commits the open transaction.
            if let Some(tx) = conn.tx.take() {
                self.shared.commit(tx);
            }
        }
        conn.auto_commit = on;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let mut conn = self.conn.lock();
        ensure_open(&conn)?;
        if let Some(tx) = conn.tx.take() {
            self.shared.commit(tx);
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        let mut conn = self.conn.lock();
        ensure_open(&conn)?;
        if let Some(tx) = conn.tx.take() {
            self.shared.rollback(tx);
        }
        Ok(())
    }

    fn ping(&mut self) -> Result<()> {
        ensure_open(&self.conn.lock())
    }

    fn close(&mut self) -> Result<()> {
        let mut conn = self.conn.lock();
        if conn.closed {
            return Ok(());
        }
        if let Some(tx) = conn.tx.take() {
            self.shared.rollback(tx);
        }
        conn.closed = true;
        Ok(())
    }
}

struct MemStatement {
    shared: Arc<Shared>,
    conn: Arc<Mutex<ConnState>>,
    command: Command,
    sql: String,
    scrollable: bool,
}

impl DriverStatement for MemStatement {
    fn execute_update(&mut self, params: &[Value]) -> Result<u64> {
        let mut conn = self.conn.lock();
        ensure_open(&conn)?;
        if conn.auto_commit {
            let mut tx = self.shared.begin();
            match self.shared.run_update(&mut tx, &self.command, params, &self.sql) {
                Ok(count) => {
                    self.shared.commit(tx);
                    Ok(count)
                }
                Err(err) => {
                    self.shared.rollback(tx);
                    Err(err)
                }
            }
        } else {
            let tx = conn.tx.get_or_insert_with(|| self.shared.begin());
            self.shared.run_update(tx, &self.command, params, &self.sql)
        }
    }

    fn execute_query(&mut self, params: &[Value]) -> Result<Box<dyn DriverCursor>> {
        let mut conn = self.conn.lock();
        ensure_open(&conn)?;
        let rows = if conn.auto_commit {
            let mut tx = self.shared.begin();
            match self.shared.run_query(&mut tx, &self.command, params, &self.sql) {
                Ok(rows) => {
                    self.shared.commit(tx);
                    rows
                }
                Err(err) => {
                    self.shared.rollback(tx);
                    return Err(err);
                }
            }
        } else {
            let tx = conn.tx.get_or_insert_with(|| self.shared.begin());
            self.shared.run_query(tx, &self.command, params, &self.sql)?
        };
        Ok(Box::new(MemCursor {
            rows,
            pos: 0,
            scrollable: self.scrollable,
        }))
    }
}

/// Materialized result set, positioned 1-based like the sessions expect.
struct MemCursor {
    rows: Vec<Row>,
    pos: usize,
    scrollable: bool,
}

impl MemCursor {
    fn scroll_guard(&self) -> Result<()> {
        if self.scrollable {
            Ok(())
        } else {
            Err(Error::consistency("cursor is forward-only"))
        }
    }
}

impl DriverCursor for MemCursor {
    fn first(&mut self) -> Result<bool> {
        if !self.scrollable && self.pos > 0 {
            return Err(Error::consistency("cursor is forward-only"));
        }
        if self.rows.is_empty() {
            return Ok(false);
        }
        self.pos = 1;
        Ok(true)
    }

    fn next(&mut self) -> Result<bool> {
        if self.pos <= self.rows.len() {
            self.pos += 1;
        }
        Ok(self.pos <= self.rows.len())
    }

    fn previous(&mut self) -> Result<bool> {
        self.scroll_guard()?;
        if self.pos > self.rows.len() {
            // Stepping back from past-the-end lands on the last row.
            self.pos = self.rows.len();
            return Ok(self.pos > 0);
        }
        if self.pos > 1 {
            self.pos -= 1;
            Ok(true)
        } else {
            self.pos = 0;
            Ok(false)
        }
    }

    fn absolute(&mut self, pos: u64) -> Result<bool> {
        self.scroll_guard()?;
        let pos = usize::try_from(pos).unwrap_or(usize::MAX);
        if pos >= 1 && pos <= self.rows.len() {
            self.pos = pos;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn fetch(&mut self) -> Result<Row> {
        if self.pos >= 1 && self.pos <= self.rows.len() {
            Ok(self.rows[self.pos - 1].clone())
        } else {
            Err(Error::consistency("cursor is not positioned on a row"))
        }
    }

    fn close(&mut self) -> Result<()> {
        self.rows.clear();
        self.pos = 0;
        Ok(())
    }
}
