//! Scripted driver for session-layer tests.
//!
//! Tests queue the result of each upcoming statement (`push_rows`,
//! `push_query`, `push_unique_violation`) and afterwards assert on the
//! recorded call log. Calls are logged as `update:SQL [params]`,
//! `query:SQL [params]`, `commit`, `rollback` and `autocommit:flag`;
//! prepares and pings are silent, matching what the assertions care
//! about. An unscripted update reports one affected row, an unscripted
//! query no rows.

use crate::entity::EntityRegistry;
use crate::idsource::IdSourceFactories;
use crate::logical::LogicalConnection;
use parking_lot::Mutex;
use sqlentity_core::backend::Backend;
use sqlentity_core::config::ConnectConfig;
use sqlentity_core::context::Context;
use sqlentity_core::driver::{Driver, DriverCursor, DriverStatement};
use sqlentity_core::error::{Error, QueryError};
use sqlentity_core::row::Row;
use sqlentity_core::statement::StatementDesc;
use sqlentity_core::value::Value;
use sqlentity_core::Result;
use sqlentity_pool::{Pool, PoolConfig};
use std::collections::VecDeque;
use std::sync::Arc;

enum Scripted {
    Rows(u64),
    Query(Vec<Row>),
    UniqueViolation,
}

#[derive(Default)]
struct ScriptState {
    results: VecDeque<Scripted>,
    calls: Vec<String>,
}

/// Handle shared between a test and every driver the pool opens.
#[derive(Clone)]
pub(crate) struct Script {
    state: Arc<Mutex<ScriptState>>,
}

impl Script {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    /// Queue an update result of `rows` affected rows.
    pub(crate) fn push_rows(&self, rows: u64) {
        self.state.lock().results.push_back(Scripted::Rows(rows));
    }

    /// Queue a query result.
    pub(crate) fn push_query(&self, rows: Vec<Row>) {
        self.state.lock().results.push_back(Scripted::Query(rows));
    }

    /// Queue a unique-constraint violation for the next update.
    pub(crate) fn push_unique_violation(&self) {
        self.state
            .lock()
            .results
            .push_back(Scripted::UniqueViolation);
    }

    /// Everything executed so far, in order.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Connect closure for [`Pool::new`].
    pub(crate) fn factory(&self) -> impl Fn() -> Result<Box<dyn Driver>> + Send + Sync + 'static {
        let state = Arc::clone(&self.state);
        move || -> Result<Box<dyn Driver>> {
            Ok(Box::new(ScriptDriver {
                state: Arc::clone(&state),
            }))
        }
    }
}

struct ScriptDriver {
    state: Arc<Mutex<ScriptState>>,
}

impl Driver for ScriptDriver {
    fn backend(&self) -> Backend {
        Backend::Memory
    }

    fn prepare(&mut self, desc: &StatementDesc) -> Result<Box<dyn DriverStatement>> {
        Ok(Box::new(ScriptStatement {
            state: Arc::clone(&self.state),
            sql: desc.sql.clone(),
        }))
    }

    fn set_auto_commit(&mut self, on: bool) -> Result<()> {
        self.state.lock().calls.push(format!("autocommit:{on}"));
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.state.lock().calls.push("commit".to_string());
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.state.lock().calls.push("rollback".to_string());
        Ok(())
    }

    fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct ScriptStatement {
    state: Arc<Mutex<ScriptState>>,
    sql: String,
}

impl DriverStatement for ScriptStatement {
    fn execute_update(&mut self, params: &[Value]) -> Result<u64> {
        let mut state = self.state.lock();
        state
            .calls
            .push(format!("update:{} {}", self.sql, fmt_params(params)));
        match state.results.pop_front() {
            Some(Scripted::Rows(n)) => Ok(n),
            Some(Scripted::UniqueViolation) => Err(Error::Query(QueryError::unique_violation(
                self.sql.clone(),
                "scripted unique violation",
            ))),
            Some(Scripted::Query(_)) => Err(Error::consistency(format!(
                "scripted query result consumed by an update: {}",
                self.sql
            ))),
            None => Ok(1),
        }
    }

    fn execute_query(&mut self, params: &[Value]) -> Result<Box<dyn DriverCursor>> {
        let mut state = self.state.lock();
        state
            .calls
            .push(format!("query:{} {}", self.sql, fmt_params(params)));
        match state.results.pop_front() {
            Some(Scripted::Query(rows)) => Ok(Box::new(BufferedCursor::new(rows))),
            Some(Scripted::Rows(_)) => Err(Error::consistency(format!(
                "scripted update result consumed by a query: {}",
                self.sql
            ))),
            Some(Scripted::UniqueViolation) => Err(Error::Query(QueryError::unique_violation(
                self.sql.clone(),
                "scripted unique violation",
            ))),
            None => Ok(Box::new(BufferedCursor::new(Vec::new()))),
        }
    }
}

/// In-memory scrollable cursor over prefabricated rows.
pub(crate) struct BufferedCursor {
    rows: Vec<Row>,
    /// One-based position; 0 = before first, len+1 = past last.
    pos: usize,
}

impl BufferedCursor {
    pub(crate) fn new(rows: Vec<Row>) -> Self {
        Self { rows, pos: 0 }
    }
}

impl DriverCursor for BufferedCursor {
    fn first(&mut self) -> Result<bool> {
        self.absolute(1)
    }

    fn next(&mut self) -> Result<bool> {
        if self.pos <= self.rows.len() {
            self.pos += 1;
        }
        Ok(self.pos <= self.rows.len())
    }

    fn previous(&mut self) -> Result<bool> {
        if self.pos > 0 {
            self.pos -= 1;
        }
        Ok(self.pos > 0)
    }

    fn absolute(&mut self, pos: u64) -> Result<bool> {
        let pos = pos as usize;
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
            Err(Error::consistency("cursor not positioned on a row"))
        }
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn fmt_params(params: &[Value]) -> String {
    let mut out = String::from("[");
    for (i, value) in params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        match value {
            Value::Null => out.push_str("NULL"),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Int(n) => out.push_str(&n.to_string()),
            Value::BigInt(n) => out.push_str(&n.to_string()),
            Value::Double(d) => out.push_str(&d.to_string()),
            Value::Text(s) => out.push_str(s),
            Value::Bytes(b) => out.push_str(&format!("<{} bytes>", b.len())),
            Value::Timestamp(t) => out.push_str(&t.to_string()),
        }
    }
    out.push(']');
    out
}

/// A logical connection over a scripted pool: memory backend, memory
/// id source, user `tester`.
pub(crate) fn script_conn() -> (Script, LogicalConnection) {
    let script = Script::new();
    let conn = connect(&script);
    (script, conn)
}

/// Two fully independent scripted connections, for replication tests.
pub(crate) fn script_conn_pair() -> ((Script, Script), (LogicalConnection, LogicalConnection)) {
    let a = Script::new();
    let b = Script::new();
    let conn_a = connect(&a);
    let conn_b = connect(&b);
    ((a, b), (conn_a, conn_b))
}

fn connect(script: &Script) -> LogicalConnection {
    let context = Context::new();
    let entities = EntityRegistry::new(Arc::clone(&context), Backend::Memory);
    let factories = IdSourceFactories::new();
    let pool = Pool::new(
        PoolConfig::new(4),
        Box::new(script.factory()),
        Arc::clone(&context),
    )
    .unwrap();
    let config = ConnectConfig::new("script://", "tester").id_source("memory");
    LogicalConnection::local(context, entities, factories, config, pool, Backend::Memory).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_results_come_back_in_order() {
        let (script, mut conn) = script_conn();
        let stmt = conn.prepare_statement(StatementDesc::new("UPDATE t SET x = ?"));

        script.push_rows(3);
        script.push_rows(0);
        assert_eq!(
            conn.execute_update(stmt, &[Value::Int(1)])
                .unwrap()
                .rows_affected(),
            3
        );
        assert_eq!(
            conn.execute_update(stmt, &[Value::Null])
                .unwrap()
                .rows_affected(),
            0
        );

        assert_eq!(
            script.calls(),
            vec![
                "update:UPDATE t SET x = ? [1]".to_string(),
                "update:UPDATE t SET x = ? [NULL]".to_string(),
            ]
        );
    }

    #[test]
    fn test_unscripted_query_is_empty() {
        let (_script, mut conn) = script_conn();
        let stmt = conn.prepare_statement(StatementDesc::new("SELECT x FROM t"));
        let rows = conn.execute_query(stmt, &[]).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_buffered_cursor_scrolls_both_ways() {
        let row = |n: i64| Row::new(vec!["n".to_string()], vec![Value::BigInt(n)]);
        let mut cursor = BufferedCursor::new(vec![row(1), row(2), row(3)]);

        assert!(cursor.first().unwrap());
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.fetch().unwrap().get_named::<i64>("n").unwrap(), 2);
        assert!(cursor.absolute(3).unwrap());
        assert!(!cursor.next().unwrap());
        // Past the end, previous steps back onto the last row.
        assert!(cursor.previous().unwrap());
        assert_eq!(cursor.fetch().unwrap().get_named::<i64>("n").unwrap(), 3);
        assert!(!cursor.absolute(9).unwrap());
    }
}
