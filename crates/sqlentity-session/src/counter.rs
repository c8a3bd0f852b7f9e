//! The modification counter: one row per counted table plus a master
//! row, advanced on every counted mutation.
//!
//! The counter is what makes cheap change detection possible. Writers
//! call [`count_modification`] from inside their mutation; watchers
//! poll [`select_master_serial`] and, only when it moved, re-read the
//! per-table serials they care about. The master row is keyed by the
//! reserved table name `*` and bumped at most once per transaction
//! when the caller allows the optimization.
//!
//! Counter rows are created on demand: the first counted mutation of a
//! table finds no row to bump and inserts one with serial 1, racing
//! creation by other connections through the unique key on
//! `tablename`.

use crate::backing::{CounterOp, OpReply, RemoteOp};
use crate::entity::{ColumnDef, ColumnType, Entity, PersistState};
use crate::logical::LogicalConnection;
use crate::ops::Persistent;
use sqlentity_core::driver::ExecOutcome;
use sqlentity_core::error::Error;
use sqlentity_core::row::Row;
use sqlentity_core::statement::StatementDesc;
use sqlentity_core::value::Value;
use sqlentity_core::Result;

/// Table name of the master row.
pub const MASTER_NAME: &str = "*";

/// Give up on counter-row creation after this many lost races.
const MAX_CREATE_ATTEMPTS: usize = 100;

/// One row of the `modcounter` table. The row's own serial is the
/// counter value, so bumping is a single arithmetic update.
#[derive(Debug)]
pub(crate) struct ModCounterRow {
    state: PersistState,
    tablename: String,
}

impl ModCounterRow {
    pub(crate) fn new(table: &str) -> Self {
        Self {
            state: PersistState::default(),
            tablename: table.to_string(),
        }
    }
}

const MODCOUNTER_COLUMNS: &[ColumnDef] = &[ColumnDef::new("tablename", ColumnType::Text)];

impl Entity for ModCounterRow {
    const TABLE: &'static str = "modcounter";

    fn columns() -> &'static [ColumnDef] {
        MODCOUNTER_COLUMNS
    }

    fn state(&self) -> &PersistState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PersistState {
        &mut self.state
    }

    fn column_values(&self) -> Vec<Value> {
        vec![Value::Text(self.tablename.clone())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            state: PersistState::default(),
            tablename: row.get_named("tablename")?,
        })
    }
}

/// Count one mutation of `table`.
///
/// Bumps the table's counter row, then the master row unless
/// `optimize` suppresses a repeat bump within the open transaction.
/// Returns the table's new serial when `uses_table_serial` asks for it
/// (the caller stamps it on the mutated row), 0 otherwise.
#[allow(clippy::result_large_err)]
#[tracing::instrument(level = "trace", skip(conn))]
pub fn count_modification(
    conn: &mut LogicalConnection,
    table: &str,
    uses_table_serial: bool,
    optimize: bool,
) -> Result<i64> {
    if conn.is_remote() {
        let reply = conn.forward(RemoteOp::Counter(CounterOp::Bump {
            table: table.to_string(),
            uses_table_serial,
            optimize,
        }))?;
        return match reply {
            OpReply::Serial(serial) => Ok(serial),
            other => Err(other.unexpected("a counter serial")),
        };
    }

    let serial = bump_row(conn, table, uses_table_serial)?;

    if conn.in_transaction() {
        if !(optimize && conn.master_counted()) {
            bump_row(conn, MASTER_NAME, false)?;
            conn.set_master_counted(true);
        }
    } else {
        bump_row(conn, MASTER_NAME, false)?;
    }

    Ok(serial)
}

/// Advance one counter row, creating it on first use.
#[allow(clippy::result_large_err)]
fn bump_row(conn: &mut LogicalConnection, table: &str, want_serial: bool) -> Result<i64> {
    let backend = conn.backend();
    let bump = conn.prepare_statement(StatementDesc::new(format!(
        "UPDATE modcounter SET serial = serial + 1 WHERE tablename = {}",
        backend.placeholder(1)
    )));

    for _ in 0..MAX_CREATE_ATTEMPTS {
        match conn.execute_update(bump, &[Value::Text(table.to_string())])? {
            ExecOutcome::Rows(0) => {
                if create_row(conn, table)? {
                    // The fresh row's serial of 1 is this very count.
                    return Ok(if want_serial { 1 } else { 0 });
                }
                // Lost the creation race; the row exists now, bump it.
            }
            ExecOutcome::Rows(_) => {
                return if want_serial {
                    read_serial(conn, table)
                } else {
                    Ok(0)
                };
            }
            ExecOutcome::UniqueViolation => {
                conn.take_unique_violation();
            }
        }
    }
    Err(Error::Custom(format!(
        "modification counter row for '{table}' could not be created"
    )))
}

/// Insert the missing counter row. `Ok(false)` means another
/// connection won the race; the violation flag is consumed here.
#[allow(clippy::result_large_err)]
fn create_row(conn: &mut LogicalConnection, table: &str) -> Result<bool> {
    if table == MASTER_NAME {
        // The master row sits outside the identity machinery at id 0.
        let backend = conn.backend();
        let insert = conn.prepare_statement(StatementDesc::new(format!(
            "INSERT INTO modcounter (id, serial, tablename) VALUES ({}, {}, {})",
            backend.placeholder(1),
            backend.placeholder(2),
            backend.placeholder(3)
        )));
        let params = [
            Value::BigInt(0),
            Value::BigInt(1),
            Value::Text(MASTER_NAME.to_string()),
        ];
        return match conn.execute_update(insert, &params)? {
            ExecOutcome::Rows(_) => Ok(true),
            ExecOutcome::UniqueViolation => {
                conn.take_unique_violation();
                Ok(false)
            }
        };
    }

    let mut row = ModCounterRow::new(table);
    if row.insert(conn)? {
        tracing::debug!(table, "modification counter row created");
        Ok(true)
    } else {
        conn.take_unique_violation();
        Ok(false)
    }
}

#[allow(clippy::result_large_err)]
fn read_serial(conn: &mut LogicalConnection, table: &str) -> Result<i64> {
    let backend = conn.backend();
    let select = conn.prepare_statement(StatementDesc::new(format!(
        "SELECT serial FROM modcounter WHERE tablename = {}",
        backend.placeholder(1)
    )));
    let mut rows = conn.execute_query(select, &[Value::Text(table.to_string())])?;
    if rows.first() {
        rows.fetch()?.get_named("serial")
    } else {
        Ok(0)
    }
}

/// Current serial of one table's counter row, 0 when never counted.
#[allow(clippy::result_large_err)]
pub fn select_modification(conn: &mut LogicalConnection, table: &str) -> Result<i64> {
    if conn.is_remote() {
        let reply = conn.forward(RemoteOp::Counter(CounterOp::Read {
            table: table.to_string(),
        }))?;
        return match reply {
            OpReply::Serial(serial) => Ok(serial),
            other => Err(other.unexpected("a counter serial")),
        };
    }
    read_serial(conn, table)
}

/// Current master serial, 0 when nothing was ever counted.
#[allow(clippy::result_large_err)]
pub fn select_master_serial(conn: &mut LogicalConnection) -> Result<i64> {
    if conn.is_remote() {
        let reply = conn.forward(RemoteOp::Counter(CounterOp::ReadMaster))?;
        return match reply {
            OpReply::Serial(serial) => Ok(serial),
            other => Err(other.unexpected("a counter serial")),
        };
    }
    read_serial(conn, MASTER_NAME)
}

/// Serials for a set of tables in one round trip.
///
/// Tables without a counter row are simply absent from the result;
/// the poller treats them as unchanged.
#[allow(clippy::result_large_err)]
pub fn select_modifications(
    conn: &mut LogicalConnection,
    tables: &[&str],
) -> Result<Vec<(String, i64)>> {
    if tables.is_empty() {
        return Ok(Vec::new());
    }
    if conn.is_remote() {
        let mut serials = Vec::with_capacity(tables.len());
        for table in tables {
            serials.push((table.to_string(), select_modification(conn, table)?));
        }
        return Ok(serials);
    }

    let backend = conn.backend();
    let mut placeholders = String::new();
    for i in 0..tables.len() {
        if i > 0 {
            placeholders.push_str(", ");
        }
        placeholders.push_str(&backend.placeholder(i + 1));
    }
    let select = conn.prepare_statement(StatementDesc::new(format!(
        "SELECT tablename, serial FROM modcounter WHERE tablename IN ({placeholders})"
    )));
    let params: Vec<Value> = tables
        .iter()
        .map(|t| Value::Text(t.to_string()))
        .collect();

    let mut rows = conn.execute_query(select, &params)?;
    let mut serials = Vec::with_capacity(rows.len());
    while rows.next() {
        let row = rows.fetch()?;
        serials.push((row.get_named("tablename")?, row.get_named("serial")?));
    }
    Ok(serials)
}

/// Deletion detector over a table-serial range.
///
/// A reader that remembered serial `old` and sees the counter at `max`
/// re-queries rows whose stamped serial lies in `(old, max]`, feeding
/// them here in ascending order. A jump of more than 1 between
/// consecutive serials, or between the last one and `max`, means some
/// stamped row is gone.
#[derive(Debug)]
pub struct SerialGapScan {
    last: i64,
    max: i64,
    gap: bool,
}

impl SerialGapScan {
    pub fn new(old: i64, max: i64) -> Self {
        Self {
            last: old,
            max,
            gap: false,
        }
    }

    /// Feed the next stamped serial, ascending.
    pub fn offer(&mut self, serial: i64) {
        if serial - self.last > 1 {
            self.gap = true;
        }
        self.last = serial;
    }

    /// True when at least one deletion happened inside the range.
    pub fn finish(self) -> bool {
        self.gap || self.max - self.last > 1
    }
}
