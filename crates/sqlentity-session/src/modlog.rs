//! The modification log: an append-only record of committed mutations,
//! and the replay machinery that re-applies them elsewhere.
//!
//! Log records are ordinary persistent rows in the `modlog` table,
//! written inside the same transaction as the mutation they describe.
//! The first logged mutation of a transaction lazily writes a BEGIN
//! marker whose row id becomes the transaction id every later record
//! points at; commit adds a COMMIT marker. A record is never updated
//! after the fact except to attach an error code.
//!
//! In deferred mode records are buffered on the logical connection and
//! flushed in one batch just before the physical commit. Ids are
//! assigned pessimistically at buffer time so the BEGIN marker can be
//! referenced before anything has hit the store; rollback simply drops
//! the buffer.

use crate::entity::{ColumnDef, ColumnType, Entity, EntityDescriptor, PersistState};
use crate::logical::LogicalConnection;
use crate::ops::{self, Persistent};
use sqlentity_core::driver::ExecOutcome;
use sqlentity_core::error::Error;
use sqlentity_core::row::Row;
use sqlentity_core::statement::StatementDesc;
use sqlentity_core::value::Value;
use sqlentity_core::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// What a log record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModType {
    Begin,
    Commit,
    Insert,
    Update,
    Delete,
    DeleteAll,
}

impl ModType {
    pub fn as_str(self) -> &'static str {
        match self {
            ModType::Begin => "BEGIN",
            ModType::Commit => "COMMIT",
            ModType::Insert => "INSERT",
            ModType::Update => "UPDATE",
            ModType::Delete => "DELETE",
            ModType::DeleteAll => "DELETEALL",
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "BEGIN" => Ok(ModType::Begin),
            "COMMIT" => Ok(ModType::Commit),
            "INSERT" => Ok(ModType::Insert),
            "UPDATE" => Ok(ModType::Update),
            "DELETE" => Ok(ModType::Delete),
            "DELETEALL" => Ok(ModType::DeleteAll),
            other => Err(Error::Custom(format!(
                "unknown modification type '{other}' in log record"
            ))),
        }
    }
}

/// One modification-log row.
#[derive(Debug, Clone)]
pub struct LogRecord {
    state: PersistState,
    pub object_id: i64,
    pub object_class: String,
    /// Row id of this transaction's BEGIN marker, 0 on the marker
    /// itself and on records written outside a named transaction.
    pub tx: i64,
    pub tx_name: String,
    pub mod_type: ModType,
    /// Microseconds since the epoch.
    pub logtime: i64,
    pub user: String,
    pub error_code: i32,
    pub message: Option<String>,
}

impl LogRecord {
    fn marker(mod_type: ModType, tx: i64, tx_name: &str, user: &str) -> Self {
        Self {
            state: PersistState::default(),
            object_id: 0,
            object_class: String::new(),
            tx,
            tx_name: tx_name.to_string(),
            mod_type,
            logtime: now_micros(),
            user: user.to_string(),
            error_code: 0,
            message: None,
        }
    }

    /// The log row's own id, which doubles as the transaction id when
    /// this is a BEGIN marker.
    pub fn id(&self) -> i64 {
        self.state.id
    }
}

const MODLOG_COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("objectid", ColumnType::BigInt),
    ColumnDef::new("objectclass", ColumnType::Text),
    ColumnDef::new("tx", ColumnType::BigInt),
    ColumnDef::new("txname", ColumnType::Text),
    ColumnDef::new("modtype", ColumnType::Text),
    ColumnDef::new("logtime", ColumnType::Timestamp),
    ColumnDef::new("username", ColumnType::Text),
    ColumnDef::new("errorcode", ColumnType::Int),
    ColumnDef::new("message", ColumnType::Text).nullable(),
];

impl Entity for LogRecord {
    const TABLE: &'static str = "modlog";

    fn columns() -> &'static [ColumnDef] {
        MODLOG_COLUMNS
    }

    fn state(&self) -> &PersistState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PersistState {
        &mut self.state
    }

    fn column_values(&self) -> Vec<Value> {
        vec![
            Value::BigInt(self.object_id),
            Value::Text(self.object_class.clone()),
            Value::BigInt(self.tx),
            Value::Text(self.tx_name.clone()),
            Value::Text(self.mod_type.as_str().to_string()),
            Value::Timestamp(self.logtime),
            Value::Text(self.user.clone()),
            Value::Int(self.error_code),
            match &self.message {
                Some(m) => Value::Text(m.clone()),
                None => Value::Null,
            },
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        let mod_type: String = row.get_named("modtype")?;
        Ok(Self {
            state: PersistState::default(),
            object_id: row.get_named("objectid")?,
            object_class: row.get_named("objectclass")?,
            tx: row.get_named("tx")?,
            tx_name: row.get_named("txname")?,
            mod_type: ModType::from_str(&mod_type)?,
            logtime: row.get_named("logtime")?,
            user: row.get_named("username")?,
            error_code: row.get_named("errorcode")?,
            message: row.get_named("message")?,
        })
    }
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as i64)
}

/// Write one mutation record, lazily opening the transaction's BEGIN
/// marker first. Called from inside the mutation's own bracket.
#[allow(clippy::result_large_err)]
#[tracing::instrument(level = "trace", skip(conn))]
pub(crate) fn log_modification(
    conn: &mut LogicalConnection,
    class: &str,
    object_id: i64,
    mod_type: ModType,
) -> Result<()> {
    let tx = if conn.in_transaction() {
        if conn.log_tx_id() == 0 {
            let user = conn.config().user.clone();
            let marker = LogRecord::marker(ModType::Begin, 0, conn.transaction_name(), &user);
            let id = append(conn, marker)?;
            conn.set_log_tx_id(id);
        }
        conn.log_tx_id()
    } else {
        0
    };

    let record = LogRecord {
        state: PersistState::default(),
        object_id,
        object_class: class.to_string(),
        tx,
        tx_name: conn.transaction_name().to_string(),
        mod_type,
        logtime: now_micros(),
        user: conn.config().user.clone(),
        error_code: 0,
        message: None,
    };
    append(conn, record)?;
    Ok(())
}

/// Persist or buffer one record, returning its assigned id.
#[allow(clippy::result_large_err)]
pub(crate) fn append(conn: &mut LogicalConnection, mut record: LogRecord) -> Result<i64> {
    if conn.deferred_logging() && conn.in_transaction() {
        let desc = conn.entities().descriptor::<LogRecord>()?;
        let id = conn.next_id_for(desc.id_slot(), desc.class())?;
        record.state_mut().id = id;
        conn.push_deferred(record);
        Ok(id)
    } else {
        if !record.insert(conn)? {
            return Err(Error::Custom(
                "modification log insert was rejected".to_string(),
            ));
        }
        Ok(record.state().id)
    }
}

/// Transaction-commit hook: write the COMMIT marker and flush any
/// deferred records, all still inside the open transaction.
#[allow(clippy::result_large_err)]
#[tracing::instrument(level = "debug", skip(conn))]
pub(crate) fn close_transaction(conn: &mut LogicalConnection) -> Result<()> {
    if conn.log_tx_id() != 0 {
        let user = conn.config().user.clone();
        let marker = LogRecord::marker(
            ModType::Commit,
            conn.log_tx_id(),
            conn.transaction_name(),
            &user,
        );
        append(conn, marker)?;
    }
    flush_deferred(conn)
}

#[allow(clippy::result_large_err)]
fn flush_deferred(conn: &mut LogicalConnection) -> Result<()> {
    if conn.deferred_len() == 0 {
        return Ok(());
    }
    let pending = conn.take_deferred();
    tracing::debug!(
        records = pending.len(),
        "flushing deferred modification log"
    );
    for mut record in pending {
        // Ids were handed out at buffer time, the insert keeps them.
        if !record.insert(conn)? {
            return Err(Error::Custom(
                "deferred modification log flush was rejected".to_string(),
            ));
        }
    }
    Ok(())
}

/// Attach an error code to an already-written record. The one
/// sanctioned after-the-fact update of a log row.
#[allow(clippy::result_large_err)]
pub fn attach_error(
    conn: &mut LogicalConnection,
    log_id: i64,
    error_code: i32,
    message: &str,
) -> Result<bool> {
    let backend = conn.backend();
    let stmt = conn.prepare_statement(StatementDesc::new(format!(
        "UPDATE modlog SET errorcode = {}, message = {} WHERE id = {}",
        backend.placeholder(1),
        backend.placeholder(2),
        backend.placeholder(3)
    )));
    let params = [
        Value::Int(error_code),
        Value::Text(message.to_string()),
        Value::BigInt(log_id),
    ];
    match conn.execute_update(stmt, &params)? {
        ExecOutcome::Rows(n) => Ok(n == 1),
        ExecOutcome::UniqueViolation => Ok(false),
    }
}

/// All records of one transaction: the BEGIN marker (whose own id is
/// the transaction id) plus everything pointing at it, in id order.
#[allow(clippy::result_large_err)]
pub fn select_by_tx(conn: &mut LogicalConnection, tx: i64) -> Result<Vec<LogRecord>> {
    let backend = conn.backend();
    let stmt = conn.prepare_statement(StatementDesc::new(format!(
        "SELECT id, serial, objectid, objectclass, tx, txname, modtype, logtime, username, \
         errorcode, message FROM modlog WHERE tx = {} OR id = {} ORDER BY id",
        backend.placeholder(1),
        backend.placeholder(2)
    )));
    let desc = conn.entities().descriptor::<LogRecord>()?;
    let mut rows = conn.execute_query(stmt, &[Value::BigInt(tx), Value::BigInt(tx)])?;
    let mut records = Vec::with_capacity(rows.len());
    while rows.next() {
        let row = rows.fetch()?;
        let mut record = LogRecord::from_row(row)?;
        *record.state_mut() = desc.state_from_row(row)?;
        records.push(record);
    }
    Ok(records)
}

#[allow(clippy::result_large_err)]
fn class_descriptor(conn: &LogicalConnection, class: &str) -> Result<Arc<EntityDescriptor>> {
    conn.entities().by_class(class).ok_or_else(|| {
        Error::Custom(format!(
            "modification log names unregistered class '{class}'"
        ))
    })
}

/// Re-apply one record against `target`, reading current object state
/// from `source`.
///
/// INSERT and UPDATE records carry no values; the object as it stands
/// at the source is synced into the target, so queued updates to the
/// same object converge in order. Returns whether anything was
/// applied; BEGIN/COMMIT markers and objects gone from the source
/// apply nothing.
#[allow(clippy::result_large_err)]
pub fn replay(
    source: &mut LogicalConnection,
    target: &mut LogicalConnection,
    record: &LogRecord,
) -> Result<bool> {
    match record.mod_type {
        ModType::Begin | ModType::Commit => Ok(false),
        ModType::DeleteAll => {
            let desc = class_descriptor(target, &record.object_class)?;
            ops::delete_all_rows(target, &desc)?;
            Ok(true)
        }
        ModType::Delete => {
            let desc = class_descriptor(target, &record.object_class)?;
            match ops::fetch_row(target, &desc, record.object_id, false)? {
                Some(row) => {
                    let mut state = desc.state_from_row(&row)?;
                    ops::delete_object(target, &desc, &mut state)
                }
                None => Ok(false),
            }
        }
        ModType::Insert | ModType::Update => {
            let src_desc = class_descriptor(source, &record.object_class)?;
            match ops::fetch_row(source, &src_desc, record.object_id, false)? {
                Some(row) => {
                    let mut state = src_desc.state_from_row(&row)?;
                    let values = src_desc.values_from_row(&row)?;
                    let tgt_desc = class_descriptor(target, &record.object_class)?;
                    ops::sync_values(target, &tgt_desc, &mut state, &values)
                }
                None => Ok(false),
            }
        }
    }
}

/// Re-apply a whole list in one target transaction.
///
/// With `copy_log` the records themselves are re-persisted into the
/// target's log with fresh ids, transaction links rewritten to the
/// copied BEGIN markers: the mechanism for point-in-time replication
/// to a secondary store. Returns how many records applied changes.
#[allow(clippy::result_large_err)]
#[tracing::instrument(level = "debug", skip(source, target, records), fields(records = records.len()))]
pub fn replay_all(
    source: &mut LogicalConnection,
    target: &mut LogicalConnection,
    records: &[LogRecord],
    copy_log: bool,
) -> Result<u64> {
    let started = target.begin("replay")?;
    match replay_list(source, target, records, copy_log) {
        Ok(applied) => {
            target.commit(started)?;
            Ok(applied)
        }
        Err(e) => {
            if let Err(rb) = target.rollback(started) {
                tracing::warn!(error = %rb, "rollback after failed replay");
            }
            Err(e)
        }
    }
}

#[allow(clippy::result_large_err)]
fn replay_list(
    source: &mut LogicalConnection,
    target: &mut LogicalConnection,
    records: &[LogRecord],
    copy_log: bool,
) -> Result<u64> {
    let mut applied = 0u64;
    // Old BEGIN-marker id to the id of its copy in the target log.
    let mut tx_map: HashMap<i64, i64> = HashMap::new();

    for record in records {
        if replay(source, target, record)? {
            applied += 1;
        }
        if copy_log {
            let mut copy = record.clone();
            *copy.state_mut() = PersistState::default();
            copy.tx = match record.mod_type {
                ModType::Begin => 0,
                _ => tx_map.get(&record.tx).copied().unwrap_or(0),
            };
            if !copy.insert(target)? {
                return Err(Error::Custom(
                    "copying a log record into the target was rejected".to_string(),
                ));
            }
            if record.mod_type == ModType::Begin {
                tx_map.insert(record.state.ident(), copy.state.id);
            }
        }
    }
    Ok(applied)
}
