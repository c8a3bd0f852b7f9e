//! Shared table store with transaction overlays and row locks.
//!
//! Committed rows live in the base tables. Every transaction stages its
//! writes in a private overlay and claims row locks as it goes; readers
//! in other transactions keep seeing the committed base until commit
//! applies the overlay (read committed), while the owning transaction
//! reads through its own overlay (read your writes). Lock waits poll
//! with a busy timeout instead of blocking on the table mutex, so a
//! stalled writer can never wedge unrelated tables.

use crate::parse::{
    AssignValue, CmpOp, ColumnKind, ColumnSpec, Command, Operand, Predicate, Projection,
};
use parking_lot::Mutex;
use sqlentity_core::error::{QueryError, QueryErrorKind, TypeError};
use sqlentity_core::{Error, Result, Row, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

const LOCK_POLL: Duration = Duration::from_millis(2);

pub(crate) struct Shared {
    tables: Mutex<HashMap<String, Table>>,
    lock_timeout: Duration,
    next_tx: AtomicU64,
}

struct Table {
    columns: Vec<ColumnSpec>,
    rows: Vec<StoredRow>,
    /// Row id to owning transaction. Held until commit or rollback.
    locks: HashMap<u64, u64>,
    next_rid: u64,
}

struct StoredRow {
    rid: u64,
    values: Vec<Value>,
}

#[derive(Default)]
struct TableOverlay {
    updates: HashMap<u64, Vec<Value>>,
    deletes: HashSet<u64>,
    inserts: Vec<(u64, Vec<Value>)>,
}

/// Uncommitted state of one transaction.
pub(crate) struct TxState {
    id: u64,
    overlays: HashMap<String, TableOverlay>,
    locks: Vec<(String, u64)>,
}

enum RowAction<'a> {
    Update(&'a [(String, AssignValue)]),
    Delete,
    Lock,
}

impl Shared {
    pub(crate) fn new(lock_timeout: Duration) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            lock_timeout,
            next_tx: AtomicU64::new(0),
        }
    }

    pub(crate) fn begin(&self) -> TxState {
        TxState {
            id: self.next_tx.fetch_add(1, AtomicOrdering::Relaxed) + 1,
            overlays: HashMap::new(),
            locks: Vec::new(),
        }
    }

    /// Apply the overlay to the base tables and release the locks.
    pub(crate) fn commit(&self, tx: TxState) {
        let mut tables = self.tables.lock();
        for (name, overlay) in tx.overlays {
            let Some(table) = tables.get_mut(&name) else {
                continue;
            };
            table.rows.retain(|row| !overlay.deletes.contains(&row.rid));
            for (rid, values) in overlay.updates {
                if let Some(row) = table.rows.iter_mut().find(|row| row.rid == rid) {
                    row.values = values;
                }
            }
            for (rid, values) in overlay.inserts {
                table.rows.push(StoredRow { rid, values });
            }
        }
        release_locks(&mut tables, tx.id, &tx.locks);
    }

    /// Discard the overlay and release the locks.
    pub(crate) fn rollback(&self, tx: TxState) {
        let mut tables = self.tables.lock();
        release_locks(&mut tables, tx.id, &tx.locks);
    }

    pub(crate) fn run_update(
        &self,
        tx: &mut TxState,
        command: &Command,
        params: &[Value],
        sql: &str,
    ) -> Result<u64> {
        match command {
            Command::CreateTable { table, columns } => self.create_table(sql, table, columns),
            Command::Insert {
                table,
                columns,
                values,
            } => self.insert_row(tx, sql, table, columns, values, params),
            Command::Update {
                table,
                assignments,
                predicate,
            } => Ok(self
                .claim_rows(
                    tx,
                    sql,
                    table,
                    predicate.as_ref(),
                    params,
                    &RowAction::Update(assignments),
                )?
                .0),
            Command::Delete { table, predicate } => Ok(self
                .claim_rows(tx, sql, table, predicate.as_ref(), params, &RowAction::Delete)?
                .0),
            Command::Select { .. } => {
                Err(Error::consistency("query statement executed as an update"))
            }
        }
    }

    pub(crate) fn run_query(
        &self,
        tx: &mut TxState,
        command: &Command,
        params: &[Value],
        sql: &str,
    ) -> Result<Vec<Row>> {
        let Command::Select {
            table,
            projection,
            predicate,
            order_by,
            for_update,
        } = command
        else {
            return Err(Error::consistency("update statement executed as a query"));
        };

        let mut images = if *for_update {
            self.claim_rows(tx, sql, table, predicate.as_ref(), params, &RowAction::Lock)?
                .1
        } else {
            self.read_rows(tx, sql, table, predicate.as_ref(), params)?
        };
        let columns = self.table_columns(sql, table)?;

        if !order_by.is_empty() {
            let keys = order_by
                .iter()
                .map(|(column, descending)| {
                    Ok((column_index(sql, &columns, column)?, *descending))
                })
                .collect::<Result<Vec<_>>>()?;
            images.sort_by(|a, b| {
                for &(idx, descending) in &keys {
                    let mut ord = compare_values(&a[idx], &b[idx]).unwrap_or(Ordering::Equal);
                    if descending {
                        ord = ord.reverse();
                    }
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        let (names, indices): (Vec<String>, Vec<usize>) = match projection {
            Projection::All => (
                columns.iter().map(|c| c.name.clone()).collect(),
                (0..columns.len()).collect(),
            ),
            Projection::Columns(cols) => (
                cols.clone(),
                cols.iter()
                    .map(|c| column_index(sql, &columns, c))
                    .collect::<Result<Vec<_>>>()?,
            ),
        };

        Ok(images
            .into_iter()
            .map(|image| {
                Row::new(
                    names.clone(),
                    indices.iter().map(|&i| image[i].clone()).collect(),
                )
            })
            .collect())
    }

    fn create_table(&self, sql: &str, name: &str, columns: &[ColumnSpec]) -> Result<u64> {
        let mut tables = self.tables.lock();
        if tables.contains_key(name) {
            return Err(Error::Query(QueryError::database(format!(
                "table {name} already exists"
            ))));
        }
        tracing::debug!(table = name, columns = columns.len(), "create table");
        tables.insert(
            name.to_string(),
            Table {
                columns: columns.to_vec(),
                rows: Vec::new(),
                locks: HashMap::new(),
                next_rid: 0,
            },
        );
        Ok(0)
    }

    fn insert_row(
        &self,
        tx: &mut TxState,
        sql: &str,
        name: &str,
        columns: &[String],
        operands: &[Operand],
        params: &[Value],
    ) -> Result<u64> {
        let mut tables = self.tables.lock();
        let table = tables
            .get_mut(name)
            .ok_or_else(|| missing_table(sql, name))?;

        let mut image = vec![Value::Null; table.columns.len()];
        if columns.is_empty() {
            if operands.len() != table.columns.len() {
                return Err(Error::Query(QueryError::database(format!(
                    "INSERT carries {} values for {} columns",
                    operands.len(),
                    table.columns.len()
                ))));
            }
            for (idx, operand) in operands.iter().enumerate() {
                image[idx] = resolve_operand(operand, params)?.clone();
            }
        } else {
            if columns.len() != operands.len() {
                return Err(Error::Query(QueryError::database(format!(
                    "INSERT names {} columns but carries {} values",
                    columns.len(),
                    operands.len()
                ))));
            }
            for (column, operand) in columns.iter().zip(operands) {
                let idx = column_index(sql, &table.columns, column)?;
                image[idx] = resolve_operand(operand, params)?.clone();
            }
        }
        let image = image
            .into_iter()
            .zip(&table.columns)
            .map(|(value, spec)| coerce(sql, spec, value))
            .collect::<Result<Vec<_>>>()?;

        if let Some(pk) = table.columns.iter().position(|c| c.primary_key) {
            let overlay = tx.overlays.get(name);
            if pk_conflict(table, overlay, pk, &image[pk], None) {
                return Err(Error::Query(QueryError::unique_violation(
                    sql,
                    format!("duplicate primary key in table {name}"),
                )));
            }
        }

        let rid = table.next_rid;
        table.next_rid += 1;
        tx.overlays
            .entry(name.to_string())
            .or_default()
            .inserts
            .push((rid, image));
        Ok(1)
    }

    /// Evaluate the predicate, lock every matching committed row, then
    /// run `action` while still holding the table mutex. A lock held by
    /// another transaction backs off and re-evaluates from scratch, so a
    /// row that changed while we waited is re-matched against its new
    /// committed image.
    fn claim_rows(
        &self,
        tx: &mut TxState,
        sql: &str,
        name: &str,
        predicate: Option<&Predicate>,
        params: &[Value],
        action: &RowAction<'_>,
    ) -> Result<(u64, Vec<Vec<Value>>)> {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            {
                let mut tables = self.tables.lock();
                let table = tables
                    .get_mut(name)
                    .ok_or_else(|| missing_table(sql, name))?;
                let overlay = tx.overlays.get(name);

                let mut matched = Vec::new();
                for (rid, values) in snapshot(table, overlay) {
                    if eval_predicate(sql, &table.columns, values, predicate, params)? {
                        matched.push(rid);
                    }
                }
                let own_inserts: HashSet<u64> = overlay
                    .map(|o| o.inserts.iter().map(|(rid, _)| *rid).collect())
                    .unwrap_or_default();

                let mut newly = Vec::new();
                let mut conflict = false;
                for &rid in &matched {
                    if own_inserts.contains(&rid) {
                        continue;
                    }
                    match table.locks.get(&rid) {
                        Some(owner) if *owner != tx.id => {
                            conflict = true;
                            break;
                        }
                        Some(_) => {}
                        None => {
                            table.locks.insert(rid, tx.id);
                            newly.push(rid);
                        }
                    }
                }

                if !conflict {
                    for rid in newly {
                        tx.locks.push((name.to_string(), rid));
                    }
                    return apply_action(table, tx, sql, name, &matched, params, action);
                }
                for rid in &newly {
                    table.locks.remove(rid);
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Query(QueryError::lock_timeout(
                    sql,
                    format!("row lock wait on table {name} exceeded the busy timeout"),
                )));
            }
            tracing::trace!(table = name, "row lock busy, retrying");
            std::thread::sleep(LOCK_POLL);
        }
    }

    fn read_rows(
        &self,
        tx: &TxState,
        sql: &str,
        name: &str,
        predicate: Option<&Predicate>,
        params: &[Value],
    ) -> Result<Vec<Vec<Value>>> {
        let tables = self.tables.lock();
        let table = tables.get(name).ok_or_else(|| missing_table(sql, name))?;
        let overlay = tx.overlays.get(name);
        let mut out = Vec::new();
        for (_, values) in snapshot(table, overlay) {
            if eval_predicate(sql, &table.columns, values, predicate, params)? {
                out.push(values.to_vec());
            }
        }
        Ok(out)
    }

    fn table_columns(&self, sql: &str, name: &str) -> Result<Vec<ColumnSpec>> {
        let tables = self.tables.lock();
        tables
            .get(name)
            .map(|table| table.columns.clone())
            .ok_or_else(|| missing_table(sql, name))
    }
}

fn apply_action(
    table: &mut Table,
    tx: &mut TxState,
    sql: &str,
    name: &str,
    matched: &[u64],
    params: &[Value],
    action: &RowAction<'_>,
) -> Result<(u64, Vec<Vec<Value>>)> {
    match action {
        RowAction::Lock => {
            let overlay = tx.overlays.get(name);
            let mut images = Vec::with_capacity(matched.len());
            for &rid in matched {
                if let Some(values) = current_image(table, overlay, rid) {
                    images.push(values.to_vec());
                }
            }
            Ok((images.len() as u64, images))
        }
        RowAction::Update(assignments) => {
            let overlay = tx.overlays.get(name);
            let pk = table.columns.iter().position(|c| c.primary_key);
            let mut staged = Vec::with_capacity(matched.len());
            for &rid in matched {
                let Some(current) = current_image(table, overlay, rid) else {
                    continue;
                };
                let mut image = current.to_vec();
                for (column, assign) in *assignments {
                    let idx = column_index(sql, &table.columns, column)?;
                    let value = match assign {
                        AssignValue::Set(operand) => resolve_operand(operand, params)?.clone(),
                        AssignValue::Arith {
                            column: source,
                            negate,
                            operand,
                        } => {
                            let source_idx = column_index(sql, &table.columns, source)?;
                            arith(&image[source_idx], resolve_operand(operand, params)?, *negate)?
                        }
                    };
                    image[idx] = coerce(sql, &table.columns[idx], value)?;
                }
                if let Some(pk_idx) = pk {
                    if !values_equal(&current[pk_idx], &image[pk_idx])
                        && pk_conflict(table, overlay, pk_idx, &image[pk_idx], Some(rid))
                    {
                        return Err(Error::Query(QueryError::unique_violation(
                            sql,
                            format!("duplicate primary key in table {name}"),
                        )));
                    }
                }
                staged.push((rid, image));
            }

            let overlay = tx.overlays.entry(name.to_string()).or_default();
            let count = staged.len() as u64;
            let mut images = Vec::with_capacity(staged.len());
            for (rid, image) in staged {
                if let Some(pos) = overlay.inserts.iter().position(|(r, _)| *r == rid) {
                    overlay.inserts[pos].1 = image.clone();
                } else {
                    overlay.updates.insert(rid, image.clone());
                }
                images.push(image);
            }
            Ok((count, images))
        }
        RowAction::Delete => {
            let overlay = tx.overlays.entry(name.to_string()).or_default();
            let mut count = 0;
            for &rid in matched {
                if let Some(pos) = overlay.inserts.iter().position(|(r, _)| *r == rid) {
                    overlay.inserts.remove(pos);
                } else {
                    overlay.updates.remove(&rid);
                    overlay.deletes.insert(rid);
                }
                count += 1;
            }
            Ok((count, Vec::new()))
        }
    }
}

/// Rows visible to `tx`: committed base filtered through the overlay,
/// then the overlay's own inserts.
fn snapshot<'a>(table: &'a Table, overlay: Option<&'a TableOverlay>) -> Vec<(u64, &'a [Value])> {
    let mut out = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        if let Some(o) = overlay {
            if o.deletes.contains(&row.rid) {
                continue;
            }
            if let Some(updated) = o.updates.get(&row.rid) {
                out.push((row.rid, updated.as_slice()));
                continue;
            }
        }
        out.push((row.rid, row.values.as_slice()));
    }
    if let Some(o) = overlay {
        for (rid, values) in &o.inserts {
            out.push((*rid, values.as_slice()));
        }
    }
    out
}

fn current_image<'a>(
    table: &'a Table,
    overlay: Option<&'a TableOverlay>,
    rid: u64,
) -> Option<&'a [Value]> {
    if let Some(o) = overlay {
        if let Some((_, values)) = o.inserts.iter().find(|(r, _)| *r == rid) {
            return Some(values);
        }
        if o.deletes.contains(&rid) {
            return None;
        }
        if let Some(values) = o.updates.get(&rid) {
            return Some(values);
        }
    }
    table
        .rows
        .iter()
        .find(|row| row.rid == rid)
        .map(|row| row.values.as_slice())
}

fn pk_conflict(
    table: &Table,
    overlay: Option<&TableOverlay>,
    pk: usize,
    candidate: &Value,
    exclude: Option<u64>,
) -> bool {
    snapshot(table, overlay)
        .into_iter()
        .any(|(rid, values)| Some(rid) != exclude && values_equal(&values[pk], candidate))
}

fn release_locks(tables: &mut HashMap<String, Table>, tx_id: u64, locks: &[(String, u64)]) {
    for (name, rid) in locks {
        if let Some(table) = tables.get_mut(name) {
            if table.locks.get(rid) == Some(&tx_id) {
                table.locks.remove(rid);
            }
        }
    }
}

fn eval_predicate(
    sql: &str,
    columns: &[ColumnSpec],
    row: &[Value],
    predicate: Option<&Predicate>,
    params: &[Value],
) -> Result<bool> {
    match predicate {
        None => Ok(true),
        Some(p) => eval(sql, columns, row, p, params),
    }
}

fn eval(
    sql: &str,
    columns: &[ColumnSpec],
    row: &[Value],
    predicate: &Predicate,
    params: &[Value],
) -> Result<bool> {
    match predicate {
        Predicate::And(left, right) => {
            Ok(eval(sql, columns, row, left, params)? && eval(sql, columns, row, right, params)?)
        }
        Predicate::Or(left, right) => {
            Ok(eval(sql, columns, row, left, params)? || eval(sql, columns, row, right, params)?)
        }
        Predicate::Compare {
            column,
            op,
            operand,
        } => {
            let value = &row[column_index(sql, columns, column)?];
            let target = resolve_operand(operand, params)?;
            Ok(match op {
                CmpOp::Eq => values_equal(value, target),
                CmpOp::NotEq => {
                    !value.is_null() && !target.is_null() && !values_equal(value, target)
                }
                CmpOp::Lt | CmpOp::LtEq | CmpOp::Gt | CmpOp::GtEq => {
                    match compare_values(value, target) {
                        None => false,
                        Some(ord) => match op {
                            CmpOp::Lt => ord == Ordering::Less,
                            CmpOp::LtEq => ord != Ordering::Greater,
                            CmpOp::Gt => ord == Ordering::Greater,
                            CmpOp::GtEq => ord != Ordering::Less,
                            CmpOp::Eq | CmpOp::NotEq => false,
                        },
                    }
                }
            })
        }
        Predicate::In {
            column,
            list,
            negated,
        } => {
            let value = &row[column_index(sql, columns, column)?];
            if value.is_null() {
                return Ok(false);
            }
            let mut hit = false;
            for item in list {
                if values_equal(value, resolve_operand(item, params)?) {
                    hit = true;
                    break;
                }
            }
            Ok(hit != *negated)
        }
        Predicate::IsNull { column, negated } => {
            Ok(row[column_index(sql, columns, column)?].is_null() != *negated)
        }
    }
}

fn resolve_operand<'a>(operand: &'a Operand, params: &'a [Value]) -> Result<&'a Value> {
    match operand {
        Operand::Literal(value) => Ok(value),
        Operand::Param(index) => params.get(*index).ok_or_else(|| {
            Error::consistency(format!(
                "statement references parameter {} but only {} were bound",
                index + 1,
                params.len()
            ))
        }),
    }
}

fn arith(base: &Value, operand: &Value, negate: bool) -> Result<Value> {
    if matches!(base, Value::Double(_)) || matches!(operand, Value::Double(_)) {
        let (Some(a), Some(b)) = (base.as_f64(), operand.as_f64()) else {
            return Err(arith_type_error(base, operand));
        };
        return Ok(Value::Double(if negate { a - b } else { a + b }));
    }
    let (Some(a), Some(b)) = (base.as_i64(), operand.as_i64()) else {
        return Err(arith_type_error(base, operand));
    };
    Ok(Value::BigInt(if negate { a - b } else { a + b }))
}

fn arith_type_error(base: &Value, operand: &Value) -> Error {
    Error::Type(TypeError {
        expected: "numeric operands",
        actual: format!("{} and {}", base.type_name(), operand.type_name()),
        column: None,
    })
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Double(_), _) | (_, Value::Double(_)) => {
            a.as_f64()?.partial_cmp(&b.as_f64()?)
        }
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        (Value::Bytes(x), Value::Bytes(y)) => Some(x.cmp(y)),
        _ => Some(a.as_i64()?.cmp(&b.as_i64()?)),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Some(Ordering::Equal)
}

fn coerce(sql: &str, spec: &ColumnSpec, value: Value) -> Result<Value> {
    if value.is_null() {
        return if spec.nullable {
            Ok(Value::Null)
        } else {
            Err(Error::Query(QueryError {
                kind: QueryErrorKind::Constraint,
                sql: Some(sql.to_string()),
                sqlstate: Some("23502".to_string()),
                message: format!(
                    "null value in column {} violates its not-null constraint",
                    spec.name
                ),
                source: None,
            }))
        };
    }
    match (spec.kind, value) {
        (ColumnKind::Bool, value @ Value::Bool(_))
        | (ColumnKind::Int, value @ Value::Int(_))
        | (ColumnKind::BigInt, value @ Value::BigInt(_))
        | (ColumnKind::Double, value @ Value::Double(_))
        | (ColumnKind::Text, value @ Value::Text(_))
        | (ColumnKind::Bytes, value @ Value::Bytes(_)) => Ok(value),
        (ColumnKind::Int, Value::BigInt(n)) => i32::try_from(n).map(Value::Int).map_err(|_| {
            Error::Query(QueryError::database(format!(
                "value {n} is out of range for INTEGER column {}",
                spec.name
            )))
        }),
        (ColumnKind::BigInt, Value::Int(n)) => Ok(Value::BigInt(i64::from(n))),
        (ColumnKind::BigInt, Value::Timestamp(t)) => Ok(Value::BigInt(t)),
        (ColumnKind::Double, Value::Int(n)) => Ok(Value::Double(f64::from(n))),
        (ColumnKind::Double, Value::BigInt(n)) => Ok(Value::Double(n as f64)),
        (kind, other) => Err(Error::Type(TypeError {
            expected: kind_name(kind),
            actual: other.type_name().to_string(),
            column: Some(spec.name.clone()),
        })),
    }
}

fn kind_name(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Bool => "BOOLEAN",
        ColumnKind::Int => "INTEGER",
        ColumnKind::BigInt => "BIGINT",
        ColumnKind::Double => "DOUBLE",
        ColumnKind::Text => "TEXT",
        ColumnKind::Bytes => "BLOB",
    }
}

fn column_index(sql: &str, columns: &[ColumnSpec], name: &str) -> Result<usize> {
    columns
        .iter()
        .position(|c| c.name == name)
        .ok_or_else(|| Error::Query(QueryError::not_found(sql, format!("unknown column {name}"))))
}

fn missing_table(sql: &str, name: &str) -> Error {
    Error::Query(QueryError::not_found(
        sql,
        format!("table {name} does not exist"),
    ))
}
