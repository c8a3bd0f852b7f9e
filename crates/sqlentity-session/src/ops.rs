//! Persistence operations over entity descriptors.
//!
//! Every mutation follows the same shape: wrap itself in a transaction
//! bracket (a no-op when the caller already holds one), snapshot the
//! object's id and serial, run the counter hook, execute the
//! statement, and on success write the modification log and commit.
//! Any recoverable failure restores the snapshot, rolls back the
//! bracket and reports `false`; only consistency and driver errors
//! propagate.
//!
//! The optimistic rule sits in the statements themselves: update and
//! delete predicate on `id = ? AND serial = ?`, so zero affected rows
//! means a concurrent writer got there first.
//!
//! The descriptor-driven functions here are the single implementation
//! for three callers: the typed [`Persistent`] methods, log replay,
//! and the server side of remote sessions. On a remote connection the
//! typed path forwards the whole operation instead, and the peer runs
//! the same functions locally.

use crate::backing::{EntityOp, OpReply, RemoteOp};
use crate::counter;
use crate::entity::{Entity, EntityDescriptor, PersistState};
use crate::logical::LogicalConnection;
use crate::modlog::{self, ModType};
use sqlentity_core::driver::ExecOutcome;
use sqlentity_core::error::Error;
use sqlentity_core::row::Row;
use sqlentity_core::value::Value;
use sqlentity_core::Result;

/// Typed persistence surface, implemented for every [`Entity`].
///
/// `select` and friends are inherent operations of the type; the
/// mutations take `&mut self` so id, serial and table serial track the
/// store. All of them return `false` instead of failing on optimistic
/// losses and unique violations.
pub trait Persistent: Entity + 'static {
    /// Load by id, `None` when the row does not exist.
    #[allow(clippy::result_large_err)]
    fn select(conn: &mut LogicalConnection, id: i64) -> Result<Option<Self>> {
        let desc = conn.entities().descriptor::<Self>()?;
        match fetch_row(conn, &desc, id, false)? {
            Some(row) => Ok(Some(hydrate::<Self>(&desc, &row)?)),
            None => Ok(None),
        }
    }

    /// Load by id holding a row lock until the transaction ends.
    #[allow(clippy::result_large_err)]
    fn select_locked(conn: &mut LogicalConnection, id: i64) -> Result<Option<Self>> {
        let desc = conn.entities().descriptor::<Self>()?;
        match fetch_row(conn, &desc, id, true)? {
            Some(row) => Ok(Some(hydrate::<Self>(&desc, &row)?)),
            None => Ok(None),
        }
    }

    /// Claim an identity without inserting: afterwards `id < 0` and
    /// the object is still virgin. A later insert adopts the reserved
    /// id.
    #[allow(clippy::result_large_err)]
    fn reserve_id(&mut self, conn: &mut LogicalConnection) -> Result<()> {
        let desc = conn.entities().descriptor::<Self>()?;
        reserve_ident(conn, &desc, self.state_mut())
    }

    /// Insert a virgin object. `false` means a unique violation.
    #[allow(clippy::result_large_err)]
    fn insert(&mut self, conn: &mut LogicalConnection) -> Result<bool> {
        let desc = conn.entities().descriptor::<Self>()?;
        let values = self.column_values();
        insert_values(conn, &desc, self.state_mut(), &values)
    }

    /// Update a live object. `false` means a concurrent writer changed
    /// or removed the row, or a unique violation.
    #[allow(clippy::result_large_err)]
    fn update(&mut self, conn: &mut LogicalConnection) -> Result<bool> {
        let desc = conn.entities().descriptor::<Self>()?;
        let values = self.column_values();
        update_values(conn, &desc, self.state_mut(), &values)
    }

    /// Delete a live object. The id is negated in memory, preserving
    /// identity for in-flight references; serial stays as it was.
    #[allow(clippy::result_large_err)]
    fn delete(&mut self, conn: &mut LogicalConnection) -> Result<bool> {
        let desc = conn.entities().descriptor::<Self>()?;
        delete_object(conn, &desc, self.state_mut())
    }

    /// Insert or update depending on lifecycle state: insert when
    /// virgin (id 0), insert adopting the reservation when id is
    /// negative, update otherwise.
    #[allow(clippy::result_large_err)]
    fn save(&mut self, conn: &mut LogicalConnection) -> Result<bool> {
        let desc = conn.entities().descriptor::<Self>()?;
        let values = self.column_values();
        save_values(conn, &desc, self.state_mut(), &values)
    }

    /// Write this object into a store that may or may not already hold
    /// it: update against the target's own serial, insert with the
    /// preassigned id when absent. The replication primitive.
    #[allow(clippy::result_large_err)]
    fn sync(&mut self, conn: &mut LogicalConnection) -> Result<bool> {
        let desc = conn.entities().descriptor::<Self>()?;
        let values = self.column_values();
        sync_values(conn, &desc, self.state_mut(), &values)
    }

    /// Delete every row of the table, returning how many went.
    #[allow(clippy::result_large_err)]
    fn delete_all(conn: &mut LogicalConnection) -> Result<u64> {
        let desc = conn.entities().descriptor::<Self>()?;
        delete_all_rows(conn, &desc)
    }
}

impl<T: Entity + 'static> Persistent for T {}

#[allow(clippy::result_large_err)]
fn hydrate<T: Entity>(desc: &EntityDescriptor, row: &Row) -> Result<T> {
    let mut entity = T::from_row(row)?;
    *entity.state_mut() = desc.state_from_row(row)?;
    Ok(entity)
}

/// Fetch one row by id, optionally locked.
#[allow(clippy::result_large_err)]
pub fn fetch_row(
    conn: &mut LogicalConnection,
    desc: &EntityDescriptor,
    id: i64,
    locked: bool,
) -> Result<Option<Row>> {
    if conn.is_remote() {
        let reply = conn.forward(RemoteOp::Entity(EntityOp::Select {
            class: desc.class(),
            id,
            locked,
        }))?;
        return match reply {
            OpReply::Fetched(row) => Ok(row),
            other => Err(other.unexpected("a fetched row")),
        };
    }
    let stmt = if locked {
        desc.select_locked_stmt()
    } else {
        desc.select_stmt()
    };
    let mut rows = conn.execute_query(stmt, &[Value::BigInt(id)])?;
    if rows.first() {
        Ok(Some(rows.fetch()?.clone()))
    } else {
        Ok(None)
    }
}

/// Counter hook run before the statement, inside the bracket.
#[allow(clippy::result_large_err)]
fn init_modification(
    conn: &mut LogicalConnection,
    desc: &EntityDescriptor,
    state: &mut PersistState,
) -> Result<()> {
    if desc.counts_changes() {
        let serial =
            counter::count_modification(conn, desc.table(), desc.uses_table_serial(), true)?;
        if desc.uses_table_serial() {
            state.table_serial = serial;
        }
    }
    Ok(())
}

/// Log hook run after a successful statement, still inside the
/// bracket.
#[allow(clippy::result_large_err)]
fn finish_modification(
    conn: &mut LogicalConnection,
    desc: &EntityDescriptor,
    state: &PersistState,
    log_as: ModType,
) -> Result<()> {
    if desc.logs_changes() {
        modlog::log_modification(conn, desc.class(), state.ident(), log_as)?;
    }
    Ok(())
}

fn rollback_quietly(conn: &mut LogicalConnection, started: bool) {
    if let Err(e) = conn.rollback(started) {
        tracing::warn!(error = %e, "rollback after failed operation");
    }
}

/// The shared mutation bracket: transaction, snapshot, log, commit.
#[allow(clippy::result_large_err)]
fn run_mutation(
    conn: &mut LogicalConnection,
    desc: &EntityDescriptor,
    state: &mut PersistState,
    log_as: ModType,
    op: impl FnOnce(&mut LogicalConnection, &mut PersistState) -> Result<bool>,
) -> Result<bool> {
    let started = conn.begin(desc.class())?;
    let snapshot = *state;
    match op(conn, state) {
        Ok(true) => {
            if let Err(e) = finish_modification(conn, desc, state, log_as) {
                *state = snapshot;
                rollback_quietly(conn, started);
                return Err(e);
            }
            match conn.commit(started) {
                Ok(()) => {
                    state.modified = false;
                    Ok(true)
                }
                Err(e) => {
                    // Commit already rolled itself back.
                    *state = snapshot;
                    Err(e)
                }
            }
        }
        Ok(false) => {
            *state = snapshot;
            conn.rollback(started)?;
            Ok(false)
        }
        Err(e) => {
            *state = snapshot;
            rollback_quietly(conn, started);
            Err(e)
        }
    }
}

/// Insert a virgin object's values.
///
/// An id of 0 draws a fresh identity from the connection's id source;
/// a negative id adopts its reservation; a positive id is kept as a
/// preassigned identity (replication and deferred log flushes rely on
/// this). The serial becomes 1. `false` reports a unique violation
/// with the pre-attempt id and serial restored.
#[allow(clippy::result_large_err)]
pub fn insert_values(
    conn: &mut LogicalConnection,
    desc: &EntityDescriptor,
    state: &mut PersistState,
    values: &[Value],
) -> Result<bool> {
    if conn.is_remote() {
        return forward_mutation(
            conn,
            EntityOp::Insert {
                class: desc.class(),
                state: *state,
                values: values.to_vec(),
            },
            state,
        );
    }
    if state.serial != 0 {
        return Err(Error::consistency(format!(
            "insert of an already-persisted {} (serial {})",
            desc.class(),
            state.serial
        )));
    }
    run_mutation(conn, desc, state, ModType::Insert, |conn, state| {
        if state.id == 0 {
            state.id = conn.next_id_for(desc.id_slot(), desc.class())?;
        } else if state.id < 0 {
            state.id = -state.id;
        }
        init_modification(conn, desc, state)?;
        state.serial = 1;

        let mut params = Vec::with_capacity(values.len() + 3);
        params.push(Value::BigInt(state.id));
        params.push(Value::BigInt(state.serial));
        if desc.uses_table_serial() {
            params.push(Value::BigInt(state.table_serial));
        }
        params.extend_from_slice(values);

        match conn.execute_update(desc.insert_stmt(), &params)? {
            ExecOutcome::Rows(n) => Ok(n > 0),
            ExecOutcome::UniqueViolation => Ok(false),
        }
    })
}

/// Update a live object's values under the optimistic predicate.
#[allow(clippy::result_large_err)]
pub fn update_values(
    conn: &mut LogicalConnection,
    desc: &EntityDescriptor,
    state: &mut PersistState,
    values: &[Value],
) -> Result<bool> {
    if conn.is_remote() {
        return forward_mutation(
            conn,
            EntityOp::Update {
                class: desc.class(),
                state: *state,
                values: values.to_vec(),
            },
            state,
        );
    }
    if !state.is_live() {
        return Err(Error::consistency(format!(
            "update of a {} that is not persistent (id {}, serial {})",
            desc.class(),
            state.id,
            state.serial
        )));
    }
    run_mutation(conn, desc, state, ModType::Update, |conn, state| {
        init_modification(conn, desc, state)?;
        let expected = state.serial;
        state.serial += 1;

        let mut params = Vec::with_capacity(values.len() + 4);
        params.push(Value::BigInt(state.serial));
        if desc.uses_table_serial() {
            params.push(Value::BigInt(state.table_serial));
        }
        params.extend_from_slice(values);
        params.push(Value::BigInt(state.id));
        params.push(Value::BigInt(expected));

        match conn.execute_update(desc.update_stmt(), &params)? {
            ExecOutcome::Rows(n) => Ok(n == 1),
            ExecOutcome::UniqueViolation => Ok(false),
        }
    })
}

/// Delete a live object under the optimistic predicate.
///
/// Never-persisted and already-deleted objects report `false` without
/// touching the store. On success the in-memory id flips negative and
/// the serial keeps its last value.
#[allow(clippy::result_large_err)]
pub fn delete_object(
    conn: &mut LogicalConnection,
    desc: &EntityDescriptor,
    state: &mut PersistState,
) -> Result<bool> {
    if conn.is_remote() {
        return forward_mutation(
            conn,
            EntityOp::Delete {
                class: desc.class(),
                state: *state,
            },
            state,
        );
    }
    if state.serial == 0 || state.id <= 0 {
        return Ok(false);
    }
    run_mutation(conn, desc, state, ModType::Delete, |conn, state| {
        init_modification(conn, desc, state)?;
        let params = [Value::BigInt(state.id), Value::BigInt(state.serial)];
        match conn.execute_update(desc.delete_stmt(), &params)? {
            ExecOutcome::Rows(1) => {
                state.id = -state.id;
                Ok(true)
            }
            ExecOutcome::Rows(_) => Ok(false),
            ExecOutcome::UniqueViolation => Ok(false),
        }
    })
}

/// Insert or update by lifecycle state.
#[allow(clippy::result_large_err)]
pub fn save_values(
    conn: &mut LogicalConnection,
    desc: &EntityDescriptor,
    state: &mut PersistState,
    values: &[Value],
) -> Result<bool> {
    if conn.is_remote() {
        return forward_mutation(
            conn,
            EntityOp::Save {
                class: desc.class(),
                state: *state,
                values: values.to_vec(),
            },
            state,
        );
    }
    if state.id >= 0 && state.serial > 0 {
        update_values(conn, desc, state, values)
    } else {
        insert_values(conn, desc, state, values)
    }
}

/// Write an object into a store of unknown content: adopt the serial
/// the target already has, or insert with the preassigned id.
#[allow(clippy::result_large_err)]
pub fn sync_values(
    conn: &mut LogicalConnection,
    desc: &EntityDescriptor,
    state: &mut PersistState,
    values: &[Value],
) -> Result<bool> {
    if conn.is_remote() {
        return forward_mutation(
            conn,
            EntityOp::Sync {
                class: desc.class(),
                state: *state,
                values: values.to_vec(),
            },
            state,
        );
    }
    let started = conn.begin(desc.class())?;
    let result = match fetch_row(conn, desc, state.ident(), false) {
        Ok(Some(row)) => match desc.state_from_row(&row) {
            Ok(target) => {
                state.id = target.id;
                state.serial = target.serial;
                state.table_serial = target.table_serial;
                update_values(conn, desc, state, values)
            }
            Err(e) => Err(e),
        },
        Ok(None) => {
            state.id = state.ident();
            state.serial = 0;
            insert_values(conn, desc, state, values)
        }
        Err(e) => Err(e),
    };
    match result {
        Ok(ok) => {
            conn.commit(started)?;
            Ok(ok)
        }
        Err(e) => {
            rollback_quietly(conn, started);
            Err(e)
        }
    }
}

/// Delete every row of the descriptor's table.
#[allow(clippy::result_large_err)]
pub fn delete_all_rows(conn: &mut LogicalConnection, desc: &EntityDescriptor) -> Result<u64> {
    if conn.is_remote() {
        let reply = conn.forward(RemoteOp::Entity(EntityOp::DeleteAll {
            class: desc.class(),
        }))?;
        return match reply {
            OpReply::Count(n) => Ok(n),
            other => Err(other.unexpected("a row count")),
        };
    }
    let started = conn.begin(desc.class())?;
    let result = (|| {
        if desc.counts_changes() {
            counter::count_modification(conn, desc.table(), false, true)?;
        }
        let deleted = match conn.execute_update(desc.delete_all_stmt(), &[])? {
            ExecOutcome::Rows(n) => n,
            ExecOutcome::UniqueViolation => 0,
        };
        if desc.logs_changes() {
            modlog::log_modification(conn, desc.class(), 0, ModType::DeleteAll)?;
        }
        Ok(deleted)
    })();
    match result {
        Ok(deleted) => {
            conn.commit(started)?;
            tracing::debug!(table = desc.table(), deleted, "deleted all rows");
            Ok(deleted)
        }
        Err(e) => {
            rollback_quietly(conn, started);
            Err(e)
        }
    }
}

/// Reserve an identity for a virgin object: the id becomes the
/// negated fresh identity, the object stays virgin.
#[allow(clippy::result_large_err)]
pub fn reserve_ident(
    conn: &mut LogicalConnection,
    desc: &EntityDescriptor,
    state: &mut PersistState,
) -> Result<()> {
    if conn.is_remote() {
        let reply = conn.forward(RemoteOp::Entity(EntityOp::ReserveId {
            class: desc.class(),
        }))?;
        return match reply {
            OpReply::Ident(id) => {
                state.id = id;
                Ok(())
            }
            other => Err(other.unexpected("a reserved identity")),
        };
    }
    if state.serial != 0 || state.id != 0 {
        return Err(Error::consistency(format!(
            "identity reservation on a {} that already has one (id {}, serial {})",
            desc.class(),
            state.id,
            state.serial
        )));
    }
    let ident = conn.next_id_for(desc.id_slot(), desc.class())?;
    state.id = -ident;
    Ok(())
}

/// Apply a forwarded mutation's reply: adopt the peer's resulting
/// state and translate its unique-violation signal into the local
/// sticky flag.
#[allow(clippy::result_large_err)]
fn forward_mutation(
    conn: &mut LogicalConnection,
    op: EntityOp,
    state: &mut PersistState,
) -> Result<bool> {
    let reply = conn.forward(RemoteOp::Entity(op))?;
    match reply {
        OpReply::Done {
            ok,
            unique_violation,
            state: resulting,
        } => {
            if unique_violation {
                conn.note_unique_violation();
            }
            *state = resulting;
            Ok(ok)
        }
        other => Err(other.unexpected("a mutation result")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ColumnDef, ColumnType};
    use crate::test_support::script_conn;

    #[derive(Debug, Default)]
    struct Account {
        state: PersistState,
        name: String,
        balance: i64,
    }

    impl Account {
        fn new(name: &str, balance: i64) -> Self {
            Self {
                state: PersistState::default(),
                name: name.to_string(),
                balance,
            }
        }
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

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                state: PersistState::default(),
                name: row.get_named("name")?,
                balance: row.get_named("balance")?,
            })
        }
    }

    /// Cache-invalidated, counted, logged variant.
    #[derive(Debug, Default)]
    struct Stock {
        state: PersistState,
        symbol: String,
    }

    const STOCK_COLUMNS: &[ColumnDef] = &[ColumnDef::new("symbol", ColumnType::Text)];

    impl Entity for Stock {
        const TABLE: &'static str = "stock";
        const USES_TABLE_SERIAL: bool = true;
        const COUNTS_CHANGES: bool = true;
        const LOGS_CHANGES: bool = true;

        fn columns() -> &'static [ColumnDef] {
            STOCK_COLUMNS
        }

        fn state(&self) -> &PersistState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut PersistState {
            &mut self.state
        }

        fn column_values(&self) -> Vec<Value> {
            vec![Value::Text(self.symbol.clone())]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                state: PersistState::default(),
                symbol: row.get_named("symbol")?,
            })
        }
    }

    fn account_row(id: i64, serial: i64, name: &str, balance: i64) -> Row {
        Row::new(
            vec![
                "id".to_string(),
                "serial".to_string(),
                "name".to_string(),
                "balance".to_string(),
            ],
            vec![
                Value::BigInt(id),
                Value::BigInt(serial),
                Value::Text(name.to_string()),
                Value::BigInt(balance),
            ],
        )
    }

    #[test]
    fn test_insert_assigns_id_and_serial_one() {
        let (script, mut conn) = script_conn();
        let mut account = Account::new("alice", 100);

        script.push_rows(1);
        assert!(account.insert(&mut conn).unwrap());
        assert_eq!(account.state().id, 1);
        assert_eq!(account.state().serial, 1);

        assert_eq!(
            script.calls(),
            vec![
                "autocommit:false".to_string(),
                "update:INSERT INTO account (id, serial, name, balance) VALUES (?, ?, ?, ?) \
                 [1, 1, alice, 100]"
                    .to_string(),
                "commit".to_string(),
                "autocommit:true".to_string(),
            ]
        );
    }

    #[test]
    fn test_insert_keeps_a_preassigned_id() {
        let (script, mut conn) = script_conn();
        let mut account = Account::new("bob", 5);
        account.state_mut().id = 42;

        script.push_rows(1);
        assert!(account.insert(&mut conn).unwrap());
        assert_eq!(account.state().id, 42);
        assert!(script.calls()[1].ends_with("[42, 1, bob, 5]"));
    }

    #[test]
    fn test_id_lifecycle_reserve_insert_delete() {
        let (script, mut conn) = script_conn();
        let mut account = Account::new("carol", 1);

        account.reserve_id(&mut conn).unwrap();
        assert_eq!(account.state().id, -1);
        assert_eq!(account.state().serial, 0);

        script.push_rows(1);
        assert!(account.insert(&mut conn).unwrap());
        assert_eq!(account.state().id, 1);
        assert_eq!(account.state().serial, 1);

        script.push_rows(1);
        assert!(account.delete(&mut conn).unwrap());
        assert_eq!(account.state().id, -1);
        // Delete leaves the serial untouched.
        assert_eq!(account.state().serial, 1);
    }

    #[test]
    fn test_double_reservation_is_refused() {
        let (_script, mut conn) = script_conn();
        let mut account = Account::new("carol", 1);

        account.reserve_id(&mut conn).unwrap();
        let err = account.reserve_id(&mut conn).unwrap_err();
        assert!(matches!(err, Error::Consistency(_)));
    }

    #[test]
    fn test_insert_unique_violation_restores_the_snapshot() {
        let (script, mut conn) = script_conn();
        let mut account = Account::new("dupe", 0);

        script.push_unique_violation();
        assert!(!account.insert(&mut conn).unwrap());

        // Pre-attempt state is back, the flag latched, the bracket
        // rolled back.
        assert_eq!(account.state().id, 0);
        assert_eq!(account.state().serial, 0);
        assert!(conn.take_unique_violation());
        assert!(script.calls().contains(&"rollback".to_string()));
        assert!(!script.calls().contains(&"commit".to_string()));
    }

    #[test]
    fn test_insert_of_persisted_object_is_refused() {
        let (_script, mut conn) = script_conn();
        let mut account = Account::new("eve", 0);
        account.state_mut().id = 3;
        account.state_mut().serial = 2;

        let err = account.insert(&mut conn).unwrap_err();
        assert!(matches!(err, Error::Consistency(_)));
    }

    #[test]
    fn test_update_bumps_serial_under_the_optimistic_predicate() {
        let (script, mut conn) = script_conn();
        let mut account = Account::new("frank", 250);
        account.state_mut().id = 7;
        account.state_mut().serial = 3;

        script.push_rows(1);
        assert!(account.update(&mut conn).unwrap());
        assert_eq!(account.state().serial, 4);

        assert_eq!(
            script.calls()[1],
            "update:UPDATE account SET serial = ?, name = ?, balance = ? \
             WHERE id = ? AND serial = ? [4, frank, 250, 7, 3]"
        );
    }

    #[test]
    fn test_update_lost_race_reports_false_and_restores_serial() {
        let (script, mut conn) = script_conn();
        let mut account = Account::new("grace", 9);
        account.state_mut().id = 7;
        account.state_mut().serial = 3;

        script.push_rows(0);
        assert!(!account.update(&mut conn).unwrap());
        assert_eq!(account.state().serial, 3);
        assert!(!conn.unique_violation());
        assert!(script.calls().contains(&"rollback".to_string()));
    }

    #[test]
    fn test_update_of_virgin_object_is_refused() {
        let (_script, mut conn) = script_conn();
        let mut account = Account::new("harry", 1);

        let err = account.update(&mut conn).unwrap_err();
        assert!(matches!(err, Error::Consistency(_)));
    }

    #[test]
    fn test_delete_of_unpersisted_object_is_a_quiet_false() {
        let (script, mut conn) = script_conn();

        let mut virgin = Account::new("ida", 0);
        assert!(!virgin.delete(&mut conn).unwrap());

        let mut deleted = Account::new("ida", 0);
        deleted.state_mut().id = -4;
        deleted.state_mut().serial = 2;
        assert!(!deleted.delete(&mut conn).unwrap());

        assert!(script.calls().is_empty());
    }

    #[test]
    fn test_save_dispatches_on_lifecycle_state() {
        let (script, mut conn) = script_conn();

        // Virgin: insert.
        let mut fresh = Account::new("jan", 10);
        script.push_rows(1);
        assert!(fresh.save(&mut conn).unwrap());
        assert!(script.calls()[1].starts_with("update:INSERT INTO account"));

        // Reserved: insert adopting the reservation.
        let mut reserved = Account::new("kim", 20);
        reserved.state_mut().id = -9;
        script.push_rows(1);
        assert!(reserved.save(&mut conn).unwrap());
        assert_eq!(reserved.state().id, 9);

        // Live: update.
        let mut live = Account::new("lou", 30);
        live.state_mut().id = 5;
        live.state_mut().serial = 1;
        script.push_rows(1);
        assert!(live.save(&mut conn).unwrap());
        assert!(script
            .calls()
            .last()
            .is_some_and(|c| c == "autocommit:true"));
        assert_eq!(live.state().serial, 2);
    }

    #[test]
    fn test_select_hydrates_state_and_fields() {
        let (script, mut conn) = script_conn();

        script.push_query(vec![account_row(7, 3, "mia", 75)]);
        let account = Account::select(&mut conn, 7).unwrap().unwrap();
        assert_eq!(account.state().id, 7);
        assert_eq!(account.state().serial, 3);
        assert_eq!(account.name, "mia");
        assert_eq!(account.balance, 75);

        script.push_query(Vec::new());
        assert!(Account::select(&mut conn, 8).unwrap().is_none());

        let calls = script.calls();
        assert_eq!(
            calls[0],
            "query:SELECT id, serial, name, balance FROM account WHERE id = ? [7]"
        );
    }

    #[test]
    fn test_select_locked_uses_the_locking_statement() {
        let (script, mut conn) = script_conn();

        script.push_query(vec![account_row(7, 3, "nina", 1)]);
        Account::select_locked(&mut conn, 7).unwrap().unwrap();

        assert_eq!(
            script.calls()[0],
            "query:SELECT id, serial, name, balance FROM account WHERE id = ? FOR UPDATE [7]"
        );
    }

    #[test]
    fn test_sync_adopts_the_target_serial_when_present() {
        let (script, mut conn) = script_conn();
        let mut account = Account::new("olga", 500);
        account.state_mut().id = 7;
        account.state_mut().serial = 99; // source-side serial, ignored

        script.push_query(vec![account_row(7, 9, "stale", 1)]);
        script.push_rows(1);
        assert!(account.sync(&mut conn).unwrap());
        assert_eq!(account.state().serial, 10);

        let update = script
            .calls()
            .into_iter()
            .find(|c| c.contains("UPDATE account"))
            .unwrap();
        assert!(update.ends_with("[10, olga, 500, 7, 9]"));
    }

    #[test]
    fn test_sync_inserts_with_preassigned_id_when_absent() {
        let (script, mut conn) = script_conn();
        let mut account = Account::new("pete", 12);
        account.state_mut().id = 7;
        account.state_mut().serial = 99;

        script.push_query(Vec::new());
        script.push_rows(1);
        assert!(account.sync(&mut conn).unwrap());
        assert_eq!(account.state().id, 7);
        assert_eq!(account.state().serial, 1);

        let insert = script
            .calls()
            .into_iter()
            .find(|c| c.contains("INSERT INTO account"))
            .unwrap();
        assert!(insert.ends_with("[7, 1, pete, 12]"));
    }

    #[test]
    fn test_delete_all_reports_the_row_count() {
        let (script, mut conn) = script_conn();

        script.push_rows(5);
        assert_eq!(Account::delete_all(&mut conn).unwrap(), 5);
        assert!(script
            .calls()
            .iter()
            .any(|c| c == "update:DELETE FROM account []"));
    }

    #[test]
    fn test_counted_insert_stamps_the_table_serial() {
        let (script, mut conn) = script_conn();
        let mut stock = Stock {
            state: PersistState::default(),
            symbol: "ACME".to_string(),
        };

        script.push_rows(1); // table counter bump
        script.push_query(vec![Row::new(
            vec!["serial".to_string()],
            vec![Value::BigInt(4)],
        )]);
        script.push_rows(1); // master bump
        script.push_rows(1); // the insert itself
        script.push_rows(1); // modlog BEGIN marker
        script.push_rows(1); // modlog INSERT record

        assert!(stock.insert(&mut conn).unwrap());
        assert_eq!(stock.state().table_serial, 4);

        let calls = script.calls();
        let insert = calls
            .iter()
            .find(|c| c.contains("INSERT INTO stock"))
            .unwrap();
        assert!(insert.contains("(id, serial, tableserial, symbol)"));
        assert!(insert.ends_with("[1, 1, 4, ACME]"));

        let log = calls
            .iter()
            .find(|c| c.contains("INSERT INTO modlog") && c.contains("INSERT,"))
            .unwrap();
        assert!(log.contains("stock"));
    }

    #[test]
    fn test_mutation_inside_callers_transaction_does_not_commit() {
        let (script, mut conn) = script_conn();
        let started = conn.begin("outer").unwrap();

        let mut account = Account::new("quinn", 3);
        script.push_rows(1);
        assert!(account.insert(&mut conn).unwrap());

        assert!(conn.in_transaction());
        assert!(!script.calls().contains(&"commit".to_string()));
        conn.commit(started).unwrap();
        assert!(script.calls().contains(&"commit".to_string()));
    }
}
