//! Persistent entity contract and per-type descriptors.
//!
//! An entity is a struct mapped to one watched table. Every entity embeds
//! a [`PersistState`] carrying its identity and version; the sign of the
//! id encodes the lifecycle (0 = never assigned, positive = live,
//! negative = reserved or deleted) and the serial is the optimistic
//! concurrency version (0 = never persisted).
//!
//! Statement text is not generated per call. Each type gets one
//! [`EntityDescriptor`] the first time it is used against a registry: the
//! descriptor renders the per-backend SQL once, registers it with the
//! process statement registry, and allocates the type's id-source slot.
//! The [`EntityRegistry`] keys descriptors both by Rust type and by the
//! persisted class name, so modification-log replay and remote dispatch
//! can resolve a type from a stored string without reflection.

use serde::{Deserialize, Serialize};
use sqlentity_core::backend::Backend;
use sqlentity_core::context::Context;
use sqlentity_core::error::Error;
use sqlentity_core::row::Row;
use sqlentity_core::statement::{ConcurrencyMode, StatementDesc, StatementId};
use sqlentity_core::value::Value;
use sqlentity_core::Result;

use parking_lot::RwLock;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

/// Column type of a mapped (non-state) entity column.
///
/// Timestamps are stored as epoch microseconds in a BIGINT column, so
/// they compare and replicate without timezone handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    Int,
    BigInt,
    Double,
    Text,
    Bytes,
    Timestamp,
}

impl ColumnType {
    /// SQL type name for DDL generation on the given backend.
    pub fn sql(self, backend: Backend) -> &'static str {
        match self {
            ColumnType::Bool => match backend {
                Backend::Mssql => "BIT",
                _ => "BOOLEAN",
            },
            ColumnType::Int => "INTEGER",
            ColumnType::BigInt | ColumnType::Timestamp => "BIGINT",
            ColumnType::Double => match backend {
                Backend::Mysql => "DOUBLE",
                Backend::Mssql => "FLOAT",
                _ => "DOUBLE PRECISION",
            },
            ColumnType::Text => match backend {
                Backend::Mssql => "VARCHAR(MAX)",
                _ => "TEXT",
            },
            ColumnType::Bytes => match backend {
                Backend::Postgres => "BYTEA",
                Backend::Mssql => "VARBINARY(MAX)",
                _ => "BLOB",
            },
        }
    }
}

/// Definition of one mapped column.
#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    /// Database column name
    pub name: &'static str,
    /// Column type
    pub ty: ColumnType,
    /// Whether the column admits NULL
    pub nullable: bool,
}

impl ColumnDef {
    /// Create a non-nullable column definition.
    pub const fn new(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: false,
        }
    }

    /// Mark the column nullable.
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Identity and version state embedded in every entity.
///
/// `id` magnitude is the identity, its sign the lifecycle state; `serial`
/// is the per-object version driving the `id = ? AND serial = ?`
/// optimistic predicate. `table_serial` is only meaningful for types with
/// `USES_TABLE_SERIAL`, `modified` only for `TRACKS_MODIFIED` types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistState {
    pub id: i64,
    pub serial: i64,
    pub table_serial: i64,
    pub modified: bool,
}

impl PersistState {
    /// The identity regardless of lifecycle state.
    pub fn ident(&self) -> i64 {
        self.id.abs()
    }

    /// True until the first successful insert.
    pub fn is_virgin(&self) -> bool {
        self.serial == 0
    }

    /// Persisted and not deleted.
    pub fn is_live(&self) -> bool {
        self.id > 0 && self.serial > 0
    }

    /// Id reserved via `reserve_id` but never inserted.
    pub fn is_reserved(&self) -> bool {
        self.id < 0 && self.serial == 0
    }

    /// Was persisted, then deleted. The identity survives for in-flight
    /// references and log replay.
    pub fn is_deleted(&self) -> bool {
        self.id < 0 && self.serial > 0
    }

    /// Set the dirty flag. Only meaningful for `TRACKS_MODIFIED` types.
    pub fn mark_modified(&mut self) {
        self.modified = true;
    }
}

/// Contract for structs persisted through a logical connection.
///
/// `columns()` and `column_values()` list the *data* columns in matching
/// order; the state columns (`id`, `serial` and, for opted-in types,
/// `tableserial`) are handled by the persistence layer. `from_row` reads
/// only data columns for the same reason.
pub trait Entity: Sized + Send {
    /// Mapped table name.
    const TABLE: &'static str;

    /// Persisted class name, stored in the modification log and used to
    /// resolve the type during replay. Defaults to the table name.
    const NAME: &'static str = Self::TABLE;

    /// The table carries a `tableserial` column stamped on every write,
    /// enabling per-row change detection and deletion gap scans.
    const USES_TABLE_SERIAL: bool = false;

    /// Instances carry a dirty flag managed by the application.
    const TRACKS_MODIFIED: bool = false;

    /// Mutations bump the table's modification counter (and the master
    /// counter) so pollers notice the change.
    const COUNTS_CHANGES: bool = false;

    /// Mutations append a modification-log record.
    const LOGS_CHANGES: bool = false;

    /// Data column definitions, in binding order.
    fn columns() -> &'static [ColumnDef];

    fn state(&self) -> &PersistState;

    fn state_mut(&mut self) -> &mut PersistState;

    /// Data column values, in `columns()` order.
    fn column_values(&self) -> Vec<Value>;

    /// Build an instance from a fetched row. Only data columns need to
    /// be read; the caller overlays the state columns afterwards.
    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row) -> Result<Self>;
}

/// Per-type persistence plan: rendered SQL, registered statement ids and
/// the flags copied out of the entity type.
///
/// Built once per type per registry and shared behind an `Arc`.
pub struct EntityDescriptor {
    class: &'static str,
    table: &'static str,
    columns: &'static [ColumnDef],
    uses_table_serial: bool,
    tracks_modified: bool,
    counts_changes: bool,
    logs_changes: bool,
    id_slot: usize,
    select_stmt: StatementId,
    select_locked_stmt: StatementId,
    insert_stmt: StatementId,
    update_stmt: StatementId,
    delete_stmt: StatementId,
    delete_all_stmt: StatementId,
}

impl EntityDescriptor {
    fn build<T: Entity>(context: &Context, backend: Backend) -> Self {
        let columns = T::columns();

        let mut names: Vec<&'static str> = vec!["id", "serial"];
        if T::USES_TABLE_SERIAL {
            names.push("tableserial");
        }
        names.extend(columns.iter().map(|c| c.name));
        let select_list = names.join(", ");

        let table = T::TABLE;

        let select_sql = format!(
            "SELECT {select_list} FROM {table} WHERE id = {}",
            backend.placeholder(1)
        );
        let select_locked_sql = format!(
            "SELECT {select_list} FROM {table}{hint} WHERE id = {p}{suffix}",
            hint = backend.lock_hint(),
            p = backend.placeholder(1),
            suffix = backend.for_update_suffix(),
        );

        let values_list = (1..=names.len())
            .map(|i| backend.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ");
        let insert_sql = format!("INSERT INTO {table} ({select_list}) VALUES ({values_list})");

        // Bind order: new serial, [new tableserial], data columns, id,
        // expected serial.
        let mut set_parts = Vec::with_capacity(columns.len() + 2);
        let mut p = 0;
        let mut next = || {
            p += 1;
            backend.placeholder(p)
        };
        set_parts.push(format!("serial = {}", next()));
        if T::USES_TABLE_SERIAL {
            set_parts.push(format!("tableserial = {}", next()));
        }
        for c in columns {
            set_parts.push(format!("{} = {}", c.name, next()));
        }
        let update_sql = format!(
            "UPDATE {table} SET {} WHERE id = {} AND serial = {}",
            set_parts.join(", "),
            next(),
            next()
        );

        let delete_sql = format!(
            "DELETE FROM {table} WHERE id = {} AND serial = {}",
            backend.placeholder(1),
            backend.placeholder(2)
        );
        let delete_all_sql = format!("DELETE FROM {table}");

        Self {
            class: T::NAME,
            table,
            columns,
            uses_table_serial: T::USES_TABLE_SERIAL,
            tracks_modified: T::TRACKS_MODIFIED,
            counts_changes: T::COUNTS_CHANGES,
            logs_changes: T::LOGS_CHANGES,
            id_slot: context.allocate_id_slot(),
            select_stmt: context.register_statement(StatementDesc::new(select_sql)),
            select_locked_stmt: context.register_statement(
                StatementDesc::new(select_locked_sql)
                    .with_concurrency(ConcurrencyMode::Updatable),
            ),
            insert_stmt: context.register_statement(StatementDesc::new(insert_sql)),
            update_stmt: context.register_statement(StatementDesc::new(update_sql)),
            delete_stmt: context.register_statement(StatementDesc::new(delete_sql)),
            delete_all_stmt: context.register_statement(StatementDesc::new(delete_all_sql)),
        }
    }

    pub fn class(&self) -> &'static str {
        self.class
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn columns(&self) -> &'static [ColumnDef] {
        self.columns
    }

    pub fn uses_table_serial(&self) -> bool {
        self.uses_table_serial
    }

    pub fn tracks_modified(&self) -> bool {
        self.tracks_modified
    }

    pub fn counts_changes(&self) -> bool {
        self.counts_changes
    }

    pub fn logs_changes(&self) -> bool {
        self.logs_changes
    }

    /// Connection-local id-source slot for this type.
    pub fn id_slot(&self) -> usize {
        self.id_slot
    }

    pub fn select_stmt(&self) -> StatementId {
        self.select_stmt
    }

    pub fn select_locked_stmt(&self) -> StatementId {
        self.select_locked_stmt
    }

    pub fn insert_stmt(&self) -> StatementId {
        self.insert_stmt
    }

    pub fn update_stmt(&self) -> StatementId {
        self.update_stmt
    }

    pub fn delete_stmt(&self) -> StatementId {
        self.delete_stmt
    }

    pub fn delete_all_stmt(&self) -> StatementId {
        self.delete_all_stmt
    }

    /// Read the state columns out of a fetched row.
    #[allow(clippy::result_large_err)]
    pub fn state_from_row(&self, row: &Row) -> Result<PersistState> {
        Ok(PersistState {
            id: row.get_named("id")?,
            serial: row.get_named("serial")?,
            table_serial: if self.uses_table_serial {
                row.get_named("tableserial")?
            } else {
                0
            },
            modified: false,
        })
    }

    /// Read the data column values out of a fetched row, in `columns()`
    /// order.
    #[allow(clippy::result_large_err)]
    pub fn values_from_row(&self, row: &Row) -> Result<Vec<Value>> {
        self.columns
            .iter()
            .map(|c| row.get_named::<Value>(c.name))
            .collect()
    }
}

impl std::fmt::Debug for EntityDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("class", &self.class)
            .field("table", &self.table)
            .field("columns", &self.columns.len())
            .field("id_slot", &self.id_slot)
            .finish_non_exhaustive()
    }
}

/// Registry of entity descriptors for one database, keyed by Rust type
/// and by persisted class name.
///
/// Shared by every logical connection of a database. Descriptors are
/// built lazily on first use and never rebuilt; a second type claiming
/// an already-registered class name is a consistency error.
pub struct EntityRegistry {
    context: Arc<Context>,
    backend: Backend,
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    by_type: HashMap<TypeId, Arc<EntityDescriptor>>,
    by_class: HashMap<&'static str, Arc<EntityDescriptor>>,
}

impl EntityRegistry {
    pub fn new(context: Arc<Context>, backend: Backend) -> Arc<Self> {
        Arc::new(Self {
            context,
            backend,
            inner: RwLock::new(RegistryInner::default()),
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Descriptor for `T`, building and registering it on first use.
    #[allow(clippy::result_large_err)]
    pub fn descriptor<T: Entity + 'static>(&self) -> Result<Arc<EntityDescriptor>> {
        let key = TypeId::of::<T>();
        if let Some(desc) = self.inner.read().by_type.get(&key) {
            return Ok(Arc::clone(desc));
        }

        let built = Arc::new(EntityDescriptor::build::<T>(&self.context, self.backend));
        let mut inner = self.inner.write();
        if let Some(desc) = inner.by_type.get(&key) {
            // Raced with another thread; keep the first build.
            return Ok(Arc::clone(desc));
        }
        if inner.by_class.contains_key(built.class) {
            return Err(Error::consistency(format!(
                "entity class '{}' is already registered to a different type",
                built.class
            )));
        }
        inner.by_type.insert(key, Arc::clone(&built));
        inner.by_class.insert(built.class, Arc::clone(&built));
        tracing::debug!(class = built.class, table = built.table, "registered entity");
        Ok(built)
    }

    /// Resolve a descriptor from a persisted class name. Returns `None`
    /// for classes never registered in this process.
    pub fn by_class(&self, class: &str) -> Option<Arc<EntityDescriptor>> {
        self.inner.read().by_class.get(class).map(Arc::clone)
    }

    /// Number of registered entity types.
    pub fn len(&self) -> usize {
        self.inner.read().by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("backend", &self.backend)
            .field("entities", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Account {
        state: PersistState,
        name: String,
        balance: i64,
    }

    impl Entity for Account {
        const TABLE: &'static str = "account";
        const USES_TABLE_SERIAL: bool = true;
        const COUNTS_CHANGES: bool = true;

        fn columns() -> &'static [ColumnDef] {
            static COLUMNS: &[ColumnDef] = &[
                ColumnDef::new("name", ColumnType::Text),
                ColumnDef::new("balance", ColumnType::BigInt),
            ];
            COLUMNS
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

    #[derive(Debug)]
    struct Plain {
        state: PersistState,
    }

    impl Entity for Plain {
        const TABLE: &'static str = "plain";

        fn columns() -> &'static [ColumnDef] {
            &[]
        }

        fn state(&self) -> &PersistState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut PersistState {
            &mut self.state
        }

        fn column_values(&self) -> Vec<Value> {
            Vec::new()
        }

        fn from_row(_row: &Row) -> Result<Self> {
            Ok(Self {
                state: PersistState::default(),
            })
        }
    }

    struct PlainAlias;

    impl Entity for PlainAlias {
        const TABLE: &'static str = "plain_alias";
        const NAME: &'static str = "plain";

        fn columns() -> &'static [ColumnDef] {
            &[]
        }

        fn state(&self) -> &PersistState {
            unreachable!()
        }

        fn state_mut(&mut self) -> &mut PersistState {
            unreachable!()
        }

        fn column_values(&self) -> Vec<Value> {
            Vec::new()
        }

        fn from_row(_row: &Row) -> Result<Self> {
            Ok(Self)
        }
    }

    #[test]
    fn test_state_lifecycle_predicates() {
        let mut state = PersistState::default();
        assert!(state.is_virgin());
        assert!(!state.is_live());
        assert_eq!(state.ident(), 0);

        state.id = -41;
        assert!(state.is_reserved());
        assert_eq!(state.ident(), 41);

        state.id = 41;
        state.serial = 1;
        assert!(state.is_live());
        assert!(!state.is_virgin());

        state.id = -41;
        assert!(state.is_deleted());
        assert!(!state.is_reserved());
        assert_eq!(state.ident(), 41);
        assert_eq!(state.serial, 1);
    }

    #[test]
    fn test_descriptor_sql_memory_backend() {
        let registry = EntityRegistry::new(Context::new(), Backend::Memory);
        let desc = registry.descriptor::<Account>().unwrap();
        let statements = registry.context().statements();

        let select = statements.describe(desc.select_stmt()).unwrap();
        assert_eq!(
            select.sql,
            "SELECT id, serial, tableserial, name, balance FROM account WHERE id = ?"
        );

        let locked = statements.describe(desc.select_locked_stmt()).unwrap();
        assert_eq!(
            locked.sql,
            "SELECT id, serial, tableserial, name, balance FROM account WHERE id = ? FOR UPDATE"
        );
        assert_eq!(locked.concurrency, ConcurrencyMode::Updatable);

        let insert = statements.describe(desc.insert_stmt()).unwrap();
        assert_eq!(
            insert.sql,
            "INSERT INTO account (id, serial, tableserial, name, balance) VALUES (?, ?, ?, ?, ?)"
        );

        let update = statements.describe(desc.update_stmt()).unwrap();
        assert_eq!(
            update.sql,
            "UPDATE account SET serial = ?, tableserial = ?, name = ?, balance = ? \
             WHERE id = ? AND serial = ?"
        );

        let delete = statements.describe(desc.delete_stmt()).unwrap();
        assert_eq!(delete.sql, "DELETE FROM account WHERE id = ? AND serial = ?");

        let delete_all = statements.describe(desc.delete_all_stmt()).unwrap();
        assert_eq!(delete_all.sql, "DELETE FROM account");
    }

    #[test]
    fn test_descriptor_sql_postgres_placeholders() {
        let registry = EntityRegistry::new(Context::new(), Backend::Postgres);
        let desc = registry.descriptor::<Account>().unwrap();
        let statements = registry.context().statements();

        let update = statements.describe(desc.update_stmt()).unwrap();
        assert_eq!(
            update.sql,
            "UPDATE account SET serial = $1, tableserial = $2, name = $3, balance = $4 \
             WHERE id = $5 AND serial = $6"
        );

        let insert = statements.describe(desc.insert_stmt()).unwrap();
        assert_eq!(
            insert.sql,
            "INSERT INTO account (id, serial, tableserial, name, balance) \
             VALUES ($1, $2, $3, $4, $5)"
        );
    }

    #[test]
    fn test_descriptor_without_table_serial() {
        let registry = EntityRegistry::new(Context::new(), Backend::Memory);
        let desc = registry.descriptor::<Plain>().unwrap();
        let statements = registry.context().statements();

        let select = statements.describe(desc.select_stmt()).unwrap();
        assert_eq!(select.sql, "SELECT id, serial FROM plain WHERE id = ?");

        let update = statements.describe(desc.update_stmt()).unwrap();
        assert_eq!(
            update.sql,
            "UPDATE plain SET serial = ? WHERE id = ? AND serial = ?"
        );
    }

    #[test]
    fn test_registry_builds_once_and_resolves_by_class() {
        let registry = EntityRegistry::new(Context::new(), Backend::Memory);

        let first = registry.descriptor::<Account>().unwrap();
        let second = registry.descriptor::<Account>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        let by_class = registry.by_class("account").unwrap();
        assert!(Arc::ptr_eq(&first, &by_class));
        assert!(registry.by_class("unknown").is_none());
    }

    #[test]
    fn test_registry_rejects_duplicate_class_name() {
        let registry = EntityRegistry::new(Context::new(), Backend::Memory);
        registry.descriptor::<Plain>().unwrap();

        let err = registry.descriptor::<PlainAlias>().unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_distinct_types_get_distinct_id_slots() {
        let registry = EntityRegistry::new(Context::new(), Backend::Memory);
        let a = registry.descriptor::<Account>().unwrap();
        let b = registry.descriptor::<Plain>().unwrap();
        assert_ne!(a.id_slot(), b.id_slot());
    }

    #[test]
    fn test_state_and_values_from_row() {
        let registry = EntityRegistry::new(Context::new(), Backend::Memory);
        let desc = registry.descriptor::<Account>().unwrap();

        let row = Row::new(
            vec![
                "id".to_string(),
                "serial".to_string(),
                "tableserial".to_string(),
                "name".to_string(),
                "balance".to_string(),
            ],
            vec![
                Value::BigInt(7),
                Value::BigInt(3),
                Value::BigInt(12),
                Value::Text("savings".to_string()),
                Value::BigInt(250),
            ],
        );

        let state = desc.state_from_row(&row).unwrap();
        assert_eq!(state.id, 7);
        assert_eq!(state.serial, 3);
        assert_eq!(state.table_serial, 12);

        let values = desc.values_from_row(&row).unwrap();
        assert_eq!(
            values,
            vec![Value::Text("savings".to_string()), Value::BigInt(250)]
        );

        let account = Account::from_row(&row).unwrap();
        assert_eq!(account.name, "savings");
        assert_eq!(account.balance, 250);
    }

    #[test]
    fn test_column_type_ddl_names() {
        assert_eq!(ColumnType::Text.sql(Backend::Postgres), "TEXT");
        assert_eq!(ColumnType::Text.sql(Backend::Mssql), "VARCHAR(MAX)");
        assert_eq!(ColumnType::Bytes.sql(Backend::Postgres), "BYTEA");
        assert_eq!(ColumnType::Timestamp.sql(Backend::Mysql), "BIGINT");
        assert_eq!(ColumnType::Double.sql(Backend::Mysql), "DOUBLE");
        assert_eq!(ColumnType::Bool.sql(Backend::Mssql), "BIT");
    }
}
