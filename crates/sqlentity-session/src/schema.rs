//! DDL for the tables the persistence layer relies on.
//!
//! Entity tables come straight from their descriptors; the counter,
//! identity and log tables have fixed shapes. The statements are plain
//! `CREATE TABLE` without existence guards, intended for one-time
//! setup of a fresh store (tests lean on this for the in-memory
//! backend).

use crate::counter::MASTER_NAME;
use crate::entity::EntityDescriptor;
use crate::logical::LogicalConnection;
use crate::modlog::LogRecord;
use sqlentity_core::backend::Backend;
use sqlentity_core::driver::ExecOutcome;
use sqlentity_core::statement::StatementDesc;
use sqlentity_core::Result;

/// Default name of the id-source block table.
pub const IDENTITY_TABLE: &str = "identity";

/// Key columns need an indexable text type on backends where plain
/// TEXT cannot carry a primary key.
fn key_text_type(backend: Backend) -> &'static str {
    match backend {
        Backend::Mysql | Backend::Mssql => "VARCHAR(255)",
        Backend::Postgres | Backend::Memory => "TEXT",
    }
}

/// `CREATE TABLE` for one entity's descriptor: id primary key, serial,
/// the table serial when the type uses one, then the data columns.
pub fn create_table_sql(desc: &EntityDescriptor, backend: Backend) -> String {
    let mut sql = format!(
        "CREATE TABLE {} (id BIGINT PRIMARY KEY, serial BIGINT NOT NULL",
        desc.table()
    );
    if desc.uses_table_serial() {
        sql.push_str(", tableserial BIGINT NOT NULL");
    }
    for column in desc.columns() {
        sql.push_str(", ");
        sql.push_str(column.name);
        sql.push(' ');
        sql.push_str(column.ty.sql(backend));
        if !column.nullable {
            sql.push_str(" NOT NULL");
        }
    }
    sql.push(')');
    sql
}

/// The modification-counter table. Keyed by table name, not id: the
/// master row sits at id 0 and per-table rows race their creation on
/// this key.
pub fn counter_table_sql(backend: Backend) -> String {
    format!(
        "CREATE TABLE modcounter (id BIGINT NOT NULL, serial BIGINT NOT NULL, \
         tablename {} PRIMARY KEY)",
        key_text_type(backend)
    )
}

/// The block-allocation table behind `table:` id sources.
pub fn identity_table_sql(backend: Backend, table: &str) -> String {
    format!(
        "CREATE TABLE {} (class {} PRIMARY KEY, nextid BIGINT NOT NULL)",
        table,
        key_text_type(backend)
    )
}

/// Seed the master counter row at serial 0.
pub fn seed_master_row_sql() -> String {
    format!("INSERT INTO modcounter (id, serial, tablename) VALUES (0, 0, '{MASTER_NAME}')")
}

/// Create one entity table.
#[allow(clippy::result_large_err)]
pub fn create_entity_table(conn: &mut LogicalConnection, desc: &EntityDescriptor) -> Result<()> {
    let sql = create_table_sql(desc, conn.backend());
    let stmt = conn.prepare_statement(StatementDesc::new(sql));
    conn.execute_update(stmt, &[])?;
    tracing::debug!(table = desc.table(), "entity table created");
    Ok(())
}

/// Create the counter, identity and log tables and seed the master
/// row. An already-seeded master row is tolerated.
#[allow(clippy::result_large_err)]
pub fn create_support_tables(conn: &mut LogicalConnection) -> Result<()> {
    let backend = conn.backend();

    let stmt = conn.prepare_statement(StatementDesc::new(counter_table_sql(backend)));
    conn.execute_update(stmt, &[])?;

    let stmt = conn.prepare_statement(StatementDesc::new(identity_table_sql(
        backend,
        IDENTITY_TABLE,
    )));
    conn.execute_update(stmt, &[])?;

    let modlog = conn.entities().descriptor::<LogRecord>()?;
    create_entity_table(conn, &modlog)?;

    let stmt = conn.prepare_statement(StatementDesc::new(seed_master_row_sql()));
    match conn.execute_update(stmt, &[])? {
        ExecOutcome::Rows(_) => {}
        ExecOutcome::UniqueViolation => {
            conn.take_unique_violation();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ColumnDef, ColumnType, Entity, PersistState};
    use crate::test_support::script_conn;
    use sqlentity_core::row::Row;
    use sqlentity_core::value::Value;

    #[derive(Debug, Default)]
    struct Part {
        state: PersistState,
        label: String,
        weight: Option<f64>,
    }

    const PART_COLUMNS: &[ColumnDef] = &[
        ColumnDef::new("label", ColumnType::Text),
        ColumnDef::new("weight", ColumnType::Double).nullable(),
    ];

    impl Entity for Part {
        const TABLE: &'static str = "part";
        const USES_TABLE_SERIAL: bool = true;

        fn columns() -> &'static [ColumnDef] {
            PART_COLUMNS
        }

        fn state(&self) -> &PersistState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut PersistState {
            &mut self.state
        }

        fn column_values(&self) -> Vec<Value> {
            vec![
                Value::Text(self.label.clone()),
                match self.weight {
                    Some(w) => Value::Double(w),
                    None => Value::Null,
                },
            ]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                state: PersistState::default(),
                label: row.get_named("label")?,
                weight: row.get_named("weight")?,
            })
        }
    }

    #[test]
    fn test_entity_table_ddl() {
        let (_script, conn) = script_conn();
        let desc = conn.entities().descriptor::<Part>().unwrap();

        assert_eq!(
            create_table_sql(&desc, Backend::Memory),
            "CREATE TABLE part (id BIGINT PRIMARY KEY, serial BIGINT NOT NULL, \
             tableserial BIGINT NOT NULL, label TEXT NOT NULL, weight DOUBLE PRECISION)"
        );
        assert_eq!(
            create_table_sql(&desc, Backend::Mssql),
            "CREATE TABLE part (id BIGINT PRIMARY KEY, serial BIGINT NOT NULL, \
             tableserial BIGINT NOT NULL, label VARCHAR(MAX) NOT NULL, weight FLOAT)"
        );
    }

    #[test]
    fn test_support_table_ddl_varies_key_type_by_backend() {
        assert_eq!(
            counter_table_sql(Backend::Postgres),
            "CREATE TABLE modcounter (id BIGINT NOT NULL, serial BIGINT NOT NULL, \
             tablename TEXT PRIMARY KEY)"
        );
        assert_eq!(
            counter_table_sql(Backend::Mysql),
            "CREATE TABLE modcounter (id BIGINT NOT NULL, serial BIGINT NOT NULL, \
             tablename VARCHAR(255) PRIMARY KEY)"
        );
        assert_eq!(
            identity_table_sql(Backend::Memory, "identity"),
            "CREATE TABLE identity (class TEXT PRIMARY KEY, nextid BIGINT NOT NULL)"
        );
        assert_eq!(
            seed_master_row_sql(),
            "INSERT INTO modcounter (id, serial, tablename) VALUES (0, 0, '*')"
        );
    }

    #[test]
    fn test_create_support_tables_tolerates_a_seeded_master_row() {
        let (script, mut conn) = script_conn();

        script.push_rows(0); // modcounter
        script.push_rows(0); // identity
        script.push_rows(0); // modlog
        script.push_unique_violation(); // master row already there

        create_support_tables(&mut conn).unwrap();
        assert!(!conn.take_unique_violation());

        let calls = script.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[0].starts_with("update:CREATE TABLE modcounter"));
        assert!(calls[1].starts_with("update:CREATE TABLE identity"));
        assert!(calls[2].starts_with("update:CREATE TABLE modlog"));
        assert!(calls[3].starts_with("update:INSERT INTO modcounter"));
    }
}
