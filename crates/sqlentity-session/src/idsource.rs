//! Id generation for persistent entities.
//!
//! Every entity type draws identities from an [`IdSource`] held in a
//! per-connection slot (the slot index lives on the type's descriptor).
//! Sources are configured through a descriptor string such as
//! `"table:identity:50"`, resolved by an explicit [`IdSourceFactories`]
//! registry so deployments can plug their own schemes without any
//! dynamic class loading.

use crate::logical::LogicalConnection;
use sqlentity_core::driver::ExecOutcome;
use sqlentity_core::error::{ConfigError, Error};
use sqlentity_core::statement::StatementDesc;
use sqlentity_core::value::Value;
use sqlentity_core::Result;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Descriptor used when the connection config does not name one.
pub const DEFAULT_DESCRIPTOR: &str = "table:identity:50";

/// Hands out process-unique positive identities for one entity class.
pub trait IdSource: Send {
    /// The next unassigned identity. Always positive; reservation
    /// negates it at the call site.
    #[allow(clippy::result_large_err)]
    fn next_id(&mut self, conn: &mut LogicalConnection) -> Result<i64>;
}

// `Result::unwrap_err` in tests needs the `Ok` type to be `Debug`;
// sources are opaque, so keep this off the public trait.
#[cfg(test)]
impl std::fmt::Debug for dyn IdSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn IdSource")
    }
}

/// Block-allocating source backed by an `identity` table with one
/// `(class, nextid)` row per entity class.
///
/// A block of ids is claimed with an optimistic
/// `UPDATE ... WHERE class = ? AND nextid = ?` bump; zero affected rows
/// means another process claimed the block first and the read is
/// retried. Ids unused at process exit are simply lost, which is fine:
/// identity gaps carry no meaning.
pub struct TableIdSource {
    class: String,
    table: String,
    block: i64,
    next: i64,
    limit: i64,
}

const MAX_CLAIM_ATTEMPTS: usize = 100;

impl TableIdSource {
    pub fn new(
        class: impl Into<String>,
        table: impl Into<String>,
        block: i64,
    ) -> Self {
        Self {
            class: class.into(),
            table: table.into(),
            block: block.max(1),
            next: 0,
            limit: 0,
        }
    }

    fn claim_block(&mut self, conn: &mut LogicalConnection) -> Result<()> {
        let backend = conn.backend();
        let table = &self.table;
        let select = conn.prepare_statement(StatementDesc::new(format!(
            "SELECT nextid FROM {table} WHERE class = {}",
            backend.placeholder(1)
        )));
        let update = conn.prepare_statement(StatementDesc::new(format!(
            "UPDATE {table} SET nextid = {} WHERE class = {} AND nextid = {}",
            backend.placeholder(1),
            backend.placeholder(2),
            backend.placeholder(3)
        )));
        let insert = conn.prepare_statement(StatementDesc::new(format!(
            "INSERT INTO {table} (class, nextid) VALUES ({}, {})",
            backend.placeholder(1),
            backend.placeholder(2)
        )));

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let mut rows = conn.execute_query(select, &[Value::from(self.class.as_str())])?;
            if rows.next() {
                let current: i64 = rows.fetch()?.get_named("nextid")?;
                let outcome = conn.execute_update(
                    update,
                    &[
                        Value::BigInt(current + self.block),
                        Value::from(self.class.as_str()),
                        Value::BigInt(current),
                    ],
                )?;
                match outcome {
                    ExecOutcome::Rows(1) => {
                        self.next = current;
                        self.limit = current + self.block;
                        tracing::debug!(
                            class = %self.class,
                            from = current,
                            to = self.limit,
                            "claimed id block"
                        );
                        return Ok(());
                    }
                    // Another process claimed the block; re-read.
                    ExecOutcome::Rows(_) => {}
                    ExecOutcome::UniqueViolation => {
                        conn.take_unique_violation();
                    }
                }
            } else {
                let outcome = conn.execute_update(
                    insert,
                    &[
                        Value::from(self.class.as_str()),
                        Value::BigInt(1 + self.block),
                    ],
                )?;
                match outcome {
                    ExecOutcome::Rows(_) => {
                        self.next = 1;
                        self.limit = 1 + self.block;
                        return Ok(());
                    }
                    // Another process created the row; re-read.
                    ExecOutcome::UniqueViolation => {
                        conn.take_unique_violation();
                    }
                }
            }
        }

        Err(Error::Custom(format!(
            "id block for class '{}' could not be claimed after {MAX_CLAIM_ATTEMPTS} attempts",
            self.class
        )))
    }
}

impl IdSource for TableIdSource {
    fn next_id(&mut self, conn: &mut LogicalConnection) -> Result<i64> {
        if self.next >= self.limit {
            self.claim_block(conn)?;
        }
        let id = self.next;
        self.next += 1;
        Ok(id)
    }
}

/// Process-local source for tests and the in-memory backend. Instances
/// created by the built-in `"memory"` factory share one counter per
/// factories registry, so connections of the same database never
/// collide.
pub struct MemoryIdSource {
    next: Arc<AtomicI64>,
}

impl MemoryIdSource {
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicI64::new(1)),
        }
    }

    pub fn with_counter(next: Arc<AtomicI64>) -> Self {
        Self { next }
    }
}

impl Default for MemoryIdSource {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for MemoryIdSource {
    fn next_id(&mut self, _conn: &mut LogicalConnection) -> Result<i64> {
        Ok(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Factory signature: `(args, class) -> source`, where `args` is the
/// descriptor remainder after the scheme prefix.
pub type IdSourceFactory =
    Box<dyn Fn(&str, &str) -> Result<Box<dyn IdSource>> + Send + Sync>;

/// Registry resolving id-source descriptor strings to factories.
///
/// Two schemes are built in: `table[:TABLE[:BLOCK]]` and `memory`.
pub struct IdSourceFactories {
    factories: RwLock<HashMap<String, IdSourceFactory>>,
}

impl IdSourceFactories {
    pub fn new() -> Arc<Self> {
        let this = Self {
            factories: RwLock::new(HashMap::new()),
        };

        this.register(
            "table",
            Box::new(|args, class| {
                let (table, block) = parse_table_args(args)?;
                Ok(Box::new(TableIdSource::new(class, table, block)))
            }),
        );

        let shared = Arc::new(AtomicI64::new(1));
        this.register(
            "memory",
            Box::new(move |_args, _class| {
                Ok(Box::new(MemoryIdSource::with_counter(Arc::clone(&shared))))
            }),
        );

        Arc::new(this)
    }

    /// Register a factory for a descriptor scheme, replacing any
    /// previous registration.
    pub fn register(&self, scheme: impl Into<String>, factory: IdSourceFactory) {
        self.factories.write().insert(scheme.into(), factory);
    }

    /// Build a source for `class` from a descriptor string.
    #[allow(clippy::result_large_err)]
    pub fn resolve(&self, descriptor: &str, class: &str) -> Result<Box<dyn IdSource>> {
        let (scheme, args) = descriptor
            .split_once(':')
            .unwrap_or((descriptor, ""));
        let factories = self.factories.read();
        match factories.get(scheme) {
            Some(factory) => factory(args, class),
            None => Err(Error::Config(ConfigError {
                message: format!("unknown id-source scheme '{scheme}' in '{descriptor}'"),
            })),
        }
    }
}

impl std::fmt::Debug for IdSourceFactories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut schemes: Vec<String> = self.factories.read().keys().cloned().collect();
        schemes.sort();
        f.debug_struct("IdSourceFactories")
            .field("schemes", &schemes)
            .finish()
    }
}

#[allow(clippy::result_large_err)]
fn parse_table_args(args: &str) -> Result<(String, i64)> {
    let (table, block) = match args.split_once(':') {
        Some((table, block)) => (table, Some(block)),
        None if args.is_empty() => ("identity", None),
        None => (args, None),
    };
    let table = if table.is_empty() { "identity" } else { table };
    let block = match block {
        Some(b) => b.parse::<i64>().map_err(|_| {
            Error::Config(ConfigError {
                message: format!("invalid id block size '{b}'"),
            })
        })?,
        None => 50,
    };
    if block < 1 {
        return Err(Error::Config(ConfigError {
            message: format!("id block size must be positive, got {block}"),
        }));
    }
    Ok((table.to_string(), block))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::script_conn;
    use sqlentity_core::row::Row;

    #[test]
    fn test_parse_table_descriptor_forms() {
        assert_eq!(parse_table_args("").unwrap(), ("identity".to_string(), 50));
        assert_eq!(
            parse_table_args("sequence").unwrap(),
            ("sequence".to_string(), 50)
        );
        assert_eq!(
            parse_table_args("identity:8").unwrap(),
            ("identity".to_string(), 8)
        );
        assert!(parse_table_args("identity:none").is_err());
        assert!(parse_table_args("identity:0").is_err());
    }

    #[test]
    fn test_factories_resolve_and_unknown_scheme() {
        let factories = IdSourceFactories::new();
        assert!(factories.resolve("memory", "account").is_ok());
        assert!(factories.resolve("table:identity:10", "account").is_ok());

        let err = factories.resolve("oracle:seq", "account").unwrap_err();
        assert!(err.to_string().contains("oracle"));
    }

    #[test]
    fn test_memory_sources_from_one_registry_share_a_counter() {
        let (_script, mut conn) = script_conn();
        let factories = IdSourceFactories::new();

        let mut a = factories.resolve("memory", "account").unwrap();
        let mut b = factories.resolve("memory", "shipment").unwrap();

        assert_eq!(a.next_id(&mut conn).unwrap(), 1);
        assert_eq!(b.next_id(&mut conn).unwrap(), 2);
        assert_eq!(a.next_id(&mut conn).unwrap(), 3);
    }

    fn nextid_row(value: i64) -> Row {
        Row::new(vec!["nextid".to_string()], vec![Value::BigInt(value)])
    }

    #[test]
    fn test_table_source_hands_out_block_then_reclaims() {
        let (script, mut conn) = script_conn();
        let mut source = TableIdSource::new("account", "identity", 2);

        // First block: row exists at 100, bump succeeds.
        script.push_query(vec![nextid_row(100)]);
        script.push_rows(1);

        assert_eq!(source.next_id(&mut conn).unwrap(), 100);
        assert_eq!(source.next_id(&mut conn).unwrap(), 101);

        // Block exhausted: next call claims again.
        script.push_query(vec![nextid_row(102)]);
        script.push_rows(1);
        assert_eq!(source.next_id(&mut conn).unwrap(), 102);

        let calls = script.calls();
        assert!(calls[0].starts_with("query:SELECT nextid FROM identity"));
        assert!(calls[1].starts_with("update:UPDATE identity SET nextid = ?"));
        assert!(calls[1].ends_with("[102, account, 100]"), "{}", calls[1]);
    }

    #[test]
    fn test_table_source_retries_lost_bump_race() {
        let (script, mut conn) = script_conn();
        let mut source = TableIdSource::new("account", "identity", 5);

        // First attempt loses the optimistic bump, second wins.
        script.push_query(vec![nextid_row(10)]);
        script.push_rows(0);
        script.push_query(vec![nextid_row(15)]);
        script.push_rows(1);

        assert_eq!(source.next_id(&mut conn).unwrap(), 15);
    }

    #[test]
    fn test_table_source_creates_row_and_survives_creation_race() {
        let (script, mut conn) = script_conn();
        let mut source = TableIdSource::new("account", "identity", 5);

        // No row yet; our insert loses to another process, re-read wins.
        script.push_query(Vec::new());
        script.push_unique_violation();
        script.push_query(vec![nextid_row(6)]);
        script.push_rows(1);

        assert_eq!(source.next_id(&mut conn).unwrap(), 6);
        // The internal race must not leak into the connection flag.
        assert!(!conn.take_unique_violation());
    }

    #[test]
    fn test_table_source_fresh_row_starts_at_one() {
        let (script, mut conn) = script_conn();
        let mut source = TableIdSource::new("shipment", "identity", 3);

        script.push_query(Vec::new());
        script.push_rows(1);

        assert_eq!(source.next_id(&mut conn).unwrap(), 1);
        assert_eq!(source.next_id(&mut conn).unwrap(), 2);
        assert_eq!(source.next_id(&mut conn).unwrap(), 3);

        let calls = script.calls();
        assert!(calls[1].starts_with("update:INSERT INTO identity"));
        assert!(calls[1].ends_with("[shipment, 4]"), "{}", calls[1]);
    }
}
