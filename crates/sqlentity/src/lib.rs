//! SQLEntity - object persistence with optimistic concurrency.
//!
//! SQLEntity keeps relational rows and in-memory objects consistent
//! across many connections and processes:
//!
//! - `Entity` / `Persistent` row mapping with serial-checked updates
//! - Logical connections over a shared pool, with one-level named
//!   transactions and commit/rollback callbacks
//! - Change detection through modification counters and a background
//!   `Watcher`
//! - A modification log with transaction markers and replay
//! - Remote sessions forwarding whole operations to a server-side peer
//!
//! # Quick Start
//!
//! ```ignore
//! use sqlentity::prelude::*;
//!
//! #[derive(Debug, Default)]
//! struct Hero {
//!     state: PersistState,
//!     name: String,
//!     strength: i64,
//! }
//!
//! impl Entity for Hero {
//!     const TABLE: &'static str = "hero";
//!     const COUNTS_CHANGES: bool = true;
//!     // columns(), state accessors, column_values(), from_row()
//! #   fn columns() -> &'static [ColumnDef] { unimplemented!() }
//! #   fn state(&self) -> &PersistState { &self.state }
//! #   fn state_mut(&mut self) -> &mut PersistState { &mut self.state }
//! #   fn column_values(&self) -> Vec<Value> { unimplemented!() }
//! #   fn from_row(row: &Row) -> Result<Self> { unimplemented!() }
//! }
//!
//! fn run(factory: Box<dyn DriverFactory>) -> Result<()> {
//!     let db = Database::builder(ConnectConfig::new("postgres://db/app", "app"))
//!         .driver(Backend::Postgres, factory)
//!         .register::<Hero>()
//!         .build()?;
//!
//!     let mut conn = db.connect()?;
//!     let mut hero = Hero {
//!         name: "Alice".to_string(),
//!         strength: 7,
//!         ..Hero::default()
//!     };
//!     hero.insert(&mut conn)?;
//!
//!     let watcher = db.watch(WatchConfig::default())?;
//!     watcher.watch("hero", |serial| println!("heroes changed: {serial}"));
//!     Ok(())
//! }
//! ```

pub use sqlentity_core::{
    Backend, ColumnInfo, ConcurrencyMode, ConfigError, ConnectConfig, ConnectionError,
    ConnectionErrorKind, Context, CursorMode, Driver, DriverCursor, DriverFactory,
    DriverStatement, Error, ExecOutcome, FromValue, LoginFailure, PoolError, PoolErrorKind,
    QueryError, QueryErrorKind, RemoteError, Result, Row, RowLimit, RowSet, StatementDesc,
    StatementId, StatementRegistry, TypeError, Value, collect_rows,
};

pub use sqlentity_pool::{PhysicalConnection, Pool, PoolConfig, PoolStats, PooledConn};

pub use sqlentity_session::{
    Backing, ColumnDef, ColumnType, CounterOp, DEFAULT_DESCRIPTOR, Entity, EntityDescriptor,
    EntityOp, EntityRegistry, IDENTITY_TABLE, IdSource, IdSourceFactories, IdSourceFactory,
    LocalBacking, LogRecord, LogicalConnection, MASTER_NAME, MemoryIdSource, ModType, OpReply,
    PersistState, Persistent, RemoteOp, Seek, SerialGapScan, TableIdSource, attach_error,
    count_modification, create_entity_table, create_support_tables, create_table_sql,
    delete_all_rows, delete_object, fetch_row, insert_values, replay, replay_all, reserve_ident,
    save_values, select_by_tx, select_master_serial, select_modification, select_modifications,
    sync_values, update_values,
};

pub use sqlentity_watch::{Dispatcher, InlineDispatcher, WatchConfig, WatchToken, Watcher};

pub use sqlentity_remote::{
    Fault, Loopback, RemoteBacking, RemoteCursor, Request, Response, SessionServer, Transport,
    WireRow,
};

pub mod database;
pub use database::{Database, DatabaseBuilder};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use sqlentity::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Backend, ColumnDef, ColumnType, ConnectConfig, Database, DriverFactory, Entity, Error,
        LogicalConnection, PersistState, Persistent, PoolConfig, Result, Row, StatementDesc,
        Value, WatchConfig, Watcher, count_modification, select_master_serial,
        select_modification,
    };
}
