//! Logical connections and persistent entities for SQLEntity.
//!
//! This crate builds the consistency layer on top of the pool:
//!
//! - `Entity` / `Persistent` for optimistic-concurrency row mapping
//! - `LogicalConnection` with one-level named transactions and callbacks
//! - `Backing`, the seam separating local pools from remote sessions
//! - id reservation through pluggable `IdSource` implementations
//! - `count_modification` and the `modcounter` change-detection table
//! - the `modlog` journal with transaction markers and replay
//! - schema bootstrap for entity and support tables

pub mod backing;
pub mod counter;
pub mod entity;
pub mod idsource;
pub mod logical;
pub mod modlog;
pub mod ops;
pub mod schema;

#[cfg(test)]
pub(crate) mod test_support;

pub use backing::{Backing, CounterOp, EntityOp, LocalBacking, OpReply, RemoteOp, Seek};
pub use counter::{
    MASTER_NAME, SerialGapScan, count_modification, select_master_serial, select_modification,
    select_modifications,
};
pub use entity::{ColumnDef, ColumnType, Entity, EntityDescriptor, EntityRegistry, PersistState};
pub use idsource::{
    DEFAULT_DESCRIPTOR, IdSource, IdSourceFactories, IdSourceFactory, MemoryIdSource,
    TableIdSource,
};
pub use logical::LogicalConnection;
pub use modlog::{LogRecord, ModType, attach_error, replay, replay_all, select_by_tx};
pub use ops::{
    Persistent, delete_all_rows, delete_object, fetch_row, insert_values, reserve_ident,
    save_values, sync_values, update_values,
};
pub use schema::{
    IDENTITY_TABLE, counter_table_sql, create_entity_table, create_support_tables,
    create_table_sql, identity_table_sql, seed_master_row_sql,
};
