//! Core types and traits for SQLEntity.
//!
//! This crate provides the foundational abstractions shared by every
//! layer of the persistence runtime:
//!
//! - `Value` and `Row` for dynamically-typed parameter binding and fetching
//! - `Error` with the full failure taxonomy and login classification
//! - `StatementRegistry` mapping statement descriptors to process-wide ids
//! - `Driver` / `DriverStatement` / `DriverCursor` backend seam
//! - `Backend` dialect capability table
//! - `Context`, the explicit process-wide runtime state

pub mod backend;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod row;
pub mod statement;
pub mod value;

pub use backend::{Backend, RowLimit};
pub use config::ConnectConfig;
pub use context::Context;
pub use driver::{
    Driver, DriverCursor, DriverFactory, DriverStatement, ExecOutcome, collect_rows,
};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, LoginFailure, PoolError,
    PoolErrorKind, QueryError, QueryErrorKind, RemoteError, Result, TypeError,
};
pub use row::{ColumnInfo, FromValue, Row, RowSet};
pub use statement::{
    ConcurrencyMode, CursorMode, StatementDesc, StatementId, StatementRegistry,
};
pub use value::Value;
