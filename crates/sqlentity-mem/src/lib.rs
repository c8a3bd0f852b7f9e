//! In-memory reference backend for SQLEntity.
//!
//! Implements the driver seam over process-local tables, with enough
//! transactional behavior to exercise the persistence runtime end to
//! end: autocommit and manual transactions, read-committed visibility,
//! row locks with a busy timeout for `FOR UPDATE` and mutations, and
//! primary-key enforcement reported as SQLSTATE 23505.
//!
//! Statements are compiled at prepare time from the same SQL the
//! sessions issue against networked backends, so a program tested
//! against [`MemDatabase`] runs unchanged against a real server.

mod driver;
mod parse;
mod store;

pub use driver::{MemDatabase, MemDriver};
