//! Process-wide runtime context.
//!
//! One `Context` is created when the runtime comes up and shared by
//! every pool, connection, and watcher in the process. It owns the
//! counters that must be process-unique: the statement registry, the
//! connection instance numbering, and id-source slot allocation.
//! Dropping the last `Arc<Context>` is the teardown.

use crate::statement::{StatementDesc, StatementId, StatementRegistry};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

pub struct Context {
    statements: StatementRegistry,
    next_instance: AtomicI64,
    next_slot: AtomicUsize,
}

impl Context {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            statements: StatementRegistry::new(),
            next_instance: AtomicI64::new(1),
            next_slot: AtomicUsize::new(0),
        })
    }

    /// The shared statement registry.
    pub fn statements(&self) -> &StatementRegistry {
        &self.statements
    }

    /// Shorthand for [`StatementRegistry::register`].
    pub fn register_statement(&self, desc: StatementDesc) -> StatementId {
        self.statements.register(desc)
    }

    /// Next logical-connection instance number. Monotonic from 1;
    /// identifies a handle for ordering and diagnostics only.
    pub fn next_instance(&self) -> i64 {
        self.next_instance.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate an id-source slot. Each entity type that draws ids
    /// claims one slot for the life of the process.
    pub fn allocate_id_slot(&self) -> usize {
        self.next_slot.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of id-source slots handed out so far.
    pub fn id_slot_count(&self) -> usize {
        self.next_slot.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("statements", &self.statements.len())
            .field("id_slots", &self.id_slot_count())
            .finish()
    }
}
