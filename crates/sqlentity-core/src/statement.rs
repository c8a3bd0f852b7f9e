//! Process-wide statement registry.
//!
//! Every distinct (SQL text, cursor mode, concurrency mode) triple used
//! anywhere in the process is registered once and receives a compact
//! integer id. Physical connections use that id to index their prepared
//! statement caches, so the same logical statement re-prepares at most
//! once per connection no matter how many logical connections issue it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// How a statement's cursor can be navigated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CursorMode {
    /// Rows can only be read front to back
    #[default]
    ForwardOnly,
    /// Cursor supports previous/absolute positioning
    Scrollable,
}

/// Whether a statement's result set may be used to lock/update rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConcurrencyMode {
    /// Plain read
    #[default]
    ReadOnly,
    /// Rows are read for update (row locks held to transaction end)
    Updatable,
}

/// Identifier of a registered statement.
///
/// Ids are dense and start at 1, which lets connection-local caches use
/// them directly as vector indices. They are never reused for the life
/// of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatementId(u32);

impl StatementId {
    /// Raw id value (>= 1).
    pub fn get(self) -> u32 {
        self.0
    }

    /// Zero-based cache slot for this id.
    pub fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

impl std::fmt::Display for StatementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Full description of a registered statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementDesc {
    pub sql: String,
    pub cursor: CursorMode,
    pub concurrency: ConcurrencyMode,
}

impl StatementDesc {
    /// Describe a forward-only, read-only statement.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            cursor: CursorMode::default(),
            concurrency: ConcurrencyMode::default(),
        }
    }

    pub fn with_cursor(mut self, cursor: CursorMode) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencyMode) -> Self {
        self.concurrency = concurrency;
        self
    }
}

#[derive(Default)]
struct RegistryInner {
    by_desc: HashMap<StatementDesc, StatementId>,
    // Index i holds the descriptor for id i+1.
    descs: Vec<Arc<StatementDesc>>,
}

/// Append-only registry of statement descriptors.
///
/// Cheap to share; registration takes one short lock. Lives in the
/// process [`crate::context::Context`].
#[derive(Default)]
pub struct StatementRegistry {
    inner: Mutex<RegistryInner>,
}

impl StatementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a statement, returning its id.
    ///
    /// Registering an equal descriptor again returns the original id; a
    /// descriptor differing in any field gets a fresh one.
    pub fn register(&self, desc: StatementDesc) -> StatementId {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.by_desc.get(&desc) {
            return id;
        }
        let id = StatementId(u32::try_from(inner.descs.len() + 1).unwrap_or(u32::MAX));
        inner.descs.push(Arc::new(desc.clone()));
        inner.by_desc.insert(desc, id);
        tracing::trace!(statement = %id, "registered statement");
        id
    }

    /// Look up the descriptor for an id.
    pub fn describe(&self, id: StatementId) -> Option<Arc<StatementDesc>> {
        self.inner.lock().descs.get(id.index()).cloned()
    }

    /// Number of registered statements.
    pub fn len(&self) -> usize {
        self.inner.lock().descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for StatementRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementRegistry")
            .field("len", &self.len())
            .finish()
    }
}
