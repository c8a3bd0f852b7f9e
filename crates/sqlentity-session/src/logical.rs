//! The logical connection: the application-facing handle every
//! persistence operation goes through.
//!
//! A logical connection is identified by a process-unique instance
//! number and owns exactly one [`Backing`]. It layers the transaction
//! protocol on top: one level of named transactions with safe nesting,
//! commit/rollback callbacks, the sticky unique-violation flag, the
//! per-class id-source cache and the deferred modification-log buffer.
//!
//! Nesting works through the `started` handshake: [`begin`] returns
//! `true` only for the outermost caller, and [`commit`]/[`rollback`]
//! do nothing unless handed that `true` back. Inner operations wrap
//! themselves in the same bracket and compose silently.
//!
//! [`begin`]: LogicalConnection::begin
//! [`commit`]: LogicalConnection::commit
//! [`rollback`]: LogicalConnection::rollback

use crate::backing::{Backing, LocalBacking, OpReply, RemoteOp};
use crate::entity::EntityRegistry;
use crate::idsource::{IdSource, IdSourceFactories, DEFAULT_DESCRIPTOR};
use crate::modlog::LogRecord;
use sqlentity_core::backend::Backend;
use sqlentity_core::config::ConnectConfig;
use sqlentity_core::context::Context;
use sqlentity_core::driver::ExecOutcome;
use sqlentity_core::error::Error;
use sqlentity_core::row::RowSet;
use sqlentity_core::statement::{StatementDesc, StatementId};
use sqlentity_core::value::Value;
use sqlentity_core::Result;
use sqlentity_pool::Pool;
use std::mem;
use std::sync::Arc;

type TxCallback = Box<dyn FnMut() -> Result<()> + Send>;

pub struct LogicalConnection {
    context: Arc<Context>,
    entities: Arc<EntityRegistry>,
    factories: Arc<IdSourceFactories>,
    config: ConnectConfig,
    backing: Box<dyn Backing>,
    instance: i64,
    open: bool,
    auto_commit: bool,
    tx_count: u64,
    tx_name: String,
    unique_violation: bool,
    master_counted: bool,
    defer_log: bool,
    /// Row id of this transaction's BEGIN log record, 0 while unlogged.
    log_tx_id: i64,
    deferred_log: Vec<LogRecord>,
    commit_callbacks: Vec<TxCallback>,
    rollback_callbacks: Vec<TxCallback>,
    /// Indexed by each descriptor's id slot, populated on first use.
    id_sources: Vec<Option<Box<dyn IdSource>>>,
}

impl LogicalConnection {
    /// Open a pool-backed connection against a local store.
    #[allow(clippy::result_large_err)]
    pub fn local(
        context: Arc<Context>,
        entities: Arc<EntityRegistry>,
        factories: Arc<IdSourceFactories>,
        config: ConnectConfig,
        pool: Pool,
        backend: Backend,
    ) -> Result<Self> {
        let instance = context.next_instance();
        let backing = Box::new(LocalBacking::new(pool, backend, instance));
        Self::assemble(context, entities, factories, config, instance, backing)
    }

    /// Open a connection over a caller-supplied backing (remote mode).
    #[allow(clippy::result_large_err)]
    pub fn with_backing(
        context: Arc<Context>,
        entities: Arc<EntityRegistry>,
        factories: Arc<IdSourceFactories>,
        config: ConnectConfig,
        backing: Box<dyn Backing>,
    ) -> Result<Self> {
        let instance = context.next_instance();
        Self::assemble(context, entities, factories, config, instance, backing)
    }

    #[allow(clippy::result_large_err)]
    fn assemble(
        context: Arc<Context>,
        entities: Arc<EntityRegistry>,
        factories: Arc<IdSourceFactories>,
        config: ConnectConfig,
        instance: i64,
        mut backing: Box<dyn Backing>,
    ) -> Result<Self> {
        backing.open()?;
        tracing::debug!(
            instance,
            backend = ?backing.backend(),
            remote = backing.is_remote(),
            "logical connection opened"
        );
        Ok(Self {
            context,
            entities,
            factories,
            config,
            backing,
            instance,
            open: true,
            auto_commit: true,
            tx_count: 0,
            tx_name: String::new(),
            unique_violation: false,
            master_counted: false,
            defer_log: false,
            log_tx_id: 0,
            deferred_log: Vec::new(),
            commit_callbacks: Vec::new(),
            rollback_callbacks: Vec::new(),
            id_sources: Vec::new(),
        })
    }

    /// A second, independent connection against the same store.
    ///
    /// Shares the pool or transport and the credentials, but none of
    /// the mutable transaction state.
    #[allow(clippy::result_large_err)]
    pub fn try_clone(&mut self) -> Result<Self> {
        self.ensure_open()?;
        let instance = self.context.next_instance();
        let backing = self.backing.split(instance)?;
        Ok(Self {
            context: Arc::clone(&self.context),
            entities: Arc::clone(&self.entities),
            factories: Arc::clone(&self.factories),
            config: self.config.clone(),
            backing,
            instance,
            open: true,
            auto_commit: true,
            tx_count: 0,
            tx_name: String::new(),
            unique_violation: false,
            master_counted: false,
            defer_log: self.defer_log,
            log_tx_id: 0,
            deferred_log: Vec::new(),
            commit_callbacks: Vec::new(),
            rollback_callbacks: Vec::new(),
            id_sources: Vec::new(),
        })
    }

    pub fn instance(&self) -> i64 {
        self.instance
    }

    pub fn backend(&self) -> Backend {
        self.backing.backend()
    }

    pub fn is_remote(&self) -> bool {
        self.backing.is_remote()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn entities(&self) -> &Arc<EntityRegistry> {
        &self.entities
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    /// Session id assigned by the server, or the local instance number.
    #[allow(clippy::result_large_err)]
    pub fn connection_id(&mut self) -> Result<i64> {
        self.ensure_open()?;
        self.backing.connection_id()
    }

    /// True while a transaction is open (manual-commit mode).
    pub fn in_transaction(&self) -> bool {
        !self.auto_commit
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    /// Name passed to the outermost [`begin`](Self::begin), empty
    /// outside a transaction.
    pub fn transaction_name(&self) -> &str {
        &self.tx_name
    }

    /// How many transactions this connection has started.
    pub fn transaction_count(&self) -> u64 {
        self.tx_count
    }

    /// Start a transaction, or join one already open.
    ///
    /// Returns `true` when this call actually flipped the connection
    /// into manual-commit mode. Pass that value to
    /// [`commit`](Self::commit) or [`rollback`](Self::rollback): only
    /// the owning caller performs the physical action, so nested
    /// begin/commit brackets are safe.
    #[allow(clippy::result_large_err)]
    pub fn begin(&mut self, name: &str) -> Result<bool> {
        self.ensure_open()?;
        if !self.auto_commit {
            return Ok(false);
        }
        self.enter_transaction(name)?;
        Ok(true)
    }

    /// Commit if `started` is true, otherwise do nothing.
    ///
    /// Commit callbacks run first and may still abort the commit: any
    /// callback error rolls the transaction back and propagates.
    #[allow(clippy::result_large_err)]
    pub fn commit(&mut self, started: bool) -> Result<()> {
        if !started {
            return Ok(());
        }
        self.ensure_open()?;
        if self.auto_commit {
            return Err(Error::consistency("commit outside a transaction"));
        }
        self.finish_transaction(true)
    }

    /// Roll back if `started` is true, otherwise do nothing.
    ///
    /// Harmless after the transaction already ended some other way.
    #[allow(clippy::result_large_err)]
    pub fn rollback(&mut self, started: bool) -> Result<()> {
        if !started {
            return Ok(());
        }
        self.ensure_open()?;
        if self.auto_commit {
            return Ok(());
        }
        self.finish_transaction(false)
    }

    /// Driver-style autocommit switch. Turning it off opens an unnamed
    /// transaction; turning it back on commits.
    #[allow(clippy::result_large_err)]
    pub fn set_auto_commit(&mut self, on: bool) -> Result<()> {
        self.ensure_open()?;
        if on == self.auto_commit {
            return Ok(());
        }
        if on {
            self.finish_transaction(true)
        } else {
            self.enter_transaction("")
        }
    }

    #[allow(clippy::result_large_err)]
    fn enter_transaction(&mut self, name: &str) -> Result<()> {
        self.backing.begin(name)?;
        self.auto_commit = false;
        self.tx_count += 1;
        self.tx_name.clear();
        self.tx_name.push_str(name);
        self.master_counted = false;
        self.log_tx_id = 0;
        self.deferred_log.clear();
        // Leftovers from an earlier transaction must not fire here.
        self.commit_callbacks.clear();
        self.rollback_callbacks.clear();
        tracing::debug!(
            instance = self.instance,
            tx = name,
            count = self.tx_count,
            "transaction started"
        );
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn finish_transaction(&mut self, commit: bool) -> Result<()> {
        if commit {
            let mut callbacks = mem::take(&mut self.commit_callbacks);
            for callback in callbacks.iter_mut() {
                if let Err(e) = callback() {
                    tracing::warn!(
                        instance = self.instance,
                        tx = %self.tx_name,
                        error = %e,
                        "commit aborted by callback"
                    );
                    self.abandon_commit();
                    return Err(e);
                }
            }
            if let Err(e) = crate::modlog::close_transaction(self) {
                self.abandon_commit();
                return Err(e);
            }
            if let Err(e) = self.backing.commit() {
                self.abandon_commit();
                return Err(e);
            }
            self.rollback_callbacks.clear();
            tracing::debug!(
                instance = self.instance,
                tx = %self.tx_name,
                "transaction committed"
            );
            self.reset_transaction_state();
            Ok(())
        } else {
            self.commit_callbacks.clear();
            let mut callbacks = mem::take(&mut self.rollback_callbacks);
            for callback in callbacks.iter_mut() {
                if let Err(e) = callback() {
                    // The rollback itself must still happen.
                    tracing::warn!(
                        instance = self.instance,
                        error = %e,
                        "rollback callback failed"
                    );
                }
            }
            let result = self.backing.rollback();
            tracing::debug!(
                instance = self.instance,
                tx = %self.tx_name,
                "transaction rolled back"
            );
            self.reset_transaction_state();
            result
        }
    }

    /// Failed commit path: roll back and swallow secondary errors so
    /// the original failure is what the caller sees.
    fn abandon_commit(&mut self) {
        if let Err(e) = self.finish_transaction(false) {
            tracing::warn!(
                instance = self.instance,
                error = %e,
                "rollback after failed commit"
            );
        }
    }

    fn reset_transaction_state(&mut self) {
        self.auto_commit = true;
        self.tx_name.clear();
        self.master_counted = false;
        self.log_tx_id = 0;
        self.deferred_log.clear();
    }

    /// Run after the next successful commit. A callback returning an
    /// error aborts the commit and rolls the transaction back.
    pub fn add_commit_callback(&mut self, callback: impl FnMut() -> Result<()> + Send + 'static) {
        self.commit_callbacks.push(Box::new(callback));
    }

    /// Run after the next rollback. Errors are logged, never raised.
    pub fn add_rollback_callback(&mut self, callback: impl FnMut() -> Result<()> + Send + 'static) {
        self.rollback_callbacks.push(Box::new(callback));
    }

    /// Register a statement for later execution on this connection.
    ///
    /// Registration is idempotent: the same statement text maps to the
    /// same id process-wide, and every physical connection caches its
    /// prepared handle by that id.
    pub fn prepare_statement(&self, desc: StatementDesc) -> StatementId {
        self.context.register_statement(desc)
    }

    /// Execute a registered mutation statement.
    ///
    /// A unique-constraint violation is not an error here: it comes
    /// back as [`ExecOutcome::UniqueViolation`] and latches the sticky
    /// flag readable through
    /// [`take_unique_violation`](Self::take_unique_violation).
    #[allow(clippy::result_large_err)]
    pub fn execute_update(&mut self, stmt: StatementId, params: &[Value]) -> Result<ExecOutcome> {
        self.ensure_open()?;
        let release = self.auto_commit;
        match self.backing.execute_update(stmt, params, release) {
            Ok(rows) => Ok(ExecOutcome::Rows(rows)),
            Err(e) if e.is_unique_violation() => {
                tracing::debug!(instance = self.instance, "unique constraint violation");
                self.unique_violation = true;
                Ok(ExecOutcome::UniqueViolation)
            }
            Err(e) => Err(e),
        }
    }

    /// Execute a registered query statement, buffering all rows.
    #[allow(clippy::result_large_err)]
    pub fn execute_query(&mut self, stmt: StatementId, params: &[Value]) -> Result<RowSet> {
        self.ensure_open()?;
        let release = self.auto_commit;
        self.backing.execute_query(stmt, params, release)
    }

    /// Carry an operation to the remote peer (remote connections only).
    #[allow(clippy::result_large_err)]
    pub fn forward(&mut self, op: RemoteOp) -> Result<OpReply> {
        self.ensure_open()?;
        self.backing.forward(op)
    }

    /// Read and clear the sticky unique-violation flag.
    ///
    /// The flag latches whenever any statement on this connection hits
    /// a unique constraint and stays set until read, so a caller that
    /// got `false` from a persistence call can tell a duplicate key
    /// from a lost optimistic race.
    pub fn take_unique_violation(&mut self) -> bool {
        mem::take(&mut self.unique_violation)
    }

    pub fn unique_violation(&self) -> bool {
        self.unique_violation
    }

    pub(crate) fn note_unique_violation(&mut self) {
        self.unique_violation = true;
    }

    /// Buffer modification-log records in memory until commit instead
    /// of writing each one immediately.
    pub fn set_deferred_logging(&mut self, on: bool) {
        self.defer_log = on;
    }

    pub fn deferred_logging(&self) -> bool {
        self.defer_log
    }

    pub(crate) fn log_tx_id(&self) -> i64 {
        self.log_tx_id
    }

    pub(crate) fn set_log_tx_id(&mut self, id: i64) {
        self.log_tx_id = id;
    }

    pub(crate) fn master_counted(&self) -> bool {
        self.master_counted
    }

    pub(crate) fn set_master_counted(&mut self, on: bool) {
        self.master_counted = on;
    }

    pub(crate) fn push_deferred(&mut self, record: LogRecord) {
        self.deferred_log.push(record);
    }

    pub(crate) fn take_deferred(&mut self) -> Vec<LogRecord> {
        mem::take(&mut self.deferred_log)
    }

    pub(crate) fn deferred_len(&self) -> usize {
        self.deferred_log.len()
    }

    /// Next identity from the per-class id source, positive.
    ///
    /// Sources live in slots handed out by the context so each entity
    /// type resolves its source once per connection. The source is
    /// lifted out of its slot while it runs, because claiming a block
    /// executes statements through this same connection.
    #[allow(clippy::result_large_err)]
    pub(crate) fn next_id_for(&mut self, slot: usize, class: &'static str) -> Result<i64> {
        self.ensure_open()?;
        if self.id_sources.len() <= slot {
            self.id_sources.resize_with(slot + 1, || None);
        }
        let mut source = match self.id_sources[slot].take() {
            Some(source) => source,
            None => {
                let descriptor = self
                    .config
                    .id_source
                    .as_deref()
                    .unwrap_or(DEFAULT_DESCRIPTOR);
                self.factories.resolve(descriptor, class)?
            }
        };
        let result = source.next_id(self);
        self.id_sources[slot] = Some(source);
        result
    }

    /// Install or replace the id source in `slot`, overriding the lazy
    /// resolution from the configured descriptor.
    pub fn set_id_source(&mut self, slot: usize, source: Box<dyn IdSource>) {
        if self.id_sources.len() <= slot {
            self.id_sources.resize_with(slot + 1, || None);
        }
        self.id_sources[slot] = Some(source);
    }

    /// The source currently installed in `slot`, if any has been set or
    /// resolved yet.
    pub fn id_source(&self, slot: usize) -> Option<&dyn IdSource> {
        self.id_sources.get(slot).and_then(|s| s.as_deref())
    }

    /// Close the connection. An open transaction is rolled back first.
    /// Idempotent.
    #[allow(clippy::result_large_err)]
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        if !self.auto_commit {
            tracing::warn!(
                instance = self.instance,
                tx = %self.tx_name,
                "closing inside an open transaction, rolling back"
            );
            if let Err(e) = self.finish_transaction(false) {
                tracing::warn!(instance = self.instance, error = %e, "rollback during close");
            }
        }
        self.open = false;
        self.commit_callbacks.clear();
        self.rollback_callbacks.clear();
        self.id_sources.clear();
        self.backing.close()
    }

    #[allow(clippy::result_large_err)]
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::consistency("logical connection is closed"))
        }
    }
}

impl std::fmt::Debug for LogicalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalConnection")
            .field("instance", &self.instance)
            .field("open", &self.open)
            .field("auto_commit", &self.auto_commit)
            .field("tx_name", &self.tx_name)
            .field("tx_count", &self.tx_count)
            .finish()
    }
}
