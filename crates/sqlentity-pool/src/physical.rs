//! Physical connections.
//!
//! A physical connection wraps one driver connection plus the statement
//! cache that multiplexes it between logical connections over time. At
//! any moment at most one logical connection is attached; re-attachment
//! by the same owner nests via a reference count.

use sqlentity_core::context::Context;
use sqlentity_core::driver::{Driver, DriverCursor, DriverStatement};
use sqlentity_core::error::{Error, Result};
use sqlentity_core::statement::StatementId;
use sqlentity_core::value::Value;
use std::sync::Arc;
use std::time::Instant;

pub struct PhysicalConnection {
    /// Pool-assigned identity, stable for the connection's lifetime.
    index: u64,
    driver: Box<dyn Driver>,
    context: Arc<Context>,
    /// Prepared statements indexed by registry id. Grown geometrically
    /// so a burst of registrations does not reallocate per statement.
    statements: Vec<Option<Box<dyn DriverStatement>>>,
    attach_count: u32,
    /// Instance number of the attached logical connection.
    attached_to: Option<i64>,
    auto_commit: bool,
    dead: bool,
    created_at: Instant,
    last_detach: Instant,
}

impl PhysicalConnection {
    pub fn new(index: u64, driver: Box<dyn Driver>, context: Arc<Context>) -> Self {
        let now = Instant::now();
        Self {
            index,
            driver,
            context,
            statements: Vec::new(),
            attach_count: 0,
            attached_to: None,
            auto_commit: true,
            dead: false,
            created_at: now,
            last_detach: now,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn backend(&self) -> sqlentity_core::backend::Backend {
        self.driver.backend()
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn is_attached(&self) -> bool {
        self.attached_to.is_some()
    }

    pub fn attached_instance(&self) -> Option<i64> {
        self.attached_to
    }

    pub fn attach_count(&self) -> u32 {
        self.attach_count
    }

    /// Time since the last detach left the connection idle.
    pub fn idle_since(&self) -> Instant {
        self.last_detach
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Attach the logical connection identified by `instance`.
    ///
    /// The same owner may attach repeatedly; each attach must be paired
    /// with a detach. Attaching while a different owner holds the
    /// connection is a consistency error, never a wait.
    pub fn attach(&mut self, instance: i64) -> Result<()> {
        if self.dead {
            return Err(Error::consistency(format!(
                "physical connection {} is dead",
                self.index
            )));
        }
        match self.attached_to {
            None => {
                self.attached_to = Some(instance);
                self.attach_count = 1;
                Ok(())
            }
            Some(owner) if owner == instance => {
                self.attach_count += 1;
                Ok(())
            }
            Some(owner) => Err(Error::consistency(format!(
                "physical connection {} is attached to logical connection {}, \
                 attach from {} refused",
                self.index, owner, instance
            ))),
        }
    }

    /// Balance one prior [`attach`](Self::attach).
    pub fn detach(&mut self, instance: i64) -> Result<()> {
        match self.attached_to {
            Some(owner) if owner == instance => {
                self.attach_count -= 1;
                if self.attach_count == 0 {
                    self.attached_to = None;
                    self.last_detach = Instant::now();
                }
                Ok(())
            }
            Some(owner) => Err(Error::consistency(format!(
                "detach from logical connection {} but physical connection {} \
                 is attached to {}",
                instance, self.index, owner
            ))),
            None => Err(Error::consistency(format!(
                "detach on unattached physical connection {}",
                self.index
            ))),
        }
    }

    /// Reclaim the connection regardless of its attach state.
    ///
    /// Pool-manager use only: rolls back anything open, restores
    /// autocommit, and clears the attachment.
    pub fn force_detach(&mut self) {
        if let Some(owner) = self.attached_to {
            tracing::warn!(
                connection = self.index,
                logical = owner,
                count = self.attach_count,
                "force-detaching physical connection"
            );
        }
        if !self.auto_commit && !self.dead {
            if let Err(e) = self.driver.rollback() {
                tracing::warn!(connection = self.index, error = %e, "rollback during force-detach failed");
                self.dead = true;
            }
            if !self.dead {
                if let Err(e) = self.driver.set_auto_commit(true) {
                    tracing::warn!(connection = self.index, error = %e, "autocommit restore during force-detach failed");
                    self.dead = true;
                }
            }
            self.auto_commit = true;
        }
        self.attached_to = None;
        self.attach_count = 0;
        self.last_detach = Instant::now();
    }

    fn prepared(&mut self, id: StatementId) -> Result<&mut dyn DriverStatement> {
        let idx = id.index();
        if idx >= self.statements.len() {
            let new_len = (idx + 1).next_power_of_two().max(8);
            self.statements.resize_with(new_len, || None);
        }
        if self.statements[idx].is_none() {
            let desc = self.context.statements().describe(id).ok_or_else(|| {
                Error::consistency(format!("statement {id} is not registered"))
            })?;
            tracing::trace!(connection = self.index, statement = %id, "preparing statement");
            let stmt = self.driver.prepare(&desc)?;
            self.statements[idx] = Some(stmt);
        }
        match self.statements[idx].as_deref_mut() {
            Some(stmt) => Ok(stmt),
            None => Err(Error::consistency("statement cache slot empty after prepare")),
        }
    }

    /// Execute a registered mutation statement.
    pub fn execute_update(&mut self, id: StatementId, params: &[Value]) -> Result<u64> {
        let result = self.prepared(id)?.execute_update(params);
        self.note_failure(&result);
        result
    }

    /// Execute a registered query statement.
    pub fn execute_query(
        &mut self,
        id: StatementId,
        params: &[Value],
    ) -> Result<Box<dyn DriverCursor>> {
        let result = self.prepared(id)?.execute_query(params);
        self.note_failure(&result);
        result
    }

    fn note_failure<T>(&mut self, result: &Result<T>) {
        if let Err(e) = result {
            if e.is_connection_error() {
                self.mark_dead();
            }
        }
    }

    pub fn set_auto_commit(&mut self, on: bool) -> Result<()> {
        if self.auto_commit == on {
            return Ok(());
        }
        self.driver.set_auto_commit(on)?;
        self.auto_commit = on;
        Ok(())
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn commit(&mut self) -> Result<()> {
        self.driver.commit()
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.driver.rollback()
    }

    /// Round-trip probe. On failure the connection is marked dead and
    /// will not be handed out again.
    pub fn verify(&mut self) -> bool {
        if self.dead {
            return false;
        }
        match self.driver.ping() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(connection = self.index, error = %e, "liveness probe failed");
                self.mark_dead();
                false
            }
        }
    }

    pub fn mark_dead(&mut self) {
        if !self.dead {
            tracing::warn!(connection = self.index, "marking physical connection dead");
            self.dead = true;
        }
    }

    /// Close the driver connection. The statement cache is dropped with
    /// it; close errors are reported but the connection is dead either
    /// way.
    pub fn close(&mut self) -> Result<()> {
        self.statements.clear();
        self.dead = true;
        self.driver.close()
    }
}

impl std::fmt::Debug for PhysicalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalConnection")
            .field("index", &self.index)
            .field("attached_to", &self.attached_to)
            .field("attach_count", &self.attach_count)
            .field("auto_commit", &self.auto_commit)
            .field("dead", &self.dead)
            .finish()
    }
}
