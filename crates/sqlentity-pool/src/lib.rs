//! Connection pooling for SQLEntity.
//!
//! The pool owns every physical connection in the process. Logical
//! connections check one out while attached (transaction open or a
//! statement executing) and return it on the final detach. Checkout
//! verifies liveness, discards expired connections, and grows the pool
//! up to its configured maximum before making callers wait.

use parking_lot::{Condvar, Mutex, MutexGuard};
use sqlentity_core::context::Context;
use sqlentity_core::driver::DriverFactory;
use sqlentity_core::error::{Error, PoolError, PoolErrorKind, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub mod physical;

pub use physical::PhysicalConnection;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of connections to maintain
    pub min_connections: usize,
    /// Maximum number of connections allowed
    pub max_connections: usize,
    /// Connection idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Maximum time to wait for a connection in milliseconds
    pub acquire_timeout_ms: u64,
    /// Maximum lifetime of a connection in milliseconds
    pub max_lifetime_ms: u64,
    /// Test connections before giving them out
    pub test_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            idle_timeout_ms: 600_000,   // 10 minutes
            acquire_timeout_ms: 30_000, // 30 seconds
            max_lifetime_ms: 1_800_000, // 30 minutes
            test_on_checkout: true,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Default::default()
        }
    }

    /// Set minimum connections.
    pub fn min_connections(mut self, n: usize) -> Self {
        self.min_connections = n;
        self
    }

    /// Set idle timeout.
    pub fn idle_timeout(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    /// Set acquire timeout.
    pub fn acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    /// Set max lifetime.
    pub fn max_lifetime(mut self, ms: u64) -> Self {
        self.max_lifetime_ms = ms;
        self
    }

    /// Enable/disable test on checkout.
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of connections (active + idle)
    pub total_connections: usize,
    /// Number of idle connections
    pub idle_connections: usize,
    /// Number of active connections
    pub active_connections: usize,
    /// Number of pending acquire requests
    pub pending_requests: usize,
}

struct PoolState {
    idle: VecDeque<PhysicalConnection>,
    total: usize,
    closed: bool,
}

struct PoolShared {
    config: PoolConfig,
    factory: Box<dyn DriverFactory>,
    context: Arc<Context>,
    state: Mutex<PoolState>,
    available: Condvar,
    next_index: AtomicU64,
    pending: AtomicUsize,
}

/// The connection pool.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Create a pool and open `min_connections` up front.
    pub fn new(
        config: PoolConfig,
        factory: Box<dyn DriverFactory>,
        context: Arc<Context>,
    ) -> Result<Self> {
        let pool = Self {
            shared: Arc::new(PoolShared {
                config,
                factory,
                context,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                    closed: false,
                }),
                available: Condvar::new(),
                next_index: AtomicU64::new(0),
                pending: AtomicUsize::new(0),
            }),
        };
        for _ in 0..pool.shared.config.min_connections {
            let conn = pool.connect()?;
            let mut state = pool.shared.state.lock();
            state.total += 1;
            state.idle.push_back(conn);
        }
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.shared.context
    }

    /// Check out a physical connection, waiting up to the configured
    /// acquire timeout if the pool is at capacity.
    pub fn acquire(&self) -> Result<PooledConn> {
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        let result = self.acquire_inner();
        self.shared.pending.fetch_sub(1, Ordering::SeqCst);
        result.map(|conn| PooledConn {
            conn: Some(conn),
            shared: Arc::clone(&self.shared),
        })
    }

    fn acquire_inner(&self) -> Result<PhysicalConnection> {
        let shared = &self.shared;
        let deadline = Instant::now() + Duration::from_millis(shared.config.acquire_timeout_ms);
        let mut state = shared.state.lock();
        loop {
            if state.closed {
                return Err(Error::Pool(PoolError {
                    kind: PoolErrorKind::Closed,
                    message: "pool is closed".to_string(),
                }));
            }

            // Hand out the first idle connection that still checks out.
            while let Some(mut conn) = state.idle.pop_front() {
                if conn.is_dead() || self.expired(&conn) {
                    state.total -= 1;
                    MutexGuard::unlocked(&mut state, || {
                        let _ = conn.close();
                    });
                    continue;
                }
                if shared.config.test_on_checkout {
                    let alive = MutexGuard::unlocked(&mut state, || conn.verify());
                    if !alive {
                        state.total -= 1;
                        MutexGuard::unlocked(&mut state, || {
                            let _ = conn.close();
                        });
                        continue;
                    }
                }
                return Ok(conn);
            }

            // Grow if under the cap.
            if state.total < shared.config.max_connections {
                state.total += 1;
                let opened = MutexGuard::unlocked(&mut state, || self.connect());
                match opened {
                    Ok(conn) => return Ok(conn),
                    Err(e) => {
                        state.total -= 1;
                        shared.available.notify_one();
                        return Err(e);
                    }
                }
            }

            // At capacity: wait for a release.
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || shared.available.wait_for(&mut state, remaining).timed_out()
            {
                return Err(Error::Pool(PoolError {
                    kind: PoolErrorKind::Timeout,
                    message: format!(
                        "no connection became available within {} ms",
                        shared.config.acquire_timeout_ms
                    ),
                }));
            }
        }
    }

    fn connect(&self) -> Result<PhysicalConnection> {
        let driver = self.shared.factory.connect()?;
        let index = self.shared.next_index.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection = index, "opened physical connection");
        Ok(PhysicalConnection::new(
            index,
            driver,
            Arc::clone(&self.shared.context),
        ))
    }

    fn expired(&self, conn: &PhysicalConnection) -> bool {
        let config = &self.shared.config;
        conn.created_at().elapsed() > Duration::from_millis(config.max_lifetime_ms)
            || conn.idle_since().elapsed() > Duration::from_millis(config.idle_timeout_ms)
    }

    /// Close idle connections past their idle timeout or lifetime,
    /// keeping at least `min_connections` alive. Returns the number
    /// closed.
    pub fn reap_idle(&self) -> usize {
        let shared = &self.shared;
        let idle_timeout = Duration::from_millis(shared.config.idle_timeout_ms);
        let max_lifetime = Duration::from_millis(shared.config.max_lifetime_ms);

        let mut state = shared.state.lock();
        let mut kept = VecDeque::with_capacity(state.idle.len());
        let mut victims = Vec::new();
        while let Some(conn) = state.idle.pop_front() {
            let over_lifetime = conn.created_at().elapsed() > max_lifetime;
            let idle_too_long = conn.idle_since().elapsed() > idle_timeout;
            let above_min = state.total - victims.len() > shared.config.min_connections;
            if conn.is_dead() || over_lifetime || (idle_too_long && above_min) {
                victims.push(conn);
            } else {
                kept.push_back(conn);
            }
        }
        state.idle = kept;
        state.total -= victims.len();
        drop(state);

        let reaped = victims.len();
        for mut conn in victims {
            let _ = conn.close();
        }
        if reaped > 0 {
            tracing::debug!(reaped, "reaped idle connections");
        }
        reaped
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            total_connections: state.total,
            idle_connections: state.idle.len(),
            active_connections: state.total - state.idle.len(),
            pending_requests: self.shared.pending.load(Ordering::SeqCst),
        }
    }

    /// Close the pool. Idle connections close now; checked-out ones
    /// close when their guard drops. Subsequent acquires fail.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        let victims: Vec<_> = state.idle.drain(..).collect();
        state.total -= victims.len();
        drop(state);
        for mut conn in victims {
            let _ = conn.close();
        }
        self.shared.available.notify_all();
        tracing::debug!("pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Pool")
            .field("total", &stats.total_connections)
            .field("idle", &stats.idle_connections)
            .field("pending", &stats.pending_requests)
            .finish()
    }
}

/// A physical connection checked out of the pool.
///
/// Returns the connection on drop. A connection dropped while still
/// attached is force-detached first; a dead one is discarded instead of
/// being pooled again.
pub struct PooledConn {
    conn: Option<PhysicalConnection>,
    shared: Arc<PoolShared>,
}

impl PooledConn {
    fn release(shared: &Arc<PoolShared>, mut conn: PhysicalConnection) {
        if conn.is_attached() {
            conn.force_detach();
        }
        let mut state = shared.state.lock();
        if state.closed || conn.is_dead() {
            state.total -= 1;
            MutexGuard::unlocked(&mut state, || {
                let _ = conn.close();
            });
        } else {
            state.idle.push_back(conn);
        }
        drop(state);
        shared.available.notify_one();
    }
}

// `Result::unwrap_err` in tests needs the `Ok` type to be `Debug`.
#[cfg(test)]
impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn").finish_non_exhaustive()
    }
}

impl std::ops::Deref for PooledConn {
    type Target = PhysicalConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection already returned to pool")
    }
}

impl std::ops::DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection already returned to pool")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            Self::release(&self.shared, conn);
        }
    }
}
