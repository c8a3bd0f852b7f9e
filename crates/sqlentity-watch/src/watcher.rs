//! The modification poller.
//!
//! One background thread owns one [`LogicalConnection`] and ticks at a
//! fixed interval. A tick runs the registered tick callbacks, drains
//! the one-shot work queue, then reads the master serial. Only when the
//! master moved does it fetch the per-table serials of every watched
//! table in a single `IN (...)` query and fire the callbacks of the
//! tables that advanced, so a quiet system costs one single-row SELECT
//! per interval and a busy one at most two queries per tick.

use crate::dispatch::{Dispatcher, InlineDispatcher};
use parking_lot::{Condvar, Mutex};
use sqlentity_core::Result;
use sqlentity_session::{LogicalConnection, select_master_serial, select_modifications};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Poller configuration.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Keep polling through transient failures (server processes)
    pub server_mode: bool,
    /// Consecutive failures tolerated in server mode
    pub retry_threshold: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            server_mode: false,
            retry_threshold: 10,
        }
    }
}

impl WatchConfig {
    /// Create a poller configuration with the given interval.
    pub fn new(poll_interval_ms: u64) -> Self {
        Self {
            poll_interval_ms,
            ..Default::default()
        }
    }

    /// Enable/disable server mode.
    pub fn server_mode(mut self, on: bool) -> Self {
        self.server_mode = on;
        self
    }

    /// Set the server-mode failure threshold.
    pub fn retry_threshold(mut self, n: u32) -> Self {
        self.retry_threshold = n;
        self
    }
}

type TableCallback = Arc<dyn Fn(i64) + Send + Sync>;
type TickCallback = Arc<dyn Fn() + Send + Sync>;
type ShutdownCallback = Box<dyn FnOnce() + Send>;
type Job = Box<dyn FnOnce(&mut LogicalConnection) + Send>;

/// Handle for removing a table watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchToken(u64);

struct TableWatch {
    token: u64,
    table: String,
    last_serial: i64,
    callback: TableCallback,
}

#[derive(Default)]
struct WatchList {
    next_token: u64,
    tables: Vec<TableWatch>,
    ticks: Vec<TickCallback>,
    shutdown: Vec<ShutdownCallback>,
}

struct SharedState {
    /// Registration lock. Held only for list manipulation, never while
    /// a callback runs.
    watches: Mutex<WatchList>,
    /// One-shot jobs, under their own lock.
    jobs: Mutex<VecDeque<Job>>,
    wake: Mutex<()>,
    wakeup: Condvar,
    stop: AtomicBool,
    idle: AtomicBool,
}

/// Handle to the poller thread.
///
/// Dropping the handle stops the thread and joins it; [`terminate`]
/// does the same explicitly.
///
/// [`terminate`]: Watcher::terminate
pub struct Watcher {
    shared: Arc<SharedState>,
    thread: Option<JoinHandle<()>>,
}

impl Watcher {
    /// Start polling on `conn`, running callbacks on the poller thread.
    #[allow(clippy::result_large_err)]
    pub fn spawn(conn: LogicalConnection, config: WatchConfig) -> Result<Self> {
        Self::spawn_with(conn, config, Arc::new(InlineDispatcher))
    }

    /// Start polling with a caller-supplied callback dispatcher.
    #[allow(clippy::result_large_err)]
    pub fn spawn_with(
        conn: LogicalConnection,
        config: WatchConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Self> {
        let shared = Arc::new(SharedState {
            watches: Mutex::new(WatchList::default()),
            jobs: Mutex::new(VecDeque::new()),
            wake: Mutex::new(()),
            wakeup: Condvar::new(),
            stop: AtomicBool::new(false),
            idle: AtomicBool::new(false),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("sqlentity-watch".to_string())
            .spawn(move || run(conn, &config, &thread_shared, dispatcher.as_ref()))?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Watch a table from serial 0: every change the watcher has not
    /// yet reported for that table fires the callback, including
    /// changes from before registration once the master next moves.
    pub fn watch(
        &self,
        table: impl Into<String>,
        callback: impl Fn(i64) + Send + Sync + 'static,
    ) -> WatchToken {
        self.watch_from(table, 0, callback)
    }

    /// Watch a table from an already-observed serial; changes at or
    /// before it stay silent.
    pub fn watch_from(
        &self,
        table: impl Into<String>,
        last_serial: i64,
        callback: impl Fn(i64) + Send + Sync + 'static,
    ) -> WatchToken {
        let mut list = self.shared.watches.lock();
        list.next_token += 1;
        let token = list.next_token;
        list.tables.push(TableWatch {
            token,
            table: table.into(),
            last_serial,
            callback: Arc::new(callback),
        });
        WatchToken(token)
    }

    /// Remove a table watch. Returns false when the token is unknown.
    pub fn unwatch(&self, token: WatchToken) -> bool {
        let mut list = self.shared.watches.lock();
        let before = list.tables.len();
        list.tables.retain(|w| w.token != token.0);
        list.tables.len() != before
    }

    /// Run a callback at the start of every tick, polling or not.
    pub fn on_tick(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.shared.watches.lock().ticks.push(Arc::new(callback));
    }

    /// Run a callback when the poller dies of repeated failures.
    pub fn on_shutdown(&self, callback: impl FnOnce() + Send + 'static) {
        self.shared.watches.lock().shutdown.push(Box::new(callback));
    }

    /// Queue a one-shot job for the poller's connection and wake the
    /// thread so it runs without waiting out the interval.
    pub fn run_soon(&self, job: impl FnOnce(&mut LogicalConnection) + Send + 'static) {
        self.shared.jobs.lock().push_back(Box::new(job));
        self.wake();
    }

    /// Pause or resume database polling. While idle the thread keeps
    /// ticking and draining the work queue but issues no queries.
    pub fn set_idle(&self, idle: bool) {
        self.shared.idle.store(idle, Ordering::Release);
        if !idle {
            self.wake();
        }
    }

    /// Ask the thread to stop after the current tick.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.wake();
    }

    /// Stop the thread and wait for it to exit.
    pub fn terminate(mut self) {
        self.request_stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("watcher thread panicked");
            }
        }
    }

    /// Whether the poller thread is still alive.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn wake(&self) {
        let _guard = self.shared.wake.lock();
        self.shared.wakeup.notify_all();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run(
    mut conn: LogicalConnection,
    config: &WatchConfig,
    shared: &SharedState,
    dispatcher: &dyn Dispatcher,
) {
    tracing::info!(
        interval_ms = config.poll_interval_ms,
        server_mode = config.server_mode,
        "watcher started"
    );
    let interval = Duration::from_millis(config.poll_interval_ms);
    let mut last_master: Option<i64> = None;
    let mut failures: u32 = 0;

    while !shared.stop.load(Ordering::Acquire) {
        run_ticks(shared);
        run_jobs(shared, &mut conn);

        if !shared.idle.load(Ordering::Acquire) {
            match poll_once(&mut conn, shared, dispatcher, &mut last_master) {
                Ok(()) => failures = 0,
                Err(err) => {
                    failures += 1;
                    tracing::warn!(error = %err, failures, "watcher poll failed");
                    if !config.server_mode || failures > config.retry_threshold {
                        tracing::error!(failures, "watcher shutting down after poll failure");
                        run_shutdown(shared);
                        return;
                    }
                }
            }
        }

        let mut guard = shared.wake.lock();
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        if shared.jobs.lock().is_empty() {
            shared.wakeup.wait_for(&mut guard, interval);
        }
    }
    tracing::info!("watcher stopped");
}

fn run_ticks(shared: &SharedState) {
    let ticks: Vec<TickCallback> = {
        let list = shared.watches.lock();
        list.ticks.iter().map(Arc::clone).collect()
    };
    for tick in ticks {
        tick();
    }
}

fn run_jobs(shared: &SharedState, conn: &mut LogicalConnection) {
    loop {
        let job = shared.jobs.lock().pop_front();
        let Some(job) = job else { break };
        job(conn);
    }
}

/// One polling pass: master read, then the bulk per-table read when the
/// master moved. The first successful read only records the baseline.
#[allow(clippy::result_large_err)]
fn poll_once(
    conn: &mut LogicalConnection,
    shared: &SharedState,
    dispatcher: &dyn Dispatcher,
    last_master: &mut Option<i64>,
) -> Result<()> {
    let master = select_master_serial(conn)?;
    let moved = last_master.is_some_and(|last| last != master);
    *last_master = Some(master);
    if !moved {
        return Ok(());
    }
    tracing::debug!(master, "master serial moved");

    let watched: Vec<String> = {
        let list = shared.watches.lock();
        list.tables.iter().map(|w| w.table.clone()).collect()
    };
    if watched.is_empty() {
        return Ok(());
    }
    let names: Vec<&str> = watched.iter().map(String::as_str).collect();
    let serials = select_modifications(conn, &names)?;

    for (table, serial) in serials {
        notify_table(shared, dispatcher, &table, serial);
    }
    Ok(())
}

/// Fire the callbacks of every watch on `table` that has not seen
/// `serial` yet. Dispatch happens outside the registration lock, and
/// the remembered serial advances only after the callback went out.
fn notify_table(shared: &SharedState, dispatcher: &dyn Dispatcher, table: &str, serial: i64) {
    let pending: Vec<(u64, TableCallback)> = {
        let list = shared.watches.lock();
        list.tables
            .iter()
            .filter(|w| w.table == table && w.last_serial != serial)
            .map(|w| (w.token, Arc::clone(&w.callback)))
            .collect()
    };
    for (token, callback) in pending {
        tracing::debug!(table, serial, "table serial moved");
        dispatcher.dispatch(Box::new(move || callback(serial)));
        let mut list = shared.watches.lock();
        if let Some(watch) = list.tables.iter_mut().find(|w| w.token == token) {
            watch.last_serial = serial;
        }
    }
}

fn run_shutdown(shared: &SharedState) {
    let callbacks: Vec<ShutdownCallback> = {
        let mut list = shared.watches.lock();
        std::mem::take(&mut list.shutdown)
    };
    for callback in callbacks {
        callback();
    }
}
