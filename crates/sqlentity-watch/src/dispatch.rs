//! Callback dispatch seam.

/// Runs watcher callbacks.
///
/// The default dispatcher invokes callbacks on the poller thread
/// itself, which keeps ordering obvious but stalls polling for the
/// duration of the callback. Callers with their own executor hand in a
/// forwarding implementation instead.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, job: Box<dyn FnOnce() + Send>);
}

/// Runs each job immediately on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}
