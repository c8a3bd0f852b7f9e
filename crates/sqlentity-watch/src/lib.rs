//! Change-detection poller for SQLEntity.
//!
//! A [`Watcher`] owns one logical connection on a background thread and
//! polls the master modification counter at a fixed interval. Watched
//! tables get a callback whenever their serial advances past the last
//! value the watcher reported. An idle system costs one single-row
//! SELECT per interval; a change costs one more bulk read for all
//! watched tables together.
//!
//! The thread doubles as a serialized executor for the connection it
//! owns: [`Watcher::run_soon`] queues a one-shot job and wakes the
//! thread so the job runs without waiting out the poll interval.

mod dispatch;
mod watcher;

pub use dispatch::{Dispatcher, InlineDispatcher};
pub use watcher::{WatchConfig, WatchToken, Watcher};
