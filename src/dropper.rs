//! Deferred destruction of bulky values.
//!
//! Freeing a million-entry aggregate inline stalls the event loop for
//! the whole deallocation, so removal paths (UNLINK, expiration,
//! FLUSH ASYNC) hand such values to a reclamation thread and move on.
//! The thread does nothing but let destructors run.
//!
//! Deallocation is CPU-bound work, so the thread is a plain OS thread
//! rather than a task on any async executor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;

use crate::dict::Dict;
use crate::expire::ExpireSet;
use crate::value::Value;

/// Queue depth past which deferral stops paying off. When the
/// reclamation thread is this far behind, freeing inline is cheaper
/// than growing the backlog further.
const BACKLOG_LIMIT: usize = 1024;

/// Handle to the reclamation thread. Cloneable; once every handle is
/// gone the queue closes and the thread exits.
#[derive(Debug, Clone)]
pub struct DropHandle {
    queue: Sender<Box<dyn Send>>,
    /// Items queued but not yet reclaimed. Approximate: updated on
    /// both sides without coordination.
    backlog: Arc<AtomicUsize>,
}

impl DropHandle {
    /// Spawns the reclamation thread and returns a handle.
    ///
    /// If the thread cannot be spawned the queue is left disconnected
    /// and every deferral quietly degrades to an inline drop.
    pub fn spawn() -> Self {
        let (queue, work) = mpsc::channel::<Box<dyn Send>>();
        let backlog = Arc::new(AtomicUsize::new(0));
        let reclaimed = Arc::clone(&backlog);

        let spawned = std::thread::Builder::new()
            .name("mangrove-reclaim".into())
            .spawn(move || {
                for garbage in work {
                    drop(garbage);
                    reclaimed.fetch_sub(1, Ordering::Relaxed);
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("no reclamation thread, values will be freed inline: {e}");
        }

        Self { queue, backlog }
    }

    /// Ships one piece of garbage to the reclamation thread, unless
    /// the backlog says the thread is swamped (then the caller's drop
    /// of the boxed payload happens right here). Never blocks.
    fn offload(&self, garbage: Box<dyn Send>) {
        if self.backlog.load(Ordering::Relaxed) >= BACKLOG_LIMIT {
            return;
        }
        self.backlog.fetch_add(1, Ordering::Relaxed);
        if self.queue.send(garbage).is_err() {
            // no thread on the other end; the send handed the payload
            // back and it dropped inline
            self.backlog.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Defers a removed value. Small values are excluded: for them
    /// the queue round-trip costs more than the free itself.
    pub fn defer_value(&self, value: Value) {
        if value.is_large() {
            self.offload(Box::new(value));
        }
    }

    /// Defers a whole flushed layer. A full keyspace is always worth
    /// shipping.
    pub(crate) fn defer_layer(&self, dict: Dict<Value>, expires: ExpireSet) {
        if !dict.is_empty() || !expires.is_empty() {
            self.offload(Box::new((dict, expires)));
        }
    }
}
