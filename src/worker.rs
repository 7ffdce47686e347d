//! Offloaded snapshot scans.
//!
//! Pattern enumeration over a whole database (KEYS) can take long
//! enough to stall the event loop. The engine freezes a snapshot under
//! the lock, ships it to a worker thread, and the worker streams the
//! matches into a completion that the event-loop owner drains on its
//! own thread — the snapshot is released there, never on the worker.
//!
//! The worker polls a cancellation flag between entries so a closing
//! client stops the scan early; the completion (and with it the
//! snapshot release) is still posted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::Arc;

use bytes::Bytes;

use crate::data::Snapshot;
use crate::keyspace::GlobPattern;

/// Queued jobs the worker can hold before callers fall back to
/// scanning inline.
const JOB_QUEUE_CAPACITY: usize = 128;

/// Cancellation handle for an offloaded scan.
#[derive(Debug, Clone)]
pub struct ScanCancel(Arc<AtomicBool>);

impl ScanCancel {
    pub(crate) fn new(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }

    /// Asks the scan to stop at the next entry boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

pub(crate) struct ScanJob {
    pub db: usize,
    pub snapshot: Arc<Snapshot>,
    pub pattern: GlobPattern,
    pub now_ms: u64,
    pub cancel: Arc<AtomicBool>,
    pub done: Box<dyn FnOnce(Vec<Bytes>, bool) + Send>,
}

pub(crate) struct Completion {
    pub db: usize,
    pub snapshot: Arc<Snapshot>,
    pub keys: Vec<Bytes>,
    pub cancelled: bool,
    pub done: Box<dyn FnOnce(Vec<Bytes>, bool) + Send>,
}

/// Runs one scan against a frozen snapshot. Returns the matching keys
/// and whether the scan was cancelled mid-way.
pub(crate) fn run_scan(
    snapshot: &Snapshot,
    pattern: &GlobPattern,
    now_ms: u64,
    cancel: &AtomicBool,
) -> (Vec<Bytes>, bool) {
    let mut keys = Vec::new();
    let mut cancelled = false;
    snapshot.for_each_visible(&mut |key, _value| {
        if cancel.load(Ordering::Relaxed) {
            cancelled = true;
            return false;
        }
        if pattern.matches(key) {
            // skip keys already past their whole-key deadline at the
            // time the job was created
            let expired = snapshot
                .expire_of(key)
                .and_then(|r| r.whole_when())
                .is_some_and(|when| now_ms > when);
            if !expired {
                keys.push(key.clone());
            }
        }
        true
    });
    (keys, cancelled)
}

/// The scan worker: one background thread plus a completion queue the
/// event-loop owner drains.
pub(crate) struct WorkerPool {
    jobs: SyncSender<ScanJob>,
    completions: Receiver<Completion>,
}

impl WorkerPool {
    pub fn spawn() -> Self {
        let (jobs, job_rx) = mpsc::sync_channel::<ScanJob>(JOB_QUEUE_CAPACITY);
        let (done_tx, completions) = mpsc::channel::<Completion>();

        if let Err(e) = std::thread::Builder::new()
            .name("mangrove-scan".into())
            .spawn(move || worker_loop(job_rx, done_tx))
        {
            tracing::warn!("failed to spawn scan worker, KEYS will run inline: {e}");
        }

        Self { jobs, completions }
    }

    /// Queues a job; hands it back when the worker is unavailable or
    /// saturated so the caller can run it inline.
    pub fn submit(&self, job: ScanJob) -> Result<(), ScanJob> {
        match self.jobs.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => Err(job),
        }
    }

    pub fn try_completion(&self) -> Option<Completion> {
        self.completions.try_recv().ok()
    }
}

fn worker_loop(jobs: Receiver<ScanJob>, done_tx: Sender<Completion>) {
    while let Ok(job) = jobs.recv() {
        let ScanJob {
            db,
            snapshot,
            pattern,
            now_ms,
            cancel,
            done,
        } = job;
        let (keys, cancelled) = run_scan(&snapshot, &pattern, now_ms, &cancel);
        let posted = done_tx.send(Completion {
            db,
            snapshot,
            keys,
            cancelled,
            done,
        });
        if posted.is_err() {
            // the engine is gone; the snapshot Arc drops here
            return;
        }
    }
}
