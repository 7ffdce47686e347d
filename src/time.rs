//! Time sources: the millisecond wall clock and the MVCC stamp generator.
//!
//! Nothing in the engine reads the OS clock directly. Both sources are
//! owned by the configuration so tests (and hosts that cache the time
//! once per event-loop tick) can drive them deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Millisecond wall-clock source.
#[derive(Debug, Clone)]
pub enum Clock {
    /// Read the OS clock on every call.
    System,
    /// A manually driven clock, advanced explicitly. Used by tests and
    /// by embedders that freeze time per event-loop tick.
    Manual(Arc<AtomicU64>),
}

impl Clock {
    /// Creates a manual clock starting at `start_ms`.
    pub fn manual(start_ms: u64) -> Self {
        Clock::Manual(Arc::new(AtomicU64::new(start_ms)))
    }

    /// Current time in milliseconds since the Unix epoch (or since the
    /// manual clock's origin).
    pub fn now_ms(&self) -> u64 {
        match self {
            Clock::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            Clock::Manual(ms) => ms.load(Ordering::Relaxed),
        }
    }

    /// Advances a manual clock. No-op on the system clock.
    pub fn advance(&self, delta_ms: u64) {
        if let Clock::Manual(ms) = self {
            ms.fetch_add(delta_ms, Ordering::Relaxed);
        }
    }

    /// Sets a manual clock to an absolute value. No-op on the system clock.
    pub fn set(&self, now_ms: u64) {
        if let Clock::Manual(ms) = self {
            ms.store(now_ms, Ordering::Relaxed);
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::System
    }
}

/// How many low bits of an MVCC stamp hold the per-millisecond sequence.
/// The top bits carry the wall-clock milliseconds, so stamps sort by
/// time first and by issue order within the same millisecond.
const MVCC_SEQ_BITS: u32 = 20;

/// Generator of strictly monotonic 64-bit MVCC stamps.
///
/// Each write gets a unique stamp; stamps from a lagging clock still
/// increase because the generator never hands out a value at or below
/// the previous one.
#[derive(Debug, Default)]
pub struct MvccClock {
    last: AtomicU64,
}

impl MvccClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next stamp for a write occurring at `now_ms`.
    pub fn next(&self, now_ms: u64) -> u64 {
        let base = now_ms << MVCC_SEQ_BITS;
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = base.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// The most recently issued stamp (zero before the first write).
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }
}
