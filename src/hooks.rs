//! Collaborator hooks invoked by the engine.
//!
//! The keyspace does not talk to clients, replicas, or disks itself;
//! it calls out through these traits at the points where the command
//! layer, replication feed, and optional storage tier observe it.
//! Every method has a no-op default so embedders implement only what
//! they consume.

use bytes::Bytes;

use crate::value::Value;

/// Classes of keyspace notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Generic,
    Expired,
    KeyMiss,
}

/// Observers of keyspace activity.
pub trait Hooks: Send {
    /// Keyspace notification (`expired`, `rename_from`, `keymiss`, ...).
    fn notify_keyspace_event(&mut self, _kind: EventKind, _event: &str, _key: &[u8], _db: usize) {}

    /// A watched key was modified; transactions watching it must abort.
    fn touch_watched_key(&mut self, _db: usize, _key: &[u8]) {}

    /// Client-side caching invalidation for a modified key.
    fn tracking_invalidate_key(&mut self, _key: &[u8]) {}

    /// A key of a blocking-capable type became available; waiters on
    /// BLPOP-like commands can be retried.
    fn signal_key_ready(&mut self, _db: usize, _key: &[u8]) {}

    /// Propagate a command (typically the DEL/UNLINK of a lazy
    /// expiration) to the append-only log.
    fn feed_append_only(&mut self, _db: usize, _argv: &[Bytes]) {}

    /// Propagate a command to connected replicas.
    fn feed_replicas(&mut self, _db: usize, _argv: &[Bytes]) {}

    /// A writable replica applied a client-set expire; the key must be
    /// remembered so the replica can expire it locally.
    fn remember_replica_expire(&mut self, _db: usize, _key: &[u8]) {}
}

/// Hooks implementation that observes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHooks;

impl Hooks for NullHooks {}

/// Optional on-disk tier fed by change tracking: when a tracked write
/// batch completes, changed keys are written through (or erased).
pub trait StorageTier: Send {
    fn insert(&mut self, key: &[u8], value: &Value);
    fn erase(&mut self, key: &[u8]);
    fn clear(&mut self);
    fn retrieve(&self, key: &[u8]) -> Option<Value>;
}
