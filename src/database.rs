//! Numbered database wrapper.
//!
//! A `Database` is one slot of the keyspace array: the persistent data
//! plus the client-facing indices (blocking waiters, ready keys,
//! watched keys) and the per-database expiration statistics. When two
//! databases are swapped, the persistent data and expiration state
//! move but the client indices stay, so connected clients remain bound
//! to their database number.

use std::collections::VecDeque;

use ahash::AHashMap;
use bytes::Bytes;

use crate::data::PersistentData;

/// Identifier of a blocked or watching client, assigned by the caller.
pub type ClientId = u64;

#[derive(Debug, Default)]
pub struct Database {
    pub(crate) id: usize,
    pub(crate) data: PersistentData,
    /// Keys with clients blocked on them (BLPOP-style), in wait order.
    pub(crate) blocking_keys: AHashMap<Bytes, VecDeque<ClientId>>,
    /// Keys that became ready since the embedder last drained them.
    pub(crate) ready_keys: Vec<Bytes>,
    /// Keys watched by transactions.
    pub(crate) watched_keys: AHashMap<Bytes, Vec<ClientId>>,
    /// Resume position of the active expiration cycle.
    pub(crate) expire_cursor: Option<(u64, Bytes)>,
    /// Moving average TTL of the expire set, in milliseconds. May dip
    /// below zero transiently; clamp on read.
    pub(crate) avg_ttl_ms: f64,
    pub(crate) last_expire_set_ms: u64,
    /// Keys queued for a later defragmentation pass.
    pub(crate) defrag_queue: VecDeque<Bytes>,
}

impl Database {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Updates the average-TTL moving window for a new expire at
    /// `when_ms`. The window first slides by the elapsed time and by
    /// one slot, then admits the new entry; this keeps the average
    /// current without rescanning the expire set.
    pub(crate) fn note_expire_set(&mut self, now_ms: u64, when_ms: u64) {
        let expire_size = self.data.live_expire_size();
        self.avg_ttl_ms -= now_ms.saturating_sub(self.last_expire_set_ms) as f64;
        if expire_size == 0 {
            self.avg_ttl_ms = 0.0;
        } else {
            self.avg_ttl_ms -= self.avg_ttl_ms / expire_size as f64;
        }
        if self.avg_ttl_ms < 0.0 {
            self.avg_ttl_ms = 0.0;
        }
        self.avg_ttl_ms += (when_ms as f64 - now_ms as f64) / (expire_size + 1) as f64;
        self.last_expire_set_ms = now_ms;
    }

    /// Average TTL of expiring keys in milliseconds.
    pub fn avg_ttl_ms(&self) -> u64 {
        self.avg_ttl_ms.max(0.0) as u64
    }

    /// Registers a client blocked on `key`.
    pub(crate) fn block_on_key(&mut self, key: Bytes, client: ClientId) {
        self.blocking_keys.entry(key).or_default().push_back(client);
    }

    /// Drops a disconnecting client from every wait list.
    pub(crate) fn unblock_client(&mut self, client: ClientId) {
        self.blocking_keys.retain(|_, waiters| {
            waiters.retain(|c| *c != client);
            !waiters.is_empty()
        });
    }

    pub(crate) fn watch_key(&mut self, key: Bytes, client: ClientId) {
        let watchers = self.watched_keys.entry(key).or_default();
        if !watchers.contains(&client) {
            watchers.push(client);
        }
    }

    pub(crate) fn unwatch_client(&mut self, client: ClientId) {
        self.watched_keys.retain(|_, watchers| {
            watchers.retain(|c| *c != client);
            !watchers.is_empty()
        });
    }

    /// Swaps the keyspace contents with `other`, leaving the client
    /// indices (blocking, ready, watched) bound to their slots.
    pub(crate) fn swap_contents(&mut self, other: &mut Database) {
        std::mem::swap(&mut self.data, &mut other.data);
        std::mem::swap(&mut self.expire_cursor, &mut other.expire_cursor);
        std::mem::swap(&mut self.avg_ttl_ms, &mut other.avg_ttl_ms);
        std::mem::swap(&mut self.last_expire_set_ms, &mut other.last_expire_set_ms);
        std::mem::swap(&mut self.defrag_queue, &mut other.defrag_queue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_index_tracks_waiters() {
        let mut db = Database::new(0);
        db.block_on_key(Bytes::from_static(b"list"), 1);
        db.block_on_key(Bytes::from_static(b"list"), 2);
        db.block_on_key(Bytes::from_static(b"other"), 1);
        assert_eq!(db.blocking_keys.len(), 2);

        db.unblock_client(1);
        assert_eq!(db.blocking_keys.len(), 1);
        assert_eq!(db.blocking_keys[&Bytes::from_static(b"list")].len(), 1);
    }

    #[test]
    fn watch_index_deduplicates() {
        let mut db = Database::new(0);
        db.watch_key(Bytes::from_static(b"k"), 7);
        db.watch_key(Bytes::from_static(b"k"), 7);
        assert_eq!(db.watched_keys[&Bytes::from_static(b"k")].len(), 1);
        db.unwatch_client(7);
        assert!(db.watched_keys.is_empty());
    }

    #[test]
    fn avg_ttl_window_moves() {
        let mut db = Database::new(0);
        db.note_expire_set(1_000, 11_000);
        let first = db.avg_ttl_ms();
        assert!(first > 0 && first <= 10_000);
        // a much shorter TTL pulls the average down
        db.note_expire_set(1_000, 1_500);
        assert!(db.avg_ttl_ms() < first);
    }

    #[test]
    fn swap_keeps_client_indices() {
        let mut a = Database::new(0);
        let mut b = Database::new(1);
        a.block_on_key(Bytes::from_static(b"k"), 1);
        a.data
            .insert(b"x", crate::value::Value::string(Bytes::from_static(b"v")));
        b.avg_ttl_ms = 5_000.0;

        a.swap_contents(&mut b);
        // data moved, waiter index stayed
        assert_eq!(a.data.size(), 0);
        assert_eq!(b.data.size(), 1);
        assert!(a.blocking_keys.contains_key(&Bytes::from_static(b"k")));
        assert!(b.blocking_keys.is_empty());
        assert_eq!(a.avg_ttl_ms(), 5_000);
    }
}
