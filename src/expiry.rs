//! Expiration: the lazy check on access and the active cycle.
//!
//! Lazy expiration runs inside every lookup: a key past its deadline
//! is deleted on the spot (on a primary) or reported as logically
//! expired without deletion (on a replica waiting for the master's
//! DEL). Active expiration walks the expire set in deadline order from
//! a per-database cursor so cold keys are reclaimed even when nobody
//! reads them.

use bytes::Bytes;

use crate::config::Role;
use crate::expire::ExpireRecord;
use crate::hooks::EventKind;
use crate::keyspace::Keyspace;

/// Candidates probed per active-cycle round.
const SAMPLE_SIZE: usize = 20;

/// If at least this fraction of a round's probes were expired, the
/// cycle runs another round.
const EXPIRED_THRESHOLD: f64 = 0.25;

/// Maximum rounds per tick, bounding time away from the command loop.
const MAX_ROUNDS: usize = 3;

impl Keyspace {
    /// Whether the key's whole-key deadline has passed. Sub-key
    /// deadlines are not consulted. Nothing expires during a bulk
    /// load, and time stands still inside a script.
    pub(crate) fn key_is_expired(&mut self, db: usize, key: &[u8]) -> bool {
        if self.dbs[db].data.expires_size() == 0 {
            return false;
        }
        let Some(when) = self.dbs[db]
            .data
            .expire_record(key)
            .and_then(ExpireRecord::whole_when)
        else {
            return false;
        };
        if self.loading {
            return false;
        }
        self.now_ms() > when
    }

    /// The lazy expiration check every lookup goes through. Returns
    /// `true` when the key is expired. On a primary (or active
    /// replica) the key is deleted, the deletion is propagated to the
    /// append-only log and replicas, and an `expired` event fires; a
    /// plain replica only reports the logical state and waits for the
    /// master's DEL.
    pub fn expire_if_needed(&mut self, db: usize, key: &[u8]) -> bool {
        if !self.key_is_expired(db, key) {
            return false;
        }
        if self.config.role == Role::Replica {
            return true;
        }
        self.counters.expired += 1;
        self.propagate_expire(db, key);
        self.hooks
            .notify_keyspace_event(EventKind::Expired, "expired", key, db);
        let lazy = self.config.lazy_free_expire;
        self.delete_generic(db, key, lazy);
        true
    }

    /// Feeds the DEL (or UNLINK, under lazy free) of an expired key to
    /// the append-only log and the replication stream. Active replicas
    /// expire on their own, so nothing is fed to their peers.
    fn propagate_expire(&mut self, db: usize, key: &[u8]) {
        let cmd: &'static [u8] = if self.config.lazy_free_expire {
            b"UNLINK"
        } else {
            b"DEL"
        };
        let argv = [Bytes::from_static(cmd), Bytes::copy_from_slice(key)];
        if self.config.aof_enabled {
            self.hooks.feed_append_only(db, &argv);
        }
        if self.config.role != Role::ActiveReplica {
            self.hooks.feed_replicas(db, &argv);
        }
    }

    /// Sets a whole-key TTL (no subkey) or one field's TTL (with a
    /// subkey) at an absolute deadline. Updates the database's
    /// average-TTL window. `from_master` marks deadlines applied from
    /// the replication stream; a writable replica remembers
    /// client-set ones so it can enforce them itself.
    ///
    /// The key must exist.
    pub fn set_expire(
        &mut self,
        db: usize,
        key: &[u8],
        subkey: Option<&[u8]>,
        when_ms: u64,
        from_master: bool,
    ) {
        let now = self.now_ms();
        self.dbs[db].note_expire_set(now, when_ms);
        self.dbs[db]
            .data
            .set_expire(key, subkey.map(Bytes::copy_from_slice), when_ms);
        let writable_replica = self.config.role.is_replica() && !self.config.replica_read_only;
        if writable_replica && !from_master {
            self.hooks.remember_replica_expire(db, key);
        }
    }

    /// Removes a whole-key TTL (no subkey) or one field's TTL. The
    /// value's expire flag clears only when no deadlines remain.
    /// Returns whether a deadline was removed. The key must exist.
    pub fn remove_expire(&mut self, db: usize, key: &[u8], subkey: Option<&[u8]>) -> bool {
        match subkey {
            None => self.dbs[db].data.remove_expire(key),
            Some(sub) => self.dbs[db].data.remove_subkey_expire(key, sub),
        }
    }

    /// The full expire record of a key, or `None` when it has no TTL.
    pub fn get_expire(&mut self, db: usize, key: &[u8]) -> Option<&ExpireRecord> {
        self.dbs[db].data.expire_record(key)
    }

    /// The whole-key deadline in absolute milliseconds.
    pub fn get_expire_ms(&mut self, db: usize, key: &[u8]) -> Option<u64> {
        self.dbs[db]
            .data
            .expire_record(key)
            .and_then(ExpireRecord::whole_when)
    }
}

/// Runs one active expiration cycle on a database.
///
/// Probes up to [`SAMPLE_SIZE`] candidates per round from the
/// database's cursor position in deadline order, deletes the expired
/// ones through the same propagation path as lazy expiration, and
/// repeats while at least a quarter of the probes were expired (up to
/// [`MAX_ROUNDS`]). Replicas don't run the cycle; the master drives
/// their expiration. Returns the number of keys removed.
pub fn run_expiration_cycle(ks: &mut Keyspace, db: usize) -> usize {
    if ks.config().role == Role::Replica {
        return 0;
    }
    let mut total = 0;
    for _ in 0..MAX_ROUNDS {
        let cursor = ks.dbs[db].expire_cursor.clone();
        let mut candidates = ks.dbs[db]
            .data
            .expires()
            .candidates_after(cursor.as_ref(), SAMPLE_SIZE);
        if candidates.len() < SAMPLE_SIZE {
            // reached the end of the set: wrap to the front
            ks.dbs[db].expire_cursor = None;
            let mut front = ks.dbs[db]
                .data
                .expires()
                .candidates_after(None, SAMPLE_SIZE - candidates.len());
            front.retain(|c| !candidates.contains(c));
            candidates.extend(front);
        }
        if candidates.is_empty() {
            break;
        }
        ks.dbs[db].expire_cursor = candidates.last().cloned();
        let probed = candidates.len();
        let now = ks.now_ms();
        let mut removed = 0;
        for (when, key) in candidates {
            if now > when && ks.expire_if_needed(db, &key) {
                removed += 1;
            }
        }
        total += removed;
        if (removed as f64) < probed as f64 * EXPIRED_THRESHOLD {
            break;
        }
    }
    total
}
