//! The public keyspace API.
//!
//! A `Keyspace` owns the numbered databases and implements the full
//! operation surface: role-aware lookups with expiration enforcement
//! and recency updates, insert/overwrite/upsert, the MVCC last-writer-
//! wins merge used by active-active replication, rename/move/swap,
//! cursor scans, offloaded pattern enumeration, and flushes.
//!
//! All methods assume the caller holds the process's coarse engine
//! lock (single event-loop thread); the only work that leaves that
//! thread is the background dropper and snapshot-backed scans.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::config::{EngineConfig, RecencyPolicy, Role};
use crate::data::Snapshot;
use crate::database::{ClientId, Database};
use crate::dropper::DropHandle;
use crate::error::KeyspaceError;
use crate::expire::ExpireRecord;
use crate::hooks::{EventKind, Hooks, NullHooks, StorageTier};
use crate::slots::SlotIndex;
use crate::time::MvccClock;
use crate::value::{Encoding, HashRepr, Payload, SetRepr, Value, ValueType, ZSetRepr};
use crate::worker::{Completion, ScanCancel, ScanJob, WorkerPool};

/// Flags modifying lookup behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct LookupFlags {
    /// Don't update access-recency metadata.
    pub no_touch: bool,
    /// Stamp a fresh MVCC timestamp and mark the key as changed.
    pub update_mvcc: bool,
    /// The caller is the replication master. On a replica, reads of
    /// logically expired keys are allowed through for the master only.
    pub master_caller: bool,
}

impl LookupFlags {
    pub const NONE: LookupFlags = LookupFlags {
        no_touch: false,
        update_mvcc: false,
        master_caller: false,
    };

    pub const NO_TOUCH: LookupFlags = LookupFlags {
        no_touch: true,
        update_mvcc: false,
        master_caller: false,
    };
}

/// Engine-wide counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyspaceCounters {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub dirty: u64,
}

/// Point-in-time statistics of one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbStats {
    pub key_count: usize,
    pub keys_with_expiry: usize,
    pub avg_ttl_ms: u64,
    pub snapshot_depth: usize,
}

/// Typed results of a composite-value scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanItems {
    Members(Vec<Bytes>),
    Fields(Vec<(Bytes, Bytes)>),
    Scored(Vec<(Bytes, f64)>),
}

/// Options recognised by the cursor scans.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Glob pattern filter (MATCH).
    pub pattern: Option<String>,
    /// Batch size hint (COUNT); `None` means the default of 10.
    pub count: Option<usize>,
    /// Restrict database scans to one value type (TYPE).
    pub type_filter: Option<ValueType>,
}

/// Parses a textual cursor.
pub fn parse_cursor(text: &str) -> Result<u64, KeyspaceError> {
    text.trim_start_matches('+')
        .parse::<u64>()
        .map_err(|_| KeyspaceError::InvalidCursor)
}

/// A held snapshot of one database, readable without the engine lock.
/// Must be returned through [`Keyspace::release_snapshot`].
#[derive(Debug)]
pub struct SnapshotRef {
    db: usize,
    inner: Arc<Snapshot>,
}

impl SnapshotRef {
    pub fn db(&self) -> usize {
        self.db
    }

    pub fn mvcc_checkpoint(&self) -> u64 {
        self.inner.mvcc_checkpoint()
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.inner.get_visible(key).map(|(_, value)| value)
    }

    pub fn for_each(&self, f: &mut dyn FnMut(&Bytes, &Value) -> bool) -> bool {
        self.inner.for_each_visible(f)
    }
}

/// The keyspace engine.
pub struct Keyspace {
    pub(crate) dbs: Vec<Database>,
    pub(crate) config: EngineConfig,
    pub(crate) hooks: Box<dyn Hooks>,
    storage: Vec<Option<Box<dyn StorageTier>>>,
    slot_index: Option<SlotIndex>,
    pub(crate) mvcc: MvccClock,
    dropper: Option<DropHandle>,
    workers: Option<WorkerPool>,
    pub(crate) counters: KeyspaceCounters,
    /// Bulk-load recovery in progress: nothing expires.
    pub(crate) loading: bool,
    /// A persistence child is forked: skip recency updates to avoid
    /// copy-on-write storms in the child.
    persist_child_active: bool,
    /// Active background-save holders; snapshot release is forbidden
    /// while one exists.
    save_holders: u32,
    /// Frozen "now" while a script runs, for deterministic replication.
    script_now_ms: Option<u64>,
}

impl Keyspace {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_hooks(config, Box::new(NullHooks))
    }

    pub fn with_hooks(config: EngineConfig, hooks: Box<dyn Hooks>) -> Self {
        let dbs = (0..config.db_count.max(1)).map(Database::new).collect();
        let storage = (0..config.db_count.max(1)).map(|_| None).collect();
        let slot_index = config.cluster_enabled.then(SlotIndex::new);
        let dropper = (config.lazy_free_expire || config.lazy_free_server_del)
            .then(DropHandle::spawn);
        Self {
            dbs,
            config,
            hooks,
            storage,
            slot_index,
            mvcc: MvccClock::new(),
            dropper,
            workers: None,
            counters: KeyspaceCounters::default(),
            loading: false,
            persist_child_active: false,
            save_holders: 0,
            script_now_ms: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn counters(&self) -> &KeyspaceCounters {
        &self.counters
    }

    pub fn db_count(&self) -> usize {
        self.dbs.len()
    }

    pub fn db_stats(&self, db: usize) -> DbStats {
        let dbx = &self.dbs[db];
        DbStats {
            key_count: dbx.data.size(),
            keys_with_expiry: dbx.data.expires_size(),
            avg_ttl_ms: dbx.avg_ttl_ms(),
            snapshot_depth: dbx.data.snapshot_depth(),
        }
    }

    pub fn size(&self, db: usize) -> usize {
        self.dbs[db].data.size()
    }

    /// Attaches the lazy-free dropper explicitly (spawned automatically
    /// when a lazy-free policy is configured).
    pub fn set_drop_handle(&mut self, handle: DropHandle) {
        self.dropper = Some(handle);
    }

    /// Attaches an on-disk tier to one database; change tracking
    /// flushes through it.
    pub fn attach_storage(&mut self, db: usize, tier: Box<dyn StorageTier>) {
        self.storage[db] = Some(tier);
    }

    pub fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }

    /// Marks a forked persistence child as running; recency updates
    /// are suspended for its lifetime and snapshot release is
    /// forbidden.
    pub fn begin_save(&mut self) {
        self.save_holders += 1;
        self.persist_child_active = true;
    }

    pub fn end_save(&mut self) {
        assert!(self.save_holders > 0, "end_save without begin_save");
        self.save_holders -= 1;
        if self.save_holders == 0 {
            self.persist_child_active = false;
        }
    }

    /// Freezes the observable time (script execution). Pass `None` to
    /// thaw.
    pub fn freeze_time(&mut self, now_ms: Option<u64>) {
        self.script_now_ms = now_ms;
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.script_now_ms
            .unwrap_or_else(|| self.config.clock.now_ms())
    }

    fn check_db(&self, db: usize) -> Result<(), KeyspaceError> {
        if db < self.dbs.len() {
            Ok(())
        } else {
            Err(KeyspaceError::OutOfRange)
        }
    }

    /// Validates a database index for SELECT-style switching.
    pub fn select(&self, db: usize) -> Result<usize, KeyspaceError> {
        self.check_db(db)?;
        Ok(db)
    }

    /// Periodic maintenance: shrinks oversized tables after mass
    /// deletions. Called from the embedder's cron tick.
    pub fn resize_if_needed(&mut self, db: usize) {
        self.dbs[db].data.resize_if_needed();
    }

    pub(crate) fn dispose_value(&self, value: Value) {
        if self.config.lazy_free_server_del {
            if let Some(dropper) = &self.dropper {
                dropper.defer_value(value);
                return;
            }
        }
        drop(value);
    }

    // --- lookups ---

    /// The low-level lookup: materialises the entry and maintains
    /// recency/MVCC metadata. Returns whether the key is present.
    fn touch_lookup(&mut self, db: usize, key: &[u8], flags: LookupFlags) -> bool {
        let now = self.now_ms();
        let recency = self.config.recency;
        let skip_touch = flags.no_touch || self.persist_child_active;
        let stamp = flags.update_mvcc.then(|| self.mvcc.next(now));
        let data = &mut self.dbs[db].data;
        let Some(value) = data.find_mut(key) else {
            return false;
        };
        if !skip_touch {
            match recency {
                RecencyPolicy::Lfu {
                    log_factor,
                    decay_minutes,
                } => value.touch_lfu(now, log_factor, decay_minutes),
                RecencyPolicy::Lru => value.touch_lru(now),
            }
        }
        if let Some(stamp) = stamp {
            value.set_mvcc(stamp);
            data.mark_changed(key);
        }
        true
    }

    /// Lookup for read-only operations. Enforces expiration, updates
    /// recency metadata and the hit/miss counters, and emits `keymiss`
    /// events.
    pub fn lookup_read(&mut self, db: usize, key: &[u8], flags: LookupFlags) -> Option<&Value> {
        if self.expire_if_needed(db, key) {
            // on a primary the key is gone; on a replica the key is
            // logically expired and only the master may read through
            let read_through = self.config.role.is_replica() && flags.master_caller;
            if !read_through {
                self.counters.misses += 1;
                self.hooks
                    .notify_keyspace_event(EventKind::KeyMiss, "keymiss", key, db);
                return None;
            }
        }
        if self.touch_lookup(db, key, flags) {
            self.counters.hits += 1;
            self.dbs[db].data.find(key)
        } else {
            self.counters.misses += 1;
            self.hooks
                .notify_keyspace_event(EventKind::KeyMiss, "keymiss", key, db);
            None
        }
    }

    /// Lookup for writes: always refreshes the MVCC stamp and always
    /// enforces expiration.
    pub fn lookup_write(&mut self, db: usize, key: &[u8]) -> Option<&Value> {
        let found = self.touch_lookup(
            db,
            key,
            LookupFlags {
                update_mvcc: true,
                ..LookupFlags::NONE
            },
        );
        if self.expire_if_needed(db, key) {
            return None;
        }
        if found {
            self.dbs[db].data.find(key)
        } else {
            None
        }
    }

    /// Presence check without recency update.
    pub fn exists(&mut self, db: usize, key: &[u8]) -> bool {
        self.lookup_read(db, key, LookupFlags::NO_TOUCH).is_some()
    }

    // --- writes ---

    /// Inserts a new key. Returns `false` when the key already exists.
    pub fn try_add(&mut self, db: usize, key: &[u8], mut value: Value) -> bool {
        assert!(
            !value.has_expire(),
            "fresh values must not carry the expire flag"
        );
        if self.config.role == Role::ActiveReplica {
            let stamp = self.mvcc.next(self.now_ms());
            value.set_mvcc(stamp);
        }
        let vtype = value.value_type();
        let inserted = self.dbs[db].data.insert(key, value);
        if inserted {
            if vtype.supports_blocking() {
                self.signal_key_ready(db, key);
            }
            if let Some(index) = &mut self.slot_index {
                index.add(&Bytes::copy_from_slice(key));
            }
        }
        inserted
    }

    /// Inserts a new key; the caller guarantees it is absent.
    pub fn add(&mut self, db: usize, key: &[u8], value: Value) {
        let inserted = self.try_add(db, key, value);
        assert!(inserted, "add on an existing key");
    }

    /// Replaces the value of an existing key without touching its
    /// expiration.
    pub fn overwrite(&mut self, db: usize, key: &[u8], value: Value) {
        let update_mvcc = self.config.role == Role::ActiveReplica;
        self.overwrite_core(db, key, value, update_mvcc, false);
    }

    /// Shared overwrite path. Expire handling: either drop the expire
    /// record, or transfer the expire bit onto the incoming value
    /// (upgrading it out of the shared pool first — pooled values
    /// cannot carry per-instance flags). LFU metadata carries over
    /// from the replaced value. The old value is released only after
    /// the new one is installed.
    pub(crate) fn overwrite_core(
        &mut self,
        db: usize,
        key: &[u8],
        mut value: Value,
        update_mvcc: bool,
        clear_expire: bool,
    ) {
        let stamp = update_mvcc.then(|| self.mvcc.next(self.now_ms()));
        let lfu = matches!(self.config.recency, RecencyPolicy::Lfu { .. });
        let data = &mut self.dbs[db].data;
        let old = data.find(key).expect("overwrite of a missing key");
        let old_access = old.access_raw();
        if old.has_expire() {
            if clear_expire {
                let removed = data.remove_expire(key);
                debug_assert!(removed);
            } else {
                value.set_expire_flag(true);
            }
        }
        if lfu {
            value.set_access_raw(old_access);
        }
        if let Some(stamp) = stamp {
            value.set_mvcc(stamp);
        }
        let old = data.update_value(key, value);
        self.dispose_value(old);
    }

    /// Insert-or-merge used by active-active replication. Without
    /// `replace` this behaves as a plain add (present keys win). With
    /// `replace`, last-writer-wins: the incoming value lands only when
    /// its MVCC stamp is at least the stored one's; a losing incoming
    /// value is discarded. An absent key always admits the incoming
    /// value. Returns whether the incoming value was stored.
    pub fn merge(&mut self, db: usize, key: &[u8], value: Value, replace: bool) -> bool {
        if !replace {
            return self.try_add(db, key, value);
        }
        match self.dbs[db].data.find(key).map(Value::mvcc) {
            None => self.try_add(db, key, value),
            Some(existing) if existing <= value.mvcc() => {
                self.overwrite_core(db, key, value, false, true);
                true
            }
            Some(_) => false,
        }
    }

    /// Upsert: add or overwrite, always clearing any expiration, and
    /// signal watchers of the key.
    pub fn set_key(&mut self, db: usize, key: &[u8], value: Value) {
        if self.dbs[db].data.find(key).is_some() {
            let update_mvcc = self.config.role == Role::ActiveReplica;
            self.overwrite_core(db, key, value, update_mvcc, true);
        } else {
            self.add(db, key, value);
        }
        self.signal_modified(db, key);
    }

    /// Prepares a string value for in-place mutation: a shared or
    /// compactly encoded value is replaced by a raw owned copy first.
    pub fn unshare_string(&mut self, db: usize, key: &[u8]) {
        let value = self
            .dbs[db]
            .data
            .find(key)
            .expect("unshare_string on a missing key");
        debug_assert_eq!(value.value_type(), ValueType::String);
        if value.is_shared() || value.encoding() != Encoding::Raw {
            let raw = value.as_str().expect("string payload").clone();
            let update_mvcc = self.config.role == Role::ActiveReplica;
            self.overwrite_core(db, key, Value::string(raw), update_mvcc, false);
        }
    }

    // --- deletes ---

    pub(crate) fn delete_generic(&mut self, db: usize, key: &[u8], lazy: bool) -> bool {
        let Some(value) = self.dbs[db].data.remove(key) else {
            return false;
        };
        if let Some(index) = &mut self.slot_index {
            index.del(key);
        }
        if lazy {
            if let Some(dropper) = &self.dropper {
                dropper.defer_value(value);
            }
        }
        true
    }

    /// Removes a key, freeing the value inline.
    pub fn delete_sync(&mut self, db: usize, key: &[u8]) -> bool {
        self.delete_generic(db, key, false)
    }

    /// Removes a key, deferring the value to the background dropper.
    pub fn delete_async(&mut self, db: usize, key: &[u8]) -> bool {
        self.delete_generic(db, key, true)
    }

    /// Removes a key, sync or async per the configured policy.
    pub fn delete(&mut self, db: usize, key: &[u8]) -> bool {
        self.delete_generic(db, key, self.config.lazy_free_server_del)
    }

    /// Removes a key from the dict and slot index, handing the value
    /// back instead of dropping it.
    fn take_key(&mut self, db: usize, key: &[u8]) -> Option<Value> {
        let value = self.dbs[db].data.remove(key)?;
        if let Some(index) = &mut self.slot_index {
            index.del(key);
        }
        Some(value)
    }

    // --- two-key operations ---

    /// Renames `src` to `dst`, carrying the TTL along. With `nx` the
    /// rename is refused (`Ok(false)`) when `dst` exists. Renaming a
    /// key onto itself succeeds without touching anything.
    pub fn rename(
        &mut self,
        db: usize,
        src: &[u8],
        dst: &[u8],
        nx: bool,
    ) -> Result<bool, KeyspaceError> {
        let same = src == dst;
        if self.lookup_write(db, src).is_none() {
            return Err(KeyspaceError::NoSuchKey);
        }
        if same {
            return Ok(!nx);
        }
        let saved_expire = self.dbs[db].data.expire_record(src).cloned();
        if self.lookup_write(db, dst).is_some() {
            if nx {
                return Ok(false);
            }
            self.delete(db, dst);
        }
        let value = self.take_key(db, src).expect("source present above");
        self.add(db, dst, value);
        if let Some(record) = saved_expire {
            self.dbs[db].data.install_expire_record(dst, record);
        }
        self.signal_modified(db, src);
        self.signal_modified(db, dst);
        self.hooks
            .notify_keyspace_event(EventKind::Generic, "rename_from", src, db);
        self.hooks
            .notify_keyspace_event(EventKind::Generic, "rename_to", dst, db);
        self.counters.dirty += 1;
        Ok(true)
    }

    /// Moves a key between databases. Fails atomically (`Ok(false)`)
    /// when the destination already holds the key. Not allowed in
    /// cluster mode.
    pub fn move_key(
        &mut self,
        src_db: usize,
        dst_db: usize,
        key: &[u8],
    ) -> Result<bool, KeyspaceError> {
        if self.config.cluster_enabled {
            return Err(KeyspaceError::ClusterMode("MOVE"));
        }
        self.check_db(src_db)?;
        self.check_db(dst_db)?;
        if src_db == dst_db {
            return Err(KeyspaceError::SameObject);
        }
        if self.lookup_write(src_db, key).is_none() {
            return Ok(false);
        }
        if self.lookup_write(dst_db, key).is_some() {
            return Ok(false);
        }
        let saved_expire = self.dbs[src_db].data.expire_record(key).cloned();
        let value = self.take_key(src_db, key).expect("source present above");
        self.add(dst_db, key, value);
        if let Some(record) = saved_expire {
            self.dbs[dst_db].data.install_expire_record(key, record);
        }
        self.counters.dirty += 1;
        Ok(true)
    }

    /// Swaps the contents of two databases. Blocking, ready, and
    /// watched key indices stay with their database numbers so
    /// connected clients keep their bindings; afterwards both
    /// databases are rescanned for keys that can satisfy pending
    /// blocking waits.
    pub fn swap_db(&mut self, a: usize, b: usize) -> Result<(), KeyspaceError> {
        if self.config.cluster_enabled {
            return Err(KeyspaceError::ClusterMode("SWAPDB"));
        }
        self.check_db(a)?;
        self.check_db(b)?;
        if a == b {
            return Ok(());
        }
        let (low, high) = (a.min(b), a.max(b));
        let (head, tail) = self.dbs.split_at_mut(high);
        head[low].swap_contents(&mut tail[0]);
        self.counters.dirty += 1;
        self.scan_for_ready_keys(a);
        self.scan_for_ready_keys(b);
        Ok(())
    }

    /// After a swap, keys of blocking-capable types that now exist
    /// under a waited-on name must wake their waiters.
    fn scan_for_ready_keys(&mut self, db: usize) {
        let waited: Vec<Bytes> = self.dbs[db].blocking_keys.keys().cloned().collect();
        for key in waited {
            let ready = self.dbs[db]
                .data
                .find(&key)
                .is_some_and(|v| v.value_type().supports_blocking());
            if ready {
                self.signal_key_ready(db, &key);
            }
        }
    }

    // --- random ---

    /// Picks a random live key, skipping expired ones within a retry
    /// budget. When every key is volatile on a lagging replica, the
    /// budget runs out and a logically expired key is returned rather
    /// than looping forever.
    pub fn random_key(&mut self, db: usize) -> Option<Bytes> {
        let mut tries = 100;
        let all_volatile = {
            let data = &self.dbs[db].data;
            data.size() > 0 && data.expires_size() >= data.size()
        };
        loop {
            let key = self.dbs[db].data.random_key()?;
            let volatile = self.dbs[db]
                .data
                .find(&key)
                .is_some_and(Value::has_expire);
            if volatile {
                if all_volatile && self.config.role.is_replica() {
                    tries -= 1;
                    if tries == 0 {
                        return Some(key);
                    }
                }
                if self.expire_if_needed(db, &key) {
                    continue;
                }
            }
            return Some(key);
        }
    }

    // --- signals ---

    fn signal_modified(&mut self, db: usize, key: &[u8]) {
        if self.dbs[db].watched_keys.contains_key(key) {
            self.hooks.touch_watched_key(db, key);
        }
        self.hooks.tracking_invalidate_key(key);
    }

    pub(crate) fn signal_key_ready(&mut self, db: usize, key: &[u8]) {
        let dbx = &mut self.dbs[db];
        if dbx.blocking_keys.contains_key(key) {
            let owned = Bytes::copy_from_slice(key);
            if !dbx.ready_keys.contains(&owned) {
                dbx.ready_keys.push(owned);
            }
            self.hooks.signal_key_ready(db, key);
        }
    }

    // --- blocking / watching passthroughs ---

    pub fn block_on_key(&mut self, db: usize, key: &[u8], client: ClientId) {
        self.dbs[db].block_on_key(Bytes::copy_from_slice(key), client);
    }

    /// Removes a disconnecting client from every wait list of `db`.
    pub fn unblock_client(&mut self, db: usize, client: ClientId) {
        self.dbs[db].unblock_client(client);
    }

    pub fn watch_key(&mut self, db: usize, key: &[u8], client: ClientId) {
        self.dbs[db].watch_key(Bytes::copy_from_slice(key), client);
    }

    pub fn unwatch_client(&mut self, db: usize, client: ClientId) {
        self.dbs[db].unwatch_client(client);
    }

    /// Keys signalled ready since the last drain.
    pub fn take_ready_keys(&mut self, db: usize) -> Vec<Bytes> {
        std::mem::take(&mut self.dbs[db].ready_keys)
    }

    // --- scans ---

    /// Resumable cursor scan over a database's top-level keys. Not a
    /// snapshot: concurrent writes may cause missed or duplicated
    /// entries, which callers must tolerate.
    pub fn scan_keys(
        &mut self,
        db: usize,
        cursor: u64,
        opts: &ScanOptions,
    ) -> Result<(u64, Vec<Bytes>), KeyspaceError> {
        let count = match opts.count {
            None => 10,
            Some(0) => return Err(KeyspaceError::Syntax),
            Some(n) => n,
        };
        let pattern = compile_pattern(opts.pattern.as_deref());

        let mut gathered = Vec::new();
        let mut cursor = cursor;
        let mut budget = count.saturating_mul(10);
        loop {
            cursor = self.dbs[db].data.live_dict().scan(cursor, &mut |key, _| {
                gathered.push(key.clone());
            });
            if cursor == 0 || gathered.len() >= count {
                break;
            }
            budget -= 1;
            if budget == 0 {
                break;
            }
        }

        let mut keys = Vec::with_capacity(gathered.len());
        for key in gathered {
            if let Some(pattern) = &pattern {
                if !pattern.matches(&key) {
                    continue;
                }
            }
            if let Some(wanted) = opts.type_filter {
                let matches = self.dbs[db]
                    .data
                    .find(&key)
                    .is_some_and(|v| v.value_type() == wanted);
                if !matches {
                    continue;
                }
            }
            if self.expire_if_needed(db, &key) {
                continue;
            }
            keys.push(key);
        }
        Ok((cursor, keys))
    }

    /// Resumable cursor scan over a composite value's elements. Table
    /// encodings iterate with the cursor; compact encodings return
    /// everything at once with cursor 0.
    pub fn scan_value(
        &mut self,
        db: usize,
        key: &[u8],
        cursor: u64,
        opts: &ScanOptions,
    ) -> Result<(u64, ScanItems), KeyspaceError> {
        let count = match opts.count {
            None => 10,
            Some(0) => return Err(KeyspaceError::Syntax),
            Some(n) => n,
        };
        if opts.type_filter.is_some() {
            // TYPE applies to database scans only
            return Err(KeyspaceError::Syntax);
        }
        let pattern = compile_pattern(opts.pattern.as_deref());

        let Some(value) = self.lookup_read(db, key, LookupFlags::NO_TOUCH) else {
            return Ok((0, ScanItems::Members(Vec::new())));
        };

        let keep = |name: &Bytes| pattern.as_ref().map_or(true, |p| p.matches(name));
        match value.payload() {
            Payload::Set(SetRepr::Table(table)) => {
                let (next, members) = scan_table(table, cursor, count, |name, _| name.clone());
                Ok((next, ScanItems::Members(members.into_iter().filter(|m| keep(m)).collect())))
            }
            Payload::Set(SetRepr::Ints(ints)) => {
                let members = ints
                    .iter()
                    .map(|n| Bytes::from(n.to_string()))
                    .filter(|m| keep(m))
                    .collect();
                Ok((0, ScanItems::Members(members)))
            }
            Payload::Hash(HashRepr::Table(table)) => {
                let (next, fields) =
                    scan_table(table, cursor, count, |name, data: &Bytes| (name.clone(), data.clone()));
                Ok((next, ScanItems::Fields(fields.into_iter().filter(|(f, _)| keep(f)).collect())))
            }
            Payload::Hash(HashRepr::Pack(items)) => {
                let fields = items
                    .iter()
                    .filter(|(f, _)| keep(f))
                    .cloned()
                    .collect();
                Ok((0, ScanItems::Fields(fields)))
            }
            Payload::ZSet(ZSetRepr::Table(table)) => {
                let (next, scored) =
                    scan_table(table, cursor, count, |name, score: &f64| (name.clone(), *score));
                Ok((next, ScanItems::Scored(scored.into_iter().filter(|(m, _)| keep(m)).collect())))
            }
            Payload::ZSet(ZSetRepr::Pack(items)) => {
                let scored = items
                    .iter()
                    .filter(|(m, _)| keep(m))
                    .cloned()
                    .collect();
                Ok((0, ScanItems::Scored(scored)))
            }
            _ => Err(KeyspaceError::WrongType),
        }
    }

    /// Synchronous pattern enumeration over the full effective
    /// keyspace (chain included), skipping logically expired keys.
    pub fn keys(&mut self, db: usize, pattern: &str) -> Vec<Bytes> {
        let size = self.dbs[db].data.size();
        if size > 10_000 {
            warn!(keys = size, "full pattern enumeration over a large keyspace; prefer cursor scans");
        }
        let compiled = GlobPattern::new(pattern.as_bytes());
        let now = self.now_ms();
        let loading = self.loading;
        let data = &self.dbs[db].data;
        let mut out = Vec::new();
        data.for_each_visible(&mut |key, _value| {
            if compiled.matches(key) {
                let expired = !loading
                    && data
                        .expire_record_visible(key)
                        .and_then(ExpireRecord::whole_when)
                        .is_some_and(|when| now > when);
                if !expired {
                    out.push(key.clone());
                }
            }
            true
        });
        out
    }

    /// Offloaded pattern enumeration: freezes a snapshot, scans it on
    /// the worker thread, and posts the result back. The caller must
    /// pump [`drain_completions`](Self::drain_completions) from the
    /// event loop; `done` runs there with the matched keys and a flag
    /// saying whether the scan was cancelled. Returns a cancellation
    /// handle.
    pub fn keys_async(
        &mut self,
        db: usize,
        pattern: &str,
        done: Box<dyn FnOnce(Vec<Bytes>, bool) + Send>,
    ) -> ScanCancel {
        let cancel = Arc::new(AtomicBool::new(false));
        let checkpoint = self.mvcc.current();
        let snapshot = self.dbs[db].data.create_snapshot(checkpoint);
        let job = ScanJob {
            db,
            snapshot,
            pattern: GlobPattern::new(pattern.as_bytes()),
            now_ms: self.now_ms(),
            cancel: Arc::clone(&cancel),
            done,
        };
        let workers = self.workers.get_or_insert_with(WorkerPool::spawn);
        if let Err(job) = workers.submit(job) {
            // worker unavailable: run inline and release immediately
            let ScanJob {
                snapshot,
                pattern,
                now_ms,
                done,
                ..
            } = job;
            let (found, cancelled) =
                crate::worker::run_scan(&snapshot, &pattern, now_ms, &cancel);
            self.dbs[db].data.end_snapshot(snapshot);
            done(found, cancelled);
        }
        ScanCancel::new(cancel)
    }

    /// Completes finished offloaded scans: releases their snapshots on
    /// this thread and invokes their continuations. Returns how many
    /// completions were drained.
    pub fn drain_completions(&mut self) -> usize {
        let mut pending = Vec::new();
        if let Some(workers) = &self.workers {
            while let Some(completion) = workers.try_completion() {
                pending.push(completion);
            }
        }
        let drained = pending.len();
        for completion in pending {
            let Completion {
                db,
                snapshot,
                keys,
                cancelled,
                done,
            } = completion;
            assert!(
                self.save_holders == 0,
                "snapshot release while a save holder is active"
            );
            self.dbs[db].data.end_snapshot(snapshot);
            done(keys, cancelled);
        }
        drained
    }

    // --- snapshots ---

    /// Freezes a read-only snapshot of one database.
    pub fn create_snapshot(&mut self, db: usize) -> SnapshotRef {
        let checkpoint = self.mvcc.current();
        SnapshotRef {
            db,
            inner: self.dbs[db].data.create_snapshot(checkpoint),
        }
    }

    /// Releases a snapshot; the last release of the newest layer
    /// merges it back. Forbidden while a save holder is active.
    pub fn release_snapshot(&mut self, snapshot: SnapshotRef) {
        assert!(
            self.save_holders == 0,
            "snapshot release while a save holder is active"
        );
        self.dbs[snapshot.db].data.end_snapshot(snapshot.inner);
    }

    // --- iteration / dump ---

    /// Visits every visible entry of `db` without mutating.
    pub fn for_each(&self, db: usize, f: &mut dyn FnMut(&Bytes, &Value) -> bool) -> bool {
        self.dbs[db].data.for_each_visible(f)
    }

    /// The value and remaining whole-key TTL (ms; -1 without one) for
    /// a live key, for MIGRATE/DUMP-style serialisation.
    pub fn dump(&mut self, db: usize, key: &[u8]) -> Option<(&Value, i64)> {
        if self.expire_if_needed(db, key) {
            return None;
        }
        let now = self.now_ms();
        let ttl_ms = match self
            .dbs[db]
            .data
            .expire_record(key)
            .and_then(ExpireRecord::whole_when)
        {
            Some(when) => when.saturating_sub(now).min(i64::MAX as u64) as i64,
            None => -1,
        };
        let value = self.dbs[db].data.find(key)?;
        Some((value, ttl_ms))
    }

    // --- change tracking ---

    /// Opens a change-tracking scope on `db` (reentrant).
    pub fn begin_tracking(&mut self, db: usize) {
        self.dbs[db].data.begin_tracking();
    }

    /// Closes a tracking scope; at depth zero changed keys are flushed
    /// to the database's storage tier.
    pub fn end_tracking(&mut self, db: usize) {
        let storage: Option<&mut dyn StorageTier> = match &mut self.storage[db] {
            Some(tier) => Some(tier.as_mut()),
            None => None,
        };
        self.dbs[db].data.end_tracking(storage);
    }

    // --- flush ---

    /// Removes every key of one database. With `async_drop` the bulk
    /// of the memory is reclaimed on the dropper thread.
    pub fn clear(&mut self, db: usize, async_drop: bool) -> usize {
        let watched: Vec<Bytes> = self.dbs[db].watched_keys.keys().cloned().collect();
        for key in watched {
            self.hooks.touch_watched_key(db, &key);
        }
        let (removed, dict, expires) = self.dbs[db].data.clear();
        if async_drop {
            if let Some(dropper) = &self.dropper {
                dropper.defer_layer(dict, expires);
            }
        }
        if let Some(index) = &mut self.slot_index {
            index.flush();
        }
        removed
    }

    /// Removes every key of every database.
    pub fn clear_all(&mut self, async_drop: bool) -> usize {
        (0..self.dbs.len()).map(|db| self.clear(db, async_drop)).sum()
    }

    // --- cluster slot index ---

    pub fn count_keys_in_slot(&self, slot: u16) -> u64 {
        self.slot_index.as_ref().map_or(0, |index| index.count(slot))
    }

    pub fn keys_in_slot(&self, slot: u16, count: usize) -> Vec<Bytes> {
        self.slot_index
            .as_ref()
            .map_or_else(Vec::new, |index| index.keys_in_slot(slot, count))
    }

    /// Deletes every key in a hash slot (slot migration). Cluster mode
    /// keeps a single database.
    pub fn delete_keys_in_slot(&mut self, slot: u16) -> usize {
        let keys = self.keys_in_slot(slot, usize::MAX);
        let mut removed = 0;
        for key in keys {
            if self.delete(0, &key) {
                removed += 1;
            }
        }
        removed
    }
}

/// Collects up to `count` entries from a value-level table scan.
fn scan_table<V, T>(
    table: &crate::dict::Dict<V>,
    cursor: u64,
    count: usize,
    mut map: impl FnMut(&Bytes, &V) -> T,
) -> (u64, Vec<T>) {
    let mut items = Vec::new();
    let mut cursor = cursor;
    let mut budget = count.saturating_mul(10);
    loop {
        cursor = table.scan(cursor, &mut |name, value| items.push(map(name, value)));
        if cursor == 0 || items.len() >= count {
            break;
        }
        budget -= 1;
        if budget == 0 {
            break;
        }
    }
    (cursor, items)
}

fn compile_pattern(pattern: Option<&str>) -> Option<GlobPattern> {
    match pattern {
        // a lone `*` matches everything; skip the matcher entirely
        None | Some("*") => None,
        Some(p) => Some(GlobPattern::new(p.as_bytes())),
    }
}

/// Glob-style pattern matching over raw bytes: `*`, `?`, and bracket
/// classes (`[abc]`, negated as `[^abc]` or `[!abc]`).
///
/// Matching simulates the pattern as a tiny NFA: one flag per pattern
/// offset records which offsets are still reachable before the next
/// input byte, and a `*` bleeds into its successor since it also
/// matches the empty string. Cost is bounded by pattern length times
/// text length, with no backtracking blowup on star-heavy patterns.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    pattern: Vec<u8>,
}

impl GlobPattern {
    pub fn new(pattern: &[u8]) -> Self {
        Self {
            pattern: pattern.to_vec(),
        }
    }

    pub fn matches(&self, text: &[u8]) -> bool {
        glob_match(&self.pattern, text)
    }
}

/// Marks `pos` reachable, bleeding through any run of stars (each
/// star also matches zero bytes, so its successor is reachable too).
fn mark_reachable(alive: &mut [bool], pattern: &[u8], mut pos: usize) {
    loop {
        alive[pos] = true;
        match pattern.get(pos) {
            Some(&b'*') => pos += 1,
            _ => return,
        }
    }
}

/// Tests `byte` against the bracket class opening at `pattern[open]`.
/// Returns the offset just past the closing `]` when the class
/// accepts the byte; `None` on rejection or an unterminated class.
fn class_accepts(pattern: &[u8], open: usize, byte: u8) -> Option<usize> {
    let mut pos = open + 1;
    let negated = pattern.get(pos).is_some_and(|&c| c == b'^' || c == b'!');
    if negated {
        pos += 1;
    }
    let mut found = false;
    while let Some(&c) = pattern.get(pos) {
        if c == b']' {
            return (found != negated).then_some(pos + 1);
        }
        found |= c == byte;
        pos += 1;
    }
    None
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    // one slot per pattern offset, plus the accepting end offset
    let mut alive = vec![false; pattern.len() + 1];
    let mut stepped = vec![false; pattern.len() + 1];
    mark_reachable(&mut alive, pattern, 0);

    for &byte in text {
        stepped.iter_mut().for_each(|slot| *slot = false);
        for pos in 0..pattern.len() {
            if !alive[pos] {
                continue;
            }
            match pattern[pos] {
                // consuming a byte leaves the star alive and keeps its
                // successors reachable
                b'*' => mark_reachable(&mut stepped, pattern, pos),
                b'?' => mark_reachable(&mut stepped, pattern, pos + 1),
                b'[' => {
                    if let Some(after) = class_accepts(pattern, pos, byte) {
                        mark_reachable(&mut stepped, pattern, after);
                    }
                }
                literal => {
                    if literal == byte {
                        mark_reachable(&mut stepped, pattern, pos + 1);
                    }
                }
            }
        }
        std::mem::swap(&mut alive, &mut stepped);
        if !alive.contains(&true) {
            return false;
        }
    }
    alive[pattern.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::time::Clock;

    fn engine() -> Keyspace {
        Keyspace::new(EngineConfig {
            clock: Clock::manual(1_000_000),
            ..EngineConfig::default()
        })
    }

    fn sval(s: &str) -> Value {
        Value::string(Bytes::from(s.to_owned()))
    }

    #[test]
    fn add_and_lookup() {
        let mut ks = engine();
        ks.add(0, b"k", sval("v"));
        let value = ks.lookup_read(0, b"k", LookupFlags::NONE).unwrap();
        assert_eq!(value.as_str().unwrap(), &Bytes::from_static(b"v"));
        assert_eq!(ks.counters().hits, 1);
        assert!(ks.lookup_read(0, b"nope", LookupFlags::NONE).is_none());
        assert_eq!(ks.counters().misses, 1);
    }

    #[test]
    #[should_panic(expected = "add on an existing key")]
    fn add_twice_panics() {
        let mut ks = engine();
        ks.add(0, b"k", sval("a"));
        ks.add(0, b"k", sval("b"));
    }

    #[test]
    fn lookup_write_refreshes_mvcc() {
        let mut ks = engine();
        ks.add(0, b"k", sval("v"));
        let before = ks.lookup_read(0, b"k", LookupFlags::NO_TOUCH).unwrap().mvcc();
        let after = ks.lookup_write(0, b"k").unwrap().mvcc();
        assert!(after > before);
        // distinct writes never share a stamp
        let again = ks.lookup_write(0, b"k").unwrap().mvcc();
        assert!(again > after);
    }

    #[test]
    fn set_key_clears_expire() {
        let mut ks = engine();
        let now = ks.now_ms();
        ks.add(0, b"k", sval("v1"));
        ks.set_expire(0, b"k", None, now + 5_000, false);
        assert!(ks.get_expire_ms(0, b"k").is_some());
        ks.set_key(0, b"k", sval("v2"));
        assert!(ks.get_expire_ms(0, b"k").is_none());
        assert!(!ks.lookup_read(0, b"k", LookupFlags::NO_TOUCH).unwrap().has_expire());
    }

    #[test]
    fn overwrite_preserves_expire() {
        let mut ks = engine();
        let now = ks.now_ms();
        ks.add(0, b"k", sval("v1"));
        ks.set_expire(0, b"k", None, now + 5_000, false);
        ks.overwrite(0, b"k", sval("v2"));
        assert_eq!(ks.get_expire_ms(0, b"k"), Some(now + 5_000));
        let value = ks.lookup_read(0, b"k", LookupFlags::NO_TOUCH).unwrap();
        assert!(value.has_expire());
        assert_eq!(value.as_str().unwrap(), &Bytes::from_static(b"v2"));
    }

    #[test]
    fn merge_is_last_writer_wins() {
        let mut ks = engine();
        let mut v10 = sval("old");
        v10.set_mvcc(10);
        ks.add(0, b"k", v10);

        let mut v5 = sval("stale");
        v5.set_mvcc(5);
        assert!(!ks.merge(0, b"k", v5, true));
        assert_eq!(ks.lookup_read(0, b"k", LookupFlags::NO_TOUCH).unwrap().mvcc(), 10);

        let mut v20 = sval("fresh");
        v20.set_mvcc(20);
        assert!(ks.merge(0, b"k", v20, true));
        let value = ks.lookup_read(0, b"k", LookupFlags::NO_TOUCH).unwrap();
        assert_eq!(value.mvcc(), 20);
        assert_eq!(value.as_str().unwrap(), &Bytes::from_static(b"fresh"));
    }

    #[test]
    fn merge_without_replace_ignores_present_key() {
        let mut ks = engine();
        ks.add(0, b"k", sval("kept"));
        let mut incoming = sval("ignored");
        incoming.set_mvcc(u64::MAX);
        assert!(!ks.merge(0, b"k", incoming, false));
        assert_eq!(
            ks.lookup_read(0, b"k", LookupFlags::NO_TOUCH).unwrap().as_str().unwrap(),
            &Bytes::from_static(b"kept")
        );
    }

    #[test]
    fn merge_replace_inserts_when_absent() {
        let mut ks = engine();
        let mut incoming = sval("new");
        incoming.set_mvcc(1);
        assert!(ks.merge(0, b"k", incoming, true));
        assert!(ks.exists(0, b"k"));
    }

    #[test]
    fn unshare_string_makes_raw_owned() {
        let mut ks = engine();
        ks.add(0, b"n", crate::value::shared_int(7).unwrap());
        ks.unshare_string(0, b"n");
        let value = ks.lookup_read(0, b"n", LookupFlags::NO_TOUCH).unwrap();
        assert!(!value.is_shared());
        assert_eq!(value.encoding(), Encoding::Raw);
        assert_eq!(value.as_str().unwrap(), &Bytes::from_static(b"7"));
    }

    #[test]
    fn delete_variants() {
        let mut ks = engine();
        ks.add(0, b"a", sval("1"));
        ks.add(0, b"b", sval("2"));
        assert!(ks.delete_sync(0, b"a"));
        assert!(ks.delete_async(0, b"b"));
        assert!(!ks.delete(0, b"a"));
        assert_eq!(ks.size(0), 0);
    }

    #[test]
    fn scan_keys_covers_everything() {
        let mut ks = engine();
        for i in 0..100 {
            ks.add(0, format!("key:{i}").as_bytes(), sval("v"));
        }
        let mut seen = std::collections::HashSet::new();
        let mut cursor = 0;
        loop {
            let (next, batch) = ks
                .scan_keys(0, cursor, &ScanOptions::default())
                .unwrap();
            seen.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn scan_keys_applies_filters() {
        let mut ks = engine();
        ks.add(0, b"user:1", sval("a"));
        ks.add(0, b"user:2", sval("b"));
        ks.add(0, b"item:1", sval("c"));
        ks.add(0, b"list", Value::list(std::collections::VecDeque::new()));

        let opts = ScanOptions {
            pattern: Some("user:*".into()),
            count: Some(100),
            ..ScanOptions::default()
        };
        let (_, keys) = ks.scan_keys(0, 0, &opts).unwrap();
        assert_eq!(keys.len(), 2);

        let opts = ScanOptions {
            type_filter: Some(ValueType::List),
            count: Some(100),
            ..ScanOptions::default()
        };
        let (_, keys) = ks.scan_keys(0, 0, &opts).unwrap();
        assert_eq!(keys, vec![Bytes::from_static(b"list")]);
    }

    #[test]
    fn scan_rejects_zero_count() {
        let mut ks = engine();
        let opts = ScanOptions {
            count: Some(0),
            ..ScanOptions::default()
        };
        assert_eq!(ks.scan_keys(0, 0, &opts), Err(KeyspaceError::Syntax));
    }

    #[test]
    fn scan_value_on_hash_table() {
        let mut ks = engine();
        let mut table = crate::dict::Dict::new();
        for i in 0..50 {
            table.insert(Bytes::from(format!("f{i}")), Bytes::from(format!("v{i}")));
        }
        ks.add(0, b"h", Value::hash(HashRepr::Table(table)));

        let mut seen = std::collections::HashSet::new();
        let mut cursor = 0;
        loop {
            let (next, items) = ks
                .scan_value(0, b"h", cursor, &ScanOptions::default())
                .unwrap();
            match items {
                ScanItems::Fields(fields) => seen.extend(fields.into_iter().map(|(f, _)| f)),
                other => panic!("expected fields, got {other:?}"),
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 50);
    }

    #[test]
    fn scan_value_compact_returns_all_at_once() {
        let mut ks = engine();
        ks.add(0, b"s", Value::set(SetRepr::Ints(vec![1, 2, 3])));
        let (cursor, items) = ks
            .scan_value(0, b"s", 0, &ScanOptions::default())
            .unwrap();
        assert_eq!(cursor, 0);
        assert_eq!(
            items,
            ScanItems::Members(vec![
                Bytes::from_static(b"1"),
                Bytes::from_static(b"2"),
                Bytes::from_static(b"3"),
            ])
        );

        ks.add(
            0,
            b"z",
            Value::zset(ZSetRepr::Pack(vec![(Bytes::from_static(b"m"), 1.5)])),
        );
        let (cursor, items) = ks.scan_value(0, b"z", 0, &ScanOptions::default()).unwrap();
        assert_eq!(cursor, 0);
        assert_eq!(items, ScanItems::Scored(vec![(Bytes::from_static(b"m"), 1.5)]));
    }

    #[test]
    fn scan_value_wrong_type() {
        let mut ks = engine();
        ks.add(0, b"s", sval("plain"));
        assert_eq!(
            ks.scan_value(0, b"s", 0, &ScanOptions::default()),
            Err(KeyspaceError::WrongType)
        );
    }

    #[test]
    fn keys_matches_patterns() {
        let mut ks = engine();
        ks.add(0, b"user:1", sval("a"));
        ks.add(0, b"user:2", sval("b"));
        ks.add(0, b"item:1", sval("c"));
        let mut keys = ks.keys(0, "user:*");
        keys.sort();
        assert_eq!(keys, vec![Bytes::from_static(b"user:1"), Bytes::from_static(b"user:2")]);
        assert_eq!(ks.keys(0, "*").len(), 3);
    }

    #[test]
    fn keys_async_round_trip() {
        use std::sync::mpsc;
        let mut ks = engine();
        for i in 0..32 {
            ks.add(0, format!("job:{i}").as_bytes(), sval("v"));
        }
        let (tx, rx) = mpsc::channel();
        let _cancel = ks.keys_async(
            0,
            "job:*",
            Box::new(move |keys, cancelled| {
                tx.send((keys, cancelled)).unwrap();
            }),
        );
        // pump completions until the worker posts back
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let (keys, cancelled) = loop {
            ks.drain_completions();
            match rx.try_recv() {
                Ok(result) => break result,
                Err(_) if std::time::Instant::now() < deadline => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(_) => panic!("scan never completed"),
            }
        };
        assert!(!cancelled);
        assert_eq!(keys.len(), 32);
        // the snapshot was released on this thread
        assert_eq!(ks.db_stats(0).snapshot_depth, 0);
        assert_eq!(ks.size(0), 32);
    }

    #[test]
    fn rename_moves_value_and_events() {
        let mut ks = engine();
        ks.add(0, b"x", sval("v"));
        assert_eq!(ks.rename(0, b"x", b"y", false), Ok(true));
        assert!(!ks.exists(0, b"x"));
        assert!(ks.exists(0, b"y"));
        assert_eq!(ks.counters().dirty, 1);
        assert_eq!(
            ks.rename(0, b"missing", b"z", false),
            Err(KeyspaceError::NoSuchKey)
        );
    }

    #[test]
    fn rename_nx_respects_existing_destination() {
        let mut ks = engine();
        ks.add(0, b"a", sval("1"));
        ks.add(0, b"b", sval("2"));
        assert_eq!(ks.rename(0, b"a", b"b", true), Ok(false));
        assert_eq!(
            ks.lookup_read(0, b"b", LookupFlags::NO_TOUCH).unwrap().as_str().unwrap(),
            &Bytes::from_static(b"2")
        );
        // same-key rename reports per nx
        assert_eq!(ks.rename(0, b"a", b"a", false), Ok(true));
        assert_eq!(ks.rename(0, b"a", b"a", true), Ok(false));
    }

    #[test]
    fn move_key_between_dbs() {
        let mut ks = engine();
        let now = ks.now_ms();
        ks.add(0, b"k", sval("v"));
        ks.set_expire(0, b"k", None, now + 60_000, false);
        assert_eq!(ks.move_key(0, 1, b"k"), Ok(true));
        assert!(!ks.exists(0, b"k"));
        assert!(ks.exists(1, b"k"));
        assert_eq!(ks.get_expire_ms(1, b"k"), Some(now + 60_000));

        assert_eq!(ks.move_key(0, 0, b"k"), Err(KeyspaceError::SameObject));
        assert_eq!(ks.move_key(0, 99, b"k"), Err(KeyspaceError::OutOfRange));
        // absent source
        assert_eq!(ks.move_key(0, 1, b"k"), Ok(false));
    }

    #[test]
    fn move_key_fails_atomically_on_occupied_destination() {
        let mut ks = engine();
        ks.add(0, b"k", sval("src"));
        ks.add(1, b"k", sval("dst"));
        assert_eq!(ks.move_key(0, 1, b"k"), Ok(false));
        // nothing moved, nothing lost
        assert_eq!(
            ks.lookup_read(0, b"k", LookupFlags::NO_TOUCH).unwrap().as_str().unwrap(),
            &Bytes::from_static(b"src")
        );
        assert_eq!(
            ks.lookup_read(1, b"k", LookupFlags::NO_TOUCH).unwrap().as_str().unwrap(),
            &Bytes::from_static(b"dst")
        );
    }

    #[test]
    fn clear_empties_database() {
        let mut ks = engine();
        let now = ks.now_ms();
        ks.add(0, b"a", sval("1"));
        ks.add(0, b"b", sval("2"));
        ks.set_expire(0, b"a", None, now + 1_000, false);
        assert_eq!(ks.clear(0, false), 2);
        assert_eq!(ks.size(0), 0);
        assert_eq!(ks.db_stats(0).keys_with_expiry, 0);
    }

    #[test]
    fn cluster_mode_maintains_slot_index() {
        let mut ks = Keyspace::new(EngineConfig {
            cluster_enabled: true,
            db_count: 1,
            clock: Clock::manual(0),
            ..EngineConfig::default()
        });
        ks.add(0, b"{tag}a", sval("1"));
        ks.add(0, b"{tag}b", sval("2"));
        let slot = crate::slots::key_slot(b"{tag}a");
        assert_eq!(ks.count_keys_in_slot(slot), 2);
        assert_eq!(ks.delete_keys_in_slot(slot), 2);
        assert_eq!(ks.count_keys_in_slot(slot), 0);
        assert_eq!(ks.size(0), 0);

        assert_eq!(ks.move_key(0, 0, b"x"), Err(KeyspaceError::ClusterMode("MOVE")));
        assert_eq!(ks.swap_db(0, 0), Err(KeyspaceError::ClusterMode("SWAPDB")));
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match(b"user:*", b"user:123"));
        assert!(glob_match(b"user:*", b"user:"));
        assert!(!glob_match(b"user:*", b"item:1"));
        assert!(glob_match(b"key?", b"key1"));
        assert!(!glob_match(b"key?", b"key"));
        assert!(glob_match(b"key[abc]", b"keyb"));
        assert!(!glob_match(b"key[abc]", b"keyd"));
        assert!(glob_match(b"key[^abc]", b"keyd"));
        assert!(glob_match(b"key[!abc]", b"keyd"));
        assert!(!glob_match(b"key[!abc]", b"keya"));
        assert!(glob_match(b"exact", b"exact"));
        assert!(!glob_match(b"exact", b"exactly"));
        assert!(glob_match(b"*", b"anything"));
        assert!(glob_match(b"a*c*e", b"abcde"));
        assert!(glob_match(b"", b""));
        assert!(!glob_match(b"", b"x"));
        // an unterminated class matches nothing
        assert!(!glob_match(b"a[bc", b"ab"));
        // star runs collapse and still accept the empty remainder
        assert!(glob_match(b"a**", b"a"));
    }

    #[test]
    fn parse_cursor_accepts_integers() {
        assert_eq!(parse_cursor("0"), Ok(0));
        assert_eq!(parse_cursor("1234567"), Ok(1_234_567));
        assert!(parse_cursor("nope").is_err());
        assert!(parse_cursor("-1").is_err());
        assert!(parse_cursor(" 3").is_err());
    }
}
