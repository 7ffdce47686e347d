//! The primary keyspace layer and its copy-on-write snapshot chain.
//!
//! A [`PersistentData`] owns the mutable dict, the expire set, and a
//! singly linked chain of frozen [`Snapshot`] layers (newest first).
//! Creating a snapshot steals the live structures into a new frozen
//! layer and installs fresh empty ones on top, so readers of the
//! snapshot observe the exact keyspace at creation time while writers
//! continue against the new top.
//!
//! Reads that fall through to a parent layer *materialise* the entry
//! into the top layer (values from the shared pool by pointer,
//! everything else by detached copy), so later mutations can never
//! leak into a frozen layer. Deletions under a snapshot leave a
//! tombstone masking the parent's entry. Releasing the last reference
//! to the newest snapshot merges it back into the live layer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ahash::AHashSet;
use bytes::Bytes;
use tracing::warn;

use crate::dict::Dict;
use crate::expire::{ExpireRecord, ExpireSet, SubkeyRemoval};
use crate::hooks::StorageTier;
use crate::value::Value;

/// A frozen keyspace layer. Immutable for its whole lifetime in the
/// chain; mutated only while being merged back, at which point no
/// reader can hold it.
#[derive(Debug)]
pub struct Snapshot {
    dict: Dict<Value>,
    expires: ExpireSet,
    /// Keys deleted at this layer that are still visible deeper down.
    tombstones: AHashSet<Bytes>,
    /// Keys present in this layer's dict that also exist deeper down
    /// (they were materialised from a parent). Pure size bookkeeping.
    shadowed: AHashSet<Bytes>,
    parent: Option<Arc<Snapshot>>,
    mvcc_checkpoint: u64,
    /// Outstanding reader handles, plus one per child layer created on
    /// top of this one.
    refs: AtomicU32,
}

impl Snapshot {
    pub fn mvcc_checkpoint(&self) -> u64 {
        self.mvcc_checkpoint
    }

    /// Effective number of visible keys at this layer.
    pub fn size(&self) -> usize {
        let parent = self.parent.as_ref().map_or(0, |p| p.size());
        self.dict.len() + parent - self.tombstones.len() - self.shadowed.len()
    }

    /// Whether `key` is visible in this layer's view.
    pub fn contains_visible(&self, key: &[u8]) -> bool {
        if self.dict.contains(key) {
            return true;
        }
        if self.tombstones.contains(key) {
            return false;
        }
        self.parent
            .as_ref()
            .is_some_and(|p| p.contains_visible(key))
    }

    /// Entry lookup through the chain, never mutating.
    pub fn get_visible(&self, key: &[u8]) -> Option<(&Bytes, &Value)> {
        if let Some(found) = self.dict.get_key_value(key) {
            return Some(found);
        }
        if self.tombstones.contains(key) {
            return None;
        }
        self.parent.as_ref()?.get_visible(key)
    }

    /// The expire record governing `key` in this layer's view, taken
    /// from the layer whose dict holds the visible entry.
    pub fn expire_of(&self, key: &[u8]) -> Option<&ExpireRecord> {
        if self.dict.contains(key) {
            return self.expires.find(key);
        }
        if self.tombstones.contains(key) {
            return None;
        }
        self.parent.as_ref()?.expire_of(key)
    }

    /// Visits every visible entry. Stops early when `f` returns false;
    /// returns whether the walk ran to completion.
    pub fn for_each_visible(&self, f: &mut dyn FnMut(&Bytes, &Value) -> bool) -> bool {
        for (key, value) in self.dict.iter() {
            if !f(key, value) {
                return false;
            }
        }
        if let Some(parent) = &self.parent {
            return parent.for_each_visible(&mut |key, value| {
                if self.dict.contains(key) || self.tombstones.contains(key.as_ref()) {
                    return true;
                }
                f(key, value)
            });
        }
        true
    }

    /// Approximately uniform random visible key: a weighted coin
    /// decides between this layer and the parent's share of the
    /// effective keyspace.
    fn random_visible(&self) -> Option<Bytes> {
        use rand::Rng;
        if self.size() == 0 {
            return None;
        }
        if let Some(parent) = &self.parent {
            let parent_size = parent.size();
            if parent_size > 0 {
                let total = (self.dict.len() + parent_size) as f64;
                if rand::rng().random::<f64>() <= parent_size as f64 / total {
                    if let Some(key) = parent.random_visible() {
                        if !self.dict.contains(&key) && !self.tombstones.contains(key.as_ref()) {
                            return Some(key);
                        }
                        // masked at this layer; fall through to our dict
                    }
                }
            }
        }
        self.dict.random().map(|(key, _)| key.clone())
    }
}

/// The mutable keyspace of one database: live dict + expire set +
/// snapshot chain + tombstones + change tracking.
#[derive(Debug, Default)]
pub struct PersistentData {
    dict: Dict<Value>,
    expires: ExpireSet,
    tombstones: AHashSet<Bytes>,
    shadowed: AHashSet<Bytes>,
    snapshot: Option<Arc<Snapshot>>,
    tracking_depth: u32,
    all_changed: bool,
    changed: AHashSet<Bytes>,
}

impl PersistentData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective number of visible keys, exact across the chain.
    pub fn size(&self) -> usize {
        let parent = self.snapshot.as_ref().map_or(0, |s| s.size());
        self.dict.len() + parent - self.tombstones.len() - self.shadowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Expire records held by the live layer alone.
    pub fn live_expire_size(&self) -> usize {
        self.expires.size()
    }

    /// Expire records across the chain. Approximate: a record
    /// materialised into the live layer still counts in its frozen
    /// layer too.
    pub fn expires_size(&self) -> usize {
        let mut total = self.expires.size();
        let mut layer = self.snapshot.as_deref();
        while let Some(s) = layer {
            total += s.expires.size();
            layer = s.parent.as_deref();
        }
        total
    }

    /// Number of frozen layers in the chain.
    pub fn snapshot_depth(&self) -> usize {
        let mut depth = 0;
        let mut layer = self.snapshot.as_deref();
        while let Some(s) = layer {
            depth += 1;
            layer = s.parent.as_deref();
        }
        depth
    }

    pub fn contains_visible(&self, key: &[u8]) -> bool {
        if self.dict.contains(key) {
            return true;
        }
        if self.tombstones.contains(key) {
            return false;
        }
        self.snapshot
            .as_ref()
            .is_some_and(|s| s.contains_visible(key))
    }

    /// Read-only lookup through the chain; may return an entry that
    /// still lives in a frozen layer.
    pub fn get_visible(&self, key: &[u8]) -> Option<&Value> {
        if let Some(value) = self.dict.get(key) {
            return Some(value);
        }
        if self.tombstones.contains(key) {
            return None;
        }
        self.snapshot
            .as_ref()
            .and_then(|s| s.get_visible(key))
            .map(|(_, value)| value)
    }

    /// Pulls `key` into the live layer if it is only visible through
    /// the snapshot chain. Shared-pool values are shared by pointer;
    /// owned values are copied detached (MVCC stamp preserved), so a
    /// later mutation at the top can never reach the frozen layer. The
    /// governing expire record is copied along with the entry.
    fn ensure(&mut self, key: &[u8]) {
        if self.dict.contains(key) || self.tombstones.contains(key) {
            return;
        }
        let Some(snapshot) = &self.snapshot else {
            return;
        };
        let Some((stored_key, value)) = snapshot.get_visible(key) else {
            return;
        };
        let stored_key = stored_key.clone();
        let copy = value.clone();
        let record = if copy.has_expire() {
            let record = snapshot.expire_of(key).cloned();
            debug_assert!(record.is_some(), "expire flag without a chain record");
            record
        } else {
            None
        };
        self.dict.insert(stored_key.clone(), copy);
        if let Some(record) = record {
            self.expires.insert(record);
        }
        self.shadowed.insert(stored_key);
    }

    /// Live-layer lookup, materialising from the chain if needed.
    pub fn find(&mut self, key: &[u8]) -> Option<&Value> {
        self.ensure(key);
        self.dict.get(key)
    }

    pub fn find_mut(&mut self, key: &[u8]) -> Option<&mut Value> {
        self.ensure(key);
        self.dict.get_mut(key)
    }

    /// Inserts a new key. Returns `false` if the key is already
    /// visible (in the live layer or through the chain).
    pub fn insert(&mut self, key: &[u8], value: Value) -> bool {
        self.ensure(key);
        if self.dict.contains(key) {
            return false;
        }
        let owned = Bytes::copy_from_slice(key);
        let inserted = self.dict.insert(owned.clone(), value);
        debug_assert!(inserted);
        self.track(key);
        true
    }

    /// Replaces the value of an existing key, returning the old value.
    pub fn update_value(&mut self, key: &[u8], value: Value) -> Value {
        self.ensure(key);
        let slot = self
            .dict
            .get_mut(key)
            .expect("update_value on a missing key");
        let old = std::mem::replace(slot, value);
        self.track(key);
        old
    }

    /// Removes a key from the live view, recording a tombstone when a
    /// parent layer still holds it. Returns the removed value.
    pub fn remove(&mut self, key: &[u8]) -> Option<Value> {
        self.ensure(key);
        self.track(key);
        let (stored_key, mut value) = self.dict.remove(key)?;
        if value.has_expire() {
            let erased = self.expires.erase(key);
            debug_assert!(erased.is_some(), "expire flag without a live record");
            // the record is gone; the detached value must not claim one
            value.set_expire_flag(false);
        }
        self.shadowed.remove(key);
        if self
            .snapshot
            .as_ref()
            .is_some_and(|s| s.contains_visible(key))
        {
            self.tombstones.insert(stored_key);
        }
        Some(value)
    }

    /// Approximately uniform random visible key, weighted across the
    /// live layer and the chain. The picked key is materialised.
    pub fn random_key(&mut self) -> Option<Bytes> {
        use rand::Rng;
        if self.size() == 0 {
            return None;
        }
        if let Some(snapshot) = self.snapshot.clone() {
            let snap_size = snapshot.size();
            if snap_size > 0 {
                let total = (self.dict.len() + snap_size) as f64;
                if rand::rng().random::<f64>() <= snap_size as f64 / total {
                    if let Some(key) = snapshot.random_visible() {
                        if !self.tombstones.contains(key.as_ref()) {
                            self.ensure(&key);
                            if self.dict.contains(&key) {
                                return Some(key);
                            }
                        }
                    }
                }
            }
        }
        self.dict.random().map(|(key, _)| key.clone())
    }

    /// Visits every visible entry without mutating. Stops early when
    /// `f` returns false.
    pub fn for_each_visible(&self, f: &mut dyn FnMut(&Bytes, &Value) -> bool) -> bool {
        for (key, value) in self.dict.iter() {
            if !f(key, value) {
                return false;
            }
        }
        if let Some(snapshot) = &self.snapshot {
            return snapshot.for_each_visible(&mut |key, value| {
                if self.dict.contains(key) || self.tombstones.contains(key.as_ref()) {
                    return true;
                }
                f(key, value)
            });
        }
        true
    }

    /// The live dict, for cursor scans. Entries still resident only in
    /// a frozen layer are not visible to a scan until materialised;
    /// SCAN's contract tolerates that.
    pub fn live_dict(&self) -> &Dict<Value> {
        &self.dict
    }

    pub fn resize_if_needed(&mut self) {
        self.dict.resize_if_needed();
    }

    // --- expires ---

    /// The expire record for `key`, materialising the entry first.
    pub fn expire_record(&mut self, key: &[u8]) -> Option<&ExpireRecord> {
        self.ensure(key);
        let value = self.dict.get(key)?;
        if !value.has_expire() {
            return None;
        }
        let record = self.expires.find(key);
        debug_assert!(record.is_some(), "expire flag without a live record");
        record
    }

    /// Read-only expire lookup through the chain.
    pub fn expire_record_visible(&self, key: &[u8]) -> Option<&ExpireRecord> {
        if self.dict.contains(key) {
            return self.expires.find(key);
        }
        if self.tombstones.contains(key) {
            return None;
        }
        self.snapshot.as_ref()?.expire_of(key)
    }

    /// Sets (or updates) an expire entry on an existing key. The
    /// record reuses the dict's key storage; a shared value is
    /// upgraded to an owned one since the pool cannot carry flags.
    pub fn set_expire(&mut self, key: &[u8], subkey: Option<Bytes>, when_ms: u64) {
        self.ensure(key);
        let stored_key = self
            .dict
            .get_key_value(key)
            .map(|(stored, _)| stored.clone())
            .expect("set_expire on a missing key");
        let value = self.dict.get_mut(key).expect("present above");
        value.set_expire_flag(true);
        self.expires.update(stored_key, subkey, when_ms);
        self.track(key);
    }

    /// Reinstalls a saved record under (possibly) another key name.
    /// Used by rename/move to carry a TTL across.
    pub fn install_expire_record(&mut self, key: &[u8], mut record: ExpireRecord) {
        self.ensure(key);
        let stored_key = self
            .dict
            .get_key_value(key)
            .map(|(stored, _)| stored.clone())
            .expect("expire record for a missing key");
        let value = self.dict.get_mut(key).expect("present above");
        value.set_expire_flag(true);
        record.set_key(stored_key);
        self.expires.insert(record);
        self.track(key);
    }

    /// Drops the whole-record expire of `key`. Returns `true` if the
    /// key had one.
    pub fn remove_expire(&mut self, key: &[u8]) -> bool {
        self.ensure(key);
        let value = self
            .dict
            .get_mut(key)
            .expect("remove_expire on a missing key");
        if !value.has_expire() {
            return false;
        }
        value.set_expire_flag(false);
        let erased = self.expires.erase(key);
        assert!(erased.is_some(), "expire flag without a live record");
        self.track(key);
        true
    }

    /// Drops one sub-key expire entry; clears the value's flag only
    /// when the record empties out. Returns `true` if the sub-entry
    /// existed.
    pub fn remove_subkey_expire(&mut self, key: &[u8], subkey: &[u8]) -> bool {
        self.ensure(key);
        let value = self
            .dict
            .get(key)
            .expect("remove_subkey_expire on a missing key");
        if !value.has_expire() {
            return false;
        }
        match self.expires.erase_subkey(key, subkey) {
            SubkeyRemoval::RemovedRecord => {
                self.dict
                    .get_mut(key)
                    .expect("present above")
                    .set_expire_flag(false);
                self.track(key);
                true
            }
            SubkeyRemoval::Removed => {
                self.track(key);
                true
            }
            SubkeyRemoval::NotFat | SubkeyRemoval::NotFound => false,
        }
    }

    pub fn expires(&self) -> &ExpireSet {
        &self.expires
    }

    // --- change tracking ---

    fn track(&mut self, key: &[u8]) {
        if self.tracking_depth > 0 && !self.all_changed {
            self.changed.insert(Bytes::copy_from_slice(key));
        }
    }

    /// Records a key as changed without going through a write path
    /// (e.g. an MVCC-stamping lookup).
    pub(crate) fn mark_changed(&mut self, key: &[u8]) {
        self.track(key);
    }

    /// Opens a (reentrant) change-tracking scope.
    pub fn begin_tracking(&mut self) {
        self.tracking_depth += 1;
    }

    /// Closes a tracking scope; at depth zero the accumulated change
    /// set is flushed to the storage tier.
    pub fn end_tracking(&mut self, storage: Option<&mut dyn StorageTier>) {
        assert!(self.tracking_depth > 0, "end_tracking without begin");
        self.tracking_depth -= 1;
        if self.tracking_depth != 0 {
            return;
        }
        if let Some(storage) = storage {
            if self.all_changed {
                storage.clear();
                self.for_each_visible(&mut |key, value| {
                    storage.insert(key, value);
                    true
                });
            } else {
                for key in &self.changed {
                    match self.get_visible(key) {
                        Some(value) => storage.insert(key, value),
                        None => storage.erase(key),
                    }
                }
            }
        }
        self.all_changed = false;
        self.changed.clear();
    }

    // --- snapshots ---

    /// Freezes the current keyspace into a new snapshot layer (or
    /// reuses the head when its checkpoint already covers
    /// `mvcc_checkpoint`). The returned handle must be released with
    /// [`end_snapshot`](Self::end_snapshot).
    pub fn create_snapshot(&mut self, mvcc_checkpoint: u64) -> Arc<Snapshot> {
        if let Some(head) = &self.snapshot {
            if mvcc_checkpoint <= head.mvcc_checkpoint {
                head.refs.fetch_add(1, Ordering::AcqRel);
                return Arc::clone(head);
            }
            warn!("nested snapshot created");
        }
        let frozen = Snapshot {
            dict: std::mem::take(&mut self.dict),
            expires: std::mem::take(&mut self.expires),
            tombstones: std::mem::take(&mut self.tombstones),
            shadowed: std::mem::take(&mut self.shadowed),
            parent: self.snapshot.take(),
            mvcc_checkpoint,
            refs: AtomicU32::new(1),
        };
        // readers of the new head see every deeper layer too: take a
        // reference on each so none can be merged away underneath them
        let mut layer = frozen.parent.clone();
        while let Some(s) = layer {
            s.refs.fetch_add(1, Ordering::AcqRel);
            layer = s.parent.clone();
        }
        let head = Arc::new(frozen);
        self.snapshot = Some(Arc::clone(&head));
        head
    }

    /// Releases a snapshot handle. When the newest layer's count drops
    /// to zero it is merged back into the live layer, cascading down
    /// the chain while deeper layers also reach zero.
    ///
    /// Precondition: the caller holds the engine lock and no
    /// background save holder is active.
    pub fn end_snapshot(&mut self, handle: Arc<Snapshot>) {
        let mut layer = self.snapshot.clone();
        let mut found = false;
        while let Some(s) = layer {
            if Arc::ptr_eq(&s, &handle) {
                let prev = s.refs.fetch_sub(1, Ordering::AcqRel);
                assert!(prev > 0, "snapshot refcount underflow");
                found = true;
                break;
            }
            layer = s.parent.clone();
        }
        drop(handle);
        if !found {
            // the chain was cleared while the reader was out; the Arc
            // drop above is the release
            return;
        }
        self.collapse();
    }

    /// Merges every leading zero-reference layer back into the live
    /// keyspace.
    fn collapse(&mut self) {
        loop {
            let Some(head) = self.snapshot.as_ref() else {
                return;
            };
            if head.refs.load(Ordering::Acquire) != 0 {
                return;
            }
            let head = self.snapshot.take().expect("checked above");
            // drop the references this layer took on its ancestors at
            // creation time
            let mut layer = head.parent.clone();
            while let Some(s) = layer {
                let prev = s.refs.fetch_sub(1, Ordering::AcqRel);
                debug_assert!(prev > 0, "snapshot refcount underflow");
                layer = s.parent.clone();
            }
            let frozen = Arc::try_unwrap(head)
                .expect("zero-reference snapshot still has an outstanding handle");
            self.merge_layer(frozen);
        }
    }

    /// Folds a frozen layer back into the live keyspace: tombstones
    /// erase the frozen entries they mask, live entries overwrite or
    /// join the frozen dict, expire sets are reconciled, and the
    /// merged structures become the live ones.
    fn merge_layer(&mut self, mut frozen: Snapshot) {
        // stage 1: apply this layer's tombstones to the frozen dict
        for key in std::mem::take(&mut self.tombstones) {
            if let Some((_, old)) = frozen.dict.remove(&key) {
                if old.has_expire() {
                    frozen.expires.erase(&key);
                }
                frozen.shadowed.remove(key.as_ref());
            }
            // keep masking any copy that is still visible deeper down
            let deeper = frozen
                .parent
                .as_ref()
                .is_some_and(|p| !frozen.tombstones.contains(key.as_ref()) && p.contains_visible(&key));
            if deeper {
                frozen.tombstones.insert(key);
            }
        }
        // stage 2: move live entries into the frozen dict
        let live_shadowed = std::mem::take(&mut self.shadowed);
        for (key, value) in std::mem::take(&mut self.dict) {
            match frozen.dict.insert_or_replace(key.clone(), value) {
                Some(old) => {
                    if old.has_expire() {
                        frozen.expires.erase(&key);
                    }
                }
                None => {
                    if live_shadowed.contains(key.as_ref()) {
                        frozen.shadowed.insert(key);
                    }
                }
            }
        }
        let records: Vec<_> = self.expires.drain().collect();
        for record in records {
            frozen.expires.insert(record);
        }
        // stage 3: the merged structures become the live layer
        self.dict = frozen.dict;
        self.expires = frozen.expires;
        self.tombstones = frozen.tombstones;
        self.shadowed = frozen.shadowed;
        self.snapshot = frozen.parent;
    }

    /// Drops every key. Returns the removed structures so the caller
    /// can hand them to the background dropper, along with the number
    /// of keys that were visible. Outstanding snapshot readers keep
    /// their frozen layers alive independently.
    pub fn clear(&mut self) -> (usize, Dict<Value>, ExpireSet) {
        let removed = self.size();
        let dict = std::mem::take(&mut self.dict);
        let expires = std::mem::take(&mut self.expires);
        self.tombstones.clear();
        self.shadowed.clear();
        self.snapshot = None;
        if self.tracking_depth > 0 {
            self.all_changed = true;
        }
        self.changed.clear();
        (removed, dict, expires)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::from(s.to_owned())
    }

    fn string_value(s: &str, mvcc: u64) -> Value {
        let mut v = Value::string(Bytes::from(s.to_owned()));
        v.set_mvcc(mvcc);
        v
    }

    #[test]
    fn insert_find_remove() {
        let mut data = PersistentData::new();
        assert!(data.insert(b"k", string_value("v", 1)));
        assert!(!data.insert(b"k", string_value("w", 2)));
        assert_eq!(data.find(b"k").unwrap().mvcc(), 1);
        assert_eq!(data.size(), 1);
        assert!(data.remove(b"k").is_some());
        assert!(data.remove(b"k").is_none());
        assert_eq!(data.size(), 0);
    }

    #[test]
    fn snapshot_isolates_overwrites() {
        let mut data = PersistentData::new();
        data.insert(b"a", string_value("v1", 1));
        let snap = data.create_snapshot(10);

        // the live layer starts empty but still sees the key
        assert_eq!(data.size(), 1);
        let old = data.update_value(b"a", string_value("v2", 2));
        assert_eq!(old.mvcc(), 1);

        // the snapshot still reads the original
        assert_eq!(snap.get_visible(b"a").unwrap().1.mvcc(), 1);
        assert_eq!(data.find(b"a").unwrap().mvcc(), 2);
        assert_eq!(data.size(), 1);

        data.end_snapshot(snap);
        assert_eq!(data.snapshot_depth(), 0);
        assert_eq!(data.find(b"a").unwrap().mvcc(), 2);
        assert_eq!(data.size(), 1);
    }

    #[test]
    fn tombstone_masks_deleted_key() {
        let mut data = PersistentData::new();
        data.insert(b"a", string_value("v", 1));
        let snap = data.create_snapshot(10);

        assert!(data.remove(b"a").is_some());
        assert!(data.find(b"a").is_none());
        assert_eq!(data.size(), 0);
        // the snapshot still sees it
        assert!(snap.contains_visible(b"a"));
        assert_eq!(snap.size(), 1);

        data.end_snapshot(snap);
        assert!(data.find(b"a").is_none());
        assert_eq!(data.size(), 0);
        assert_eq!(data.snapshot_depth(), 0);
    }

    #[test]
    fn materialised_key_counts_once() {
        let mut data = PersistentData::new();
        data.insert(b"a", string_value("v", 1));
        data.insert(b"b", string_value("w", 2));
        let snap = data.create_snapshot(10);

        // reading materialises into the live layer without duplicating
        // the logical key
        assert!(data.find(b"a").is_some());
        assert_eq!(data.size(), 2);

        data.end_snapshot(snap);
        assert_eq!(data.size(), 2);
        assert_eq!(data.find(b"a").unwrap().mvcc(), 1);
        assert_eq!(data.find(b"b").unwrap().mvcc(), 2);
    }

    #[test]
    fn snapshot_head_is_reused_for_covered_checkpoints() {
        let mut data = PersistentData::new();
        data.insert(b"a", string_value("v", 1));
        let first = data.create_snapshot(100);
        let second = data.create_snapshot(50);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(data.snapshot_depth(), 1);
        data.end_snapshot(second);
        // one reference remains; nothing merged yet
        assert_eq!(data.snapshot_depth(), 1);
        data.end_snapshot(first);
        assert_eq!(data.snapshot_depth(), 0);
    }

    #[test]
    fn nested_snapshots_merge_in_order() {
        let mut data = PersistentData::new();
        data.insert(b"a", string_value("v1", 1));
        let deep = data.create_snapshot(10);
        data.update_value(b"a", string_value("v2", 20));
        data.insert(b"b", string_value("w", 21));
        let shallow = data.create_snapshot(30);
        data.update_value(b"a", string_value("v3", 40));

        assert_eq!(data.snapshot_depth(), 2);
        assert_eq!(deep.get_visible(b"a").unwrap().1.mvcc(), 1);
        assert!(deep.get_visible(b"b").is_none());
        assert_eq!(shallow.get_visible(b"a").unwrap().1.mvcc(), 20);
        assert_eq!(shallow.get_visible(b"b").unwrap().1.mvcc(), 21);
        assert_eq!(data.find(b"a").unwrap().mvcc(), 40);

        // releasing the shallow layer merges it, but the deep layer
        // still has a reader and must survive
        data.end_snapshot(shallow);
        assert_eq!(data.snapshot_depth(), 1);
        assert_eq!(data.find(b"a").unwrap().mvcc(), 40);
        assert_eq!(data.find(b"b").unwrap().mvcc(), 21);
        assert_eq!(data.size(), 2);
        assert_eq!(deep.get_visible(b"a").unwrap().1.mvcc(), 1);
        data.end_snapshot(deep);
        assert_eq!(data.snapshot_depth(), 0);
        assert_eq!(data.size(), 2);
    }

    #[test]
    fn deep_release_waits_for_shallow() {
        let mut data = PersistentData::new();
        data.insert(b"a", string_value("v1", 1));
        let deep = data.create_snapshot(10);
        data.insert(b"b", string_value("w", 20));
        let shallow = data.create_snapshot(30);

        // deep still has the shallow layer's creation-time reference
        data.end_snapshot(deep);
        assert_eq!(data.snapshot_depth(), 2);

        data.end_snapshot(shallow);
        assert_eq!(data.snapshot_depth(), 0);
        assert_eq!(data.size(), 2);
    }

    #[test]
    fn delete_then_reinsert_under_snapshot() {
        let mut data = PersistentData::new();
        data.insert(b"a", string_value("v1", 1));
        let snap = data.create_snapshot(10);
        data.remove(b"a");
        assert!(data.insert(b"a", string_value("v2", 2)));
        assert_eq!(data.size(), 1);
        assert_eq!(snap.get_visible(b"a").unwrap().1.mvcc(), 1);
        data.end_snapshot(snap);
        assert_eq!(data.find(b"a").unwrap().mvcc(), 2);
        assert_eq!(data.size(), 1);
    }

    #[test]
    fn merge_reconciles_expires() {
        let mut data = PersistentData::new();
        data.insert(b"keep", string_value("a", 1));
        data.insert(b"gone", string_value("b", 2));
        data.set_expire(b"keep", None, 1_000);
        data.set_expire(b"gone", None, 2_000);
        let snap = data.create_snapshot(10);

        // delete one expiring key, overwrite the other's record
        data.remove(b"gone");
        data.set_expire(b"keep", None, 5_000);

        data.end_snapshot(snap);
        assert_eq!(data.live_expire_size(), 1);
        let record = data.expire_record(b"keep").unwrap();
        assert_eq!(record.whole_when(), Some(5_000));
        assert!(data.find(b"gone").is_none());
    }

    #[test]
    fn expire_flag_consistency_across_materialise() {
        let mut data = PersistentData::new();
        data.insert(b"k", string_value("v", 1));
        data.set_expire(b"k", None, 9_000);
        let snap = data.create_snapshot(10);

        // materialise via find: record must follow the entry
        let value_expires = data.find(b"k").unwrap().has_expire();
        assert!(value_expires);
        assert!(data.expires().contains(b"k"));
        data.end_snapshot(snap);
        assert!(data.expires().contains(b"k"));
    }

    #[test]
    fn remove_expire_round_trip() {
        let mut data = PersistentData::new();
        data.insert(b"k", string_value("v", 1));
        let before = data.live_expire_size();
        data.set_expire(b"k", None, 9_000);
        assert!(data.find(b"k").unwrap().has_expire());
        assert!(data.remove_expire(b"k"));
        assert!(!data.remove_expire(b"k"));
        assert!(!data.find(b"k").unwrap().has_expire());
        assert_eq!(data.live_expire_size(), before);
    }

    #[test]
    fn subkey_expire_flag_clears_only_when_empty() {
        let mut data = PersistentData::new();
        data.insert(b"h", string_value("v", 1));
        data.set_expire(b"h", Some(b("f1")), 1_000);
        data.set_expire(b"h", Some(b("f2")), 2_000);
        assert!(data.remove_subkey_expire(b"h", b"f1"));
        assert!(data.find(b"h").unwrap().has_expire());
        assert!(data.remove_subkey_expire(b"h", b"f2"));
        assert!(!data.find(b"h").unwrap().has_expire());
        assert!(!data.remove_subkey_expire(b"h", b"f2"));
    }

    #[test]
    fn shared_value_upgraded_on_expire() {
        let mut data = PersistentData::new();
        data.insert(b"n", crate::value::shared_int(5).unwrap());
        assert!(data.find(b"n").unwrap().is_shared());
        data.set_expire(b"n", None, 1_000);
        let value = data.find(b"n").unwrap();
        assert!(!value.is_shared());
        assert!(value.has_expire());
    }

    #[test]
    fn random_key_spans_layers() {
        let mut data = PersistentData::new();
        for i in 0..8 {
            data.insert(format!("old:{i}").as_bytes(), string_value("v", i));
        }
        let snap = data.create_snapshot(10);
        for i in 0..8 {
            data.insert(format!("new:{i}").as_bytes(), string_value("v", 100 + i));
        }
        let mut saw_old = false;
        let mut saw_new = false;
        for _ in 0..200 {
            let key = data.random_key().expect("non-empty");
            assert!(data.contains_visible(&key));
            if key.starts_with(b"old:") {
                saw_old = true;
            } else {
                saw_new = true;
            }
            if saw_old && saw_new {
                break;
            }
        }
        assert!(saw_old && saw_new, "both layers should be sampled");
        data.end_snapshot(snap);
        assert_eq!(data.size(), 16);
    }

    #[test]
    fn for_each_visible_masks_correctly() {
        let mut data = PersistentData::new();
        data.insert(b"a", string_value("v1", 1));
        data.insert(b"b", string_value("v1", 2));
        let snap = data.create_snapshot(10);
        data.remove(b"a");
        data.update_value(b"b", string_value("v2", 3));
        data.insert(b"c", string_value("v1", 4));

        let mut seen = Vec::new();
        data.for_each_visible(&mut |key, value| {
            seen.push((key.clone(), value.mvcc()));
            true
        });
        seen.sort();
        assert_eq!(seen, vec![(b("b"), 3), (b("c"), 4)]);
        data.end_snapshot(snap);
    }

    #[test]
    fn change_tracking_flushes_at_depth_zero() {
        #[derive(Default)]
        struct Recorder {
            inserted: Vec<Bytes>,
            erased: Vec<Bytes>,
            cleared: bool,
        }
        impl StorageTier for Recorder {
            fn insert(&mut self, key: &[u8], _value: &Value) {
                self.inserted.push(Bytes::copy_from_slice(key));
            }
            fn erase(&mut self, key: &[u8]) {
                self.erased.push(Bytes::copy_from_slice(key));
            }
            fn clear(&mut self) {
                self.cleared = true;
            }
            fn retrieve(&self, _key: &[u8]) -> Option<Value> {
                None
            }
        }

        let mut data = PersistentData::new();
        let mut storage = Recorder::default();
        data.begin_tracking();
        data.begin_tracking();
        data.insert(b"a", string_value("v", 1));
        data.end_tracking(Some(&mut storage));
        assert!(storage.inserted.is_empty(), "flush only at depth zero");
        data.insert(b"b", string_value("v", 2));
        data.remove(b"b");
        data.end_tracking(Some(&mut storage));
        assert!(storage.inserted.contains(&b("a")));
        assert!(storage.erased.contains(&b("b")));
        assert!(!storage.cleared);
    }

    #[test]
    fn clear_resets_everything() {
        let mut data = PersistentData::new();
        data.insert(b"a", string_value("v", 1));
        data.set_expire(b"a", None, 1_000);
        let snap = data.create_snapshot(10);
        data.insert(b"b", string_value("w", 2));

        let (removed, dict, expires) = data.clear();
        assert_eq!(removed, 2);
        assert_eq!(dict.len(), 1);
        assert_eq!(expires.size(), 0);
        assert_eq!(data.size(), 0);
        assert_eq!(data.snapshot_depth(), 0);
        // the reader's view is unaffected until it releases
        assert!(snap.contains_visible(b"a"));
        data.end_snapshot(snap);
        assert_eq!(data.size(), 0);
    }
}
