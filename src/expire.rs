//! Expiration records, ordered by earliest deadline.
//!
//! Each record associates a key with either a whole-key deadline or a
//! "fat" entry carrying an optional whole-key deadline plus per-subkey
//! deadlines (field-level TTLs on composite values). A secondary index
//! ordered by the record's earliest deadline supports O(log n)
//! extraction of the next expirer.
//!
//! Record keys alias the owning dict's key storage: callers pass in a
//! clone of the stored `Bytes`, which shares the same buffer.

use std::collections::BTreeSet;

use ahash::AHashMap;
use bytes::Bytes;
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq)]
enum Entries {
    /// A whole-key deadline.
    Single(u64),
    /// Optional whole-key deadline plus sub-key deadlines.
    Fat {
        whole: Option<u64>,
        subs: SmallVec<[(Bytes, u64); 4]>,
    },
}

/// One key's expiration state.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpireRecord {
    key: Bytes,
    entries: Entries,
}

impl ExpireRecord {
    pub fn new(key: Bytes, subkey: Option<Bytes>, when_ms: u64) -> Self {
        let entries = match subkey {
            None => Entries::Single(when_ms),
            Some(sub) => Entries::Fat {
                whole: None,
                subs: SmallVec::from_iter([(sub, when_ms)]),
            },
        };
        Self { key, entries }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Rebinds the record to another key. Used when a saved record is
    /// reinstalled under a renamed or moved key.
    pub(crate) fn set_key(&mut self, key: Bytes) {
        self.key = key;
    }

    /// The earliest deadline across all entries.
    pub fn when_min(&self) -> u64 {
        match &self.entries {
            Entries::Single(when) => *when,
            Entries::Fat { whole, subs } => {
                let sub_min = subs.iter().map(|(_, w)| *w).min();
                match (*whole, sub_min) {
                    (Some(a), Some(b)) => a.min(b),
                    (Some(a), None) => a,
                    (None, Some(b)) => b,
                    (None, None) => u64::MAX,
                }
            }
        }
    }

    /// The whole-key deadline, if one is set.
    pub fn whole_when(&self) -> Option<u64> {
        match &self.entries {
            Entries::Single(when) => Some(*when),
            Entries::Fat { whole, .. } => *whole,
        }
    }

    pub fn subkey_when(&self, subkey: &[u8]) -> Option<u64> {
        match &self.entries {
            Entries::Single(_) => None,
            Entries::Fat { subs, .. } => subs
                .iter()
                .find(|(sub, _)| sub.as_ref() == subkey)
                .map(|(_, w)| *w),
        }
    }

    pub fn subkeys(&self) -> impl Iterator<Item = (&Bytes, u64)> {
        let subs: &[(Bytes, u64)] = match &self.entries {
            Entries::Single(_) => &[],
            Entries::Fat { subs, .. } => subs.as_slice(),
        };
        subs.iter().map(|(sub, when)| (sub, *when))
    }

    /// Updates one entry. Without a subkey the whole record is replaced
    /// by a plain whole-key deadline; with one, that sub-entry is
    /// updated (converting a single record to a fat one if needed).
    pub fn update(&mut self, subkey: Option<Bytes>, when_ms: u64) {
        match subkey {
            None => self.entries = Entries::Single(when_ms),
            Some(sub) => {
                if let Entries::Single(whole) = self.entries {
                    self.entries = Entries::Fat {
                        whole: Some(whole),
                        subs: SmallVec::new(),
                    };
                }
                let Entries::Fat { subs, .. } = &mut self.entries else {
                    unreachable!("converted above");
                };
                match subs.iter_mut().find(|(s, _)| s == &sub) {
                    Some(slot) => slot.1 = when_ms,
                    None => subs.push((sub, when_ms)),
                }
            }
        }
    }

    /// Removes one sub-entry. Returns `true` if it was present.
    pub fn erase_subkey(&mut self, subkey: &[u8]) -> bool {
        match &mut self.entries {
            Entries::Single(_) => false,
            Entries::Fat { subs, .. } => {
                let before = subs.len();
                subs.retain(|(sub, _)| sub.as_ref() != subkey);
                subs.len() != before
            }
        }
    }

    pub fn is_fat(&self) -> bool {
        matches!(self.entries, Entries::Fat { .. })
    }

    /// A record with no deadlines left must be removed from the set.
    pub fn is_empty(&self) -> bool {
        match &self.entries {
            Entries::Single(_) => false,
            Entries::Fat { whole, subs } => whole.is_none() && subs.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.entries {
            Entries::Single(_) => 1,
            Entries::Fat { whole, subs } => usize::from(whole.is_some()) + subs.len(),
        }
    }

    /// Removes entries expired at `now_ms`, reporting each through
    /// `expired`. Returns `true` if the whole-key deadline fired.
    fn drain_expired<F: FnMut(&Bytes, Option<&Bytes>, u64)>(
        &mut self,
        now_ms: u64,
        expired: &mut F,
    ) -> bool {
        match &mut self.entries {
            Entries::Single(when) if now_ms > *when => {
                expired(&self.key, None, *when);
                true
            }
            Entries::Single(_) => false,
            Entries::Fat { whole, subs } => {
                let mut whole_fired = false;
                if let Some(when) = *whole {
                    if now_ms > when {
                        expired(&self.key, None, when);
                        *whole = None;
                        whole_fired = true;
                    }
                }
                let key = &self.key;
                subs.retain(|(sub, when)| {
                    if now_ms > *when {
                        expired(key, Some(sub), *when);
                        false
                    } else {
                        true
                    }
                });
                whole_fired
            }
        }
    }
}

/// What [`ExpireSet::erase_subkey`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubkeyRemoval {
    /// No record for the key, or the sub-entry was not present.
    NotFound,
    /// The record has no sub-entries at all.
    NotFat,
    /// The sub-entry was removed; the record still holds others.
    Removed,
    /// The sub-entry was removed and the record became empty, so the
    /// whole record was dropped.
    RemovedRecord,
}

/// All expiration records of one keyspace layer, with an index ordered
/// by earliest deadline.
#[derive(Debug, Default, Clone)]
pub struct ExpireSet {
    records: AHashMap<Bytes, ExpireRecord>,
    by_when: BTreeSet<(u64, Bytes)>,
}

impl ExpireSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.records.contains_key(key)
    }

    pub fn find(&self, key: &[u8]) -> Option<&ExpireRecord> {
        self.records.get(key)
    }

    /// Inserts a record, replacing any existing one for the same key.
    pub fn insert(&mut self, record: ExpireRecord) {
        debug_assert!(!record.is_empty(), "empty records must not be stored");
        let key = record.key().clone();
        if let Some(old) = self.records.remove(&key) {
            self.by_when.remove(&(old.when_min(), key.clone()));
        }
        self.by_when.insert((record.when_min(), key.clone()));
        self.records.insert(key, record);
    }

    pub fn erase(&mut self, key: &[u8]) -> Option<ExpireRecord> {
        let record = self.records.remove(key)?;
        self.by_when.remove(&(record.when_min(), record.key().clone()));
        Some(record)
    }

    /// Updates one entry of the record for `key`, creating the record
    /// if absent. `key` should alias the owning dict's key storage.
    pub fn update(&mut self, key: Bytes, subkey: Option<Bytes>, when_ms: u64) {
        match self.erase(&key) {
            Some(mut record) => {
                record.update(subkey, when_ms);
                self.insert(record);
            }
            None => self.insert(ExpireRecord::new(key, subkey, when_ms)),
        }
    }

    /// Removes one sub-entry; drops the record when it empties out.
    pub fn erase_subkey(&mut self, key: &[u8], subkey: &[u8]) -> SubkeyRemoval {
        let Some(record) = self.records.get(key) else {
            return SubkeyRemoval::NotFound;
        };
        if !record.is_fat() {
            return SubkeyRemoval::NotFat;
        }
        let mut record = self.erase(key).expect("present above");
        let found = record.erase_subkey(subkey);
        if record.is_empty() {
            return SubkeyRemoval::RemovedRecord;
        }
        self.insert(record);
        if found {
            SubkeyRemoval::Removed
        } else {
            SubkeyRemoval::NotFound
        }
    }

    /// The earliest deadline in the set.
    pub fn earliest(&self) -> Option<(u64, &Bytes)> {
        self.by_when.iter().next().map(|(when, key)| (*when, key))
    }

    /// Up to `limit` records in deadline order, strictly after `cursor`.
    /// Used by the active expiration cycle to walk the set round-robin.
    pub fn candidates_after(
        &self,
        cursor: Option<&(u64, Bytes)>,
        limit: usize,
    ) -> Vec<(u64, Bytes)> {
        use std::ops::Bound;
        let range = match cursor {
            Some(position) => (Bound::Excluded(position.clone()), Bound::Unbounded),
            None => (Bound::Unbounded, Bound::Unbounded),
        };
        self.by_when.range(range).take(limit).cloned().collect()
    }

    /// Removes every entry expired at `now_ms`, invoking `expired` for
    /// each removed deadline (`None` subkey for whole-key deadlines).
    /// Records that keep live entries stay in the set. Returns the
    /// number of records removed outright.
    pub fn erase_if_expired_before<F: FnMut(&Bytes, Option<&Bytes>, u64)>(
        &mut self,
        now_ms: u64,
        mut expired: F,
    ) -> usize {
        let mut removed = 0;
        while let Some((when, key)) = self.earliest() {
            if now_ms <= when {
                break;
            }
            let key = key.clone();
            let mut record = self.erase(&key).expect("indexed record present");
            record.drain_expired(now_ms, &mut expired);
            if record.is_empty() {
                removed += 1;
            } else {
                self.insert(record);
            }
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExpireRecord> {
        self.records.values()
    }

    /// Consumes all records, e.g. when reconciling layers on a
    /// snapshot merge.
    pub fn drain(&mut self) -> impl Iterator<Item = ExpireRecord> + '_ {
        self.by_when.clear();
        self.records.drain().map(|(_, record)| record)
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.by_when.clear();
    }
}
