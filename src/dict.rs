//! The hash table under every keyspace layer.
//!
//! A chained table pair with incremental rehash: writes migrate a few
//! buckets at a time so no single operation pays for a full resize.
//! The cursor [`scan`](Dict::scan) uses reverse-bit increments, which
//! makes it stable across resizes — every entry present at both the
//! start and the end of a full scan is returned at least once, no
//! matter how the table grew or shrank in between.
//!
//! Generic over the stored value so the composite value encodings
//! (hash fields, set members, sorted-set scores) get the same cursor
//! guarantees the top-level keyspace has.

use ahash::RandomState;
use bytes::Bytes;

/// Initial bucket count for a freshly used table.
const INITIAL_SIZE: usize = 4;

/// Buckets migrated per incremental rehash step.
const REHASH_BATCH: usize = 1;

/// Empty buckets visited per migrated bucket before a step gives up,
/// bounding the latency of a step on sparse tables.
const REHASH_EMPTY_VISITS: usize = 10;

#[derive(Debug)]
struct Node<V> {
    key: Bytes,
    value: V,
    next: Option<Box<Node<V>>>,
}

#[derive(Debug)]
struct Table<V> {
    buckets: Vec<Option<Box<Node<V>>>>,
    used: usize,
}

impl<V> Table<V> {
    fn empty() -> Self {
        Self {
            buckets: Vec::new(),
            used: 0,
        }
    }

    fn with_size(size: usize) -> Self {
        let mut buckets = Vec::with_capacity(size);
        buckets.resize_with(size, || None);
        Self { buckets, used: 0 }
    }

    fn mask(&self) -> u64 {
        (self.buckets.len() as u64).wrapping_sub(1)
    }
}

/// Hash table from byte-string keys to `V`, with incremental rehash,
/// random sampling, and a resize-stable cursor scan.
#[derive(Debug)]
pub struct Dict<V> {
    tables: [Table<V>; 2],
    /// Next bucket of `tables[0]` to migrate; `None` when not rehashing.
    rehash_idx: Option<usize>,
    hasher: RandomState,
}

impl<V> Default for Dict<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> Clone for Dict<V> {
    fn clone(&self) -> Self {
        let mut copy = Dict::new();
        for (k, v) in self.iter() {
            copy.insert(k.clone(), v.clone());
        }
        copy
    }
}

impl<V: PartialEq> PartialEq for Dict<V> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl<V> Dict<V> {
    pub fn new() -> Self {
        Self {
            tables: [Table::empty(), Table::empty()],
            rehash_idx: None,
            hasher: RandomState::new(),
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.tables[0].used + self.tables[1].used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn hash(&self, key: &[u8]) -> u64 {
        self.hasher.hash_one(key)
    }

    fn is_rehashing(&self) -> bool {
        self.rehash_idx.is_some()
    }

    /// Migrates up to `REHASH_BATCH` buckets from the old table.
    fn rehash_step(&mut self) {
        let Some(mut idx) = self.rehash_idx else {
            return;
        };
        let mut moved = 0;
        let mut empty_visits = 0;
        while moved < REHASH_BATCH {
            if idx >= self.tables[0].buckets.len() {
                break;
            }
            match self.tables[0].buckets[idx].take() {
                None => {
                    idx += 1;
                    empty_visits += 1;
                    if empty_visits > REHASH_BATCH * REHASH_EMPTY_VISITS {
                        break;
                    }
                }
                Some(mut node) => {
                    // relink every node of the chain into the new table
                    loop {
                        let next = node.next.take();
                        let slot = (self.hash(&node.key) & self.tables[1].mask()) as usize;
                        node.next = self.tables[1].buckets[slot].take();
                        self.tables[1].buckets[slot] = Some(node);
                        self.tables[0].used -= 1;
                        self.tables[1].used += 1;
                        match next {
                            Some(n) => node = n,
                            None => break,
                        }
                    }
                    idx += 1;
                    moved += 1;
                }
            }
        }
        if idx >= self.tables[0].buckets.len() && self.tables[0].used == 0 {
            self.tables[0] = std::mem::replace(&mut self.tables[1], Table::empty());
            self.rehash_idx = None;
        } else {
            self.rehash_idx = Some(idx);
        }
    }

    fn start_rehash(&mut self, new_size: usize) {
        let size = new_size.next_power_of_two().max(INITIAL_SIZE);
        if size == self.tables[0].buckets.len() {
            return;
        }
        self.tables[1] = Table::with_size(size);
        self.rehash_idx = Some(0);
    }

    fn expand_if_needed(&mut self) {
        if self.is_rehashing() {
            return;
        }
        if self.tables[0].buckets.is_empty() {
            self.tables[0] = Table::with_size(INITIAL_SIZE);
            return;
        }
        if self.tables[0].used >= self.tables[0].buckets.len() {
            self.start_rehash(self.tables[0].used * 2);
        }
    }

    /// Shrinks the table when it has grown far past its population.
    /// Safe to call at any time; a no-op while a rehash is running.
    pub fn resize_if_needed(&mut self) {
        if self.is_rehashing() {
            return;
        }
        let size = self.tables[0].buckets.len();
        if size > INITIAL_SIZE && self.tables[0].used < size / 8 {
            self.start_rehash(self.tables[0].used.max(INITIAL_SIZE));
        }
    }

    /// Inserts a new entry. Returns `false` (dropping `value`) if the
    /// key is already present.
    pub fn insert(&mut self, key: Bytes, value: V) -> bool {
        self.rehash_step();
        self.expand_if_needed();
        if self.get(&key).is_some() {
            return false;
        }
        let target = if self.is_rehashing() { 1 } else { 0 };
        let slot = (self.hash(&key) & self.tables[target].mask()) as usize;
        let node = Box::new(Node {
            key,
            value,
            next: self.tables[target].buckets[slot].take(),
        });
        self.tables[target].buckets[slot] = Some(node);
        self.tables[target].used += 1;
        true
    }

    /// Upserts an entry, returning the previous value if one existed.
    pub fn insert_or_replace(&mut self, key: Bytes, value: V) -> Option<V> {
        if let Some(slot) = self.get_mut(&key) {
            return Some(std::mem::replace(slot, value));
        }
        self.insert(key, value);
        None
    }

    /// Finds the `(table, slot)` holding `key`, if any.
    fn locate(&self, key: &[u8], hash: u64) -> Option<(usize, usize)> {
        for table in 0..2 {
            let t = &self.tables[table];
            if !t.buckets.is_empty() {
                let slot = (hash & t.mask()) as usize;
                let mut node = t.buckets[slot].as_deref();
                while let Some(n) = node {
                    if n.key.as_ref() == key {
                        return Some((table, slot));
                    }
                    node = n.next.as_deref();
                }
            }
            if !self.is_rehashing() {
                break;
            }
        }
        None
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        self.get_key_value(key).map(|(_, v)| v)
    }

    /// Returns the stored key alongside the value. The stored `Bytes`
    /// can be cloned to alias the dict's key storage (expire records
    /// rely on this to avoid duplicating key bytes).
    pub fn get_key_value(&self, key: &[u8]) -> Option<(&Bytes, &V)> {
        let hash = self.hash(key);
        let (table, slot) = self.locate(key, hash)?;
        let mut node = self.tables[table].buckets[slot].as_deref();
        while let Some(n) = node {
            if n.key.as_ref() == key {
                return Some((&n.key, &n.value));
            }
            node = n.next.as_deref();
        }
        None
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        let hash = self.hash(key);
        let (table, slot) = self.locate(key, hash)?;
        let mut node = self.tables[table].buckets[slot].as_deref_mut();
        while let Some(n) = node {
            if n.key.as_ref() == key {
                return Some(&mut n.value);
            }
            node = n.next.as_deref_mut();
        }
        None
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.locate(key, self.hash(key)).is_some()
    }

    /// Removes an entry, returning the stored key and value.
    pub fn remove(&mut self, key: &[u8]) -> Option<(Bytes, V)> {
        self.rehash_step();
        let hash = self.hash(key);
        let (table, slot) = self.locate(key, hash)?;
        // detach the chain and rebuild it without the matching node
        let mut chain = self.tables[table].buckets[slot].take();
        let mut rebuilt: Option<Box<Node<V>>> = None;
        let mut removed = None;
        while let Some(mut node) = chain {
            chain = node.next.take();
            if removed.is_none() && node.key.as_ref() == key {
                let inner = *node;
                removed = Some((inner.key, inner.value));
            } else {
                node.next = rebuilt;
                rebuilt = Some(node);
            }
        }
        self.tables[table].buckets[slot] = rebuilt;
        if removed.is_some() {
            self.tables[table].used -= 1;
        }
        removed
    }

    /// Picks an approximately uniform random entry.
    pub fn random(&self) -> Option<(&Bytes, &V)> {
        use rand::Rng;
        if self.is_empty() {
            return None;
        }
        let mut rng = rand::rng();
        let s0 = self.tables[0].buckets.len();
        let s1 = self.tables[1].buckets.len();
        for _ in 0..100 {
            let slot = rng.random_range(0..s0 + s1);
            let chain = if slot < s0 {
                self.tables[0].buckets[slot].as_deref()
            } else {
                self.tables[1].buckets[slot - s0].as_deref()
            };
            let Some(head) = chain else { continue };
            let chain_len = {
                let mut len = 0;
                let mut n = Some(head);
                while let Some(node) = n {
                    len += 1;
                    n = node.next.as_deref();
                }
                len
            };
            let mut pick = rng.random_range(0..chain_len);
            let mut node = head;
            while pick > 0 {
                node = node.next.as_deref().expect("counted above");
                pick -= 1;
            }
            return Some((&node.key, &node.value));
        }
        // pathologically sparse table: fall back to a linear pick
        let nth = rng.random_range(0..self.len());
        self.iter().nth(nth)
    }

    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            tables: [&self.tables[0], &self.tables[1]],
            table: 0,
            bucket: 0,
            node: None,
        }
    }

    pub fn clear(&mut self) {
        self.tables = [Table::empty(), Table::empty()];
        self.rehash_idx = None;
    }

    fn emit_chain<F: FnMut(&Bytes, &V)>(table: &Table<V>, slot: usize, f: &mut F) {
        let mut node = table.buckets[slot].as_deref();
        while let Some(n) = node {
            f(&n.key, &n.value);
            node = n.next.as_deref();
        }
    }

    /// Cursor scan. Call with cursor 0 to start; feed each returned
    /// cursor back in until it returns 0 again.
    ///
    /// Stateless between calls: every entry present for the whole scan
    /// is emitted at least once, entries added or removed mid-scan may
    /// or may not appear, and some entries can be emitted twice. The
    /// cursor walks bucket indices in reverse-bit order so that bucket
    /// splits during an incremental rehash neither skip nor strand
    /// entries.
    pub fn scan<F: FnMut(&Bytes, &V)>(&self, cursor: u64, f: &mut F) -> u64 {
        if self.is_empty() {
            return 0;
        }
        let mut v = cursor;
        if !self.is_rehashing() {
            let t0 = &self.tables[0];
            let m0 = t0.mask();
            Self::emit_chain(t0, (v & m0) as usize, f);
            v |= !m0;
            v = v.reverse_bits().wrapping_add(1).reverse_bits();
        } else {
            // scan the smaller table's bucket, then every bucket of the
            // larger table that it expands into
            let (small, large) = if self.tables[0].buckets.len() <= self.tables[1].buckets.len() {
                (&self.tables[0], &self.tables[1])
            } else {
                (&self.tables[1], &self.tables[0])
            };
            let m0 = small.mask();
            let m1 = large.mask();
            Self::emit_chain(small, (v & m0) as usize, f);
            loop {
                Self::emit_chain(large, (v & m1) as usize, f);
                v |= !m1;
                v = v.reverse_bits().wrapping_add(1).reverse_bits();
                if v & (m0 ^ m1) == 0 {
                    break;
                }
            }
        }
        v
    }
}

pub struct Iter<'a, V> {
    tables: [&'a Table<V>; 2],
    table: usize,
    bucket: usize,
    node: Option<&'a Node<V>>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (&'a Bytes, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(n) = self.node {
                self.node = n.next.as_deref();
                return Some((&n.key, &n.value));
            }
            let t = self.tables.get(self.table)?;
            if self.bucket >= t.buckets.len() {
                self.table += 1;
                self.bucket = 0;
                continue;
            }
            self.node = t.buckets[self.bucket].as_deref();
            self.bucket += 1;
        }
    }
}

pub struct IntoIter<V> {
    buckets: std::vec::IntoIter<Option<Box<Node<V>>>>,
    current: Option<Box<Node<V>>>,
}

impl<V> Iterator for IntoIter<V> {
    type Item = (Bytes, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(mut node) = self.current.take() {
                self.current = node.next.take();
                return Some((node.key, node.value));
            }
            match self.buckets.next() {
                Some(bucket) => self.current = bucket,
                None => return None,
            }
        }
    }
}

impl<V> IntoIterator for Dict<V> {
    type Item = (Bytes, V);
    type IntoIter = IntoIter<V>;

    fn into_iter(self) -> IntoIter<V> {
        let [t0, t1] = self.tables;
        let mut buckets = t0.buckets;
        buckets.extend(t1.buckets);
        IntoIter {
            buckets: buckets.into_iter(),
            current: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashSet;

    fn key(i: usize) -> Bytes {
        Bytes::from(format!("key:{i}"))
    }

    #[test]
    fn insert_get_remove() {
        let mut d: Dict<u32> = Dict::new();
        assert!(d.insert(key(1), 10));
        assert!(!d.insert(key(1), 20), "duplicate insert must fail");
        assert_eq!(d.get(&key(1)), Some(&10));
        assert_eq!(d.len(), 1);
        assert_eq!(d.remove(&key(1)), Some((key(1), 10)));
        assert_eq!(d.get(&key(1)), None);
        assert!(d.is_empty());
    }

    #[test]
    fn survives_growth() {
        let mut d: Dict<usize> = Dict::new();
        for i in 0..10_000 {
            assert!(d.insert(key(i), i));
        }
        assert_eq!(d.len(), 10_000);
        for i in 0..10_000 {
            assert_eq!(d.get(&key(i)), Some(&i), "lost key:{i}");
        }
    }

    #[test]
    fn remove_from_chain_middle() {
        let mut d: Dict<usize> = Dict::new();
        for i in 0..64 {
            d.insert(key(i), i);
        }
        for i in (0..64).step_by(2) {
            assert!(d.remove(&key(i)).is_some());
        }
        assert_eq!(d.len(), 32);
        for i in (1..64).step_by(2) {
            assert_eq!(d.get(&key(i)), Some(&i));
        }
    }

    #[test]
    fn insert_or_replace_returns_old() {
        let mut d: Dict<&str> = Dict::new();
        assert_eq!(d.insert_or_replace(key(1), "a"), None);
        assert_eq!(d.insert_or_replace(key(1), "b"), Some("a"));
        assert_eq!(d.get(&key(1)), Some(&"b"));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn iter_sees_everything() {
        let mut d: Dict<usize> = Dict::new();
        for i in 0..500 {
            d.insert(key(i), i);
        }
        let seen: AHashSet<usize> = d.iter().map(|(_, v)| *v).collect();
        assert_eq!(seen.len(), 500);
    }

    #[test]
    fn into_iter_consumes_everything() {
        let mut d: Dict<usize> = Dict::new();
        for i in 0..100 {
            d.insert(key(i), i);
        }
        let all: Vec<(Bytes, usize)> = d.into_iter().collect();
        assert_eq!(all.len(), 100);
    }

    #[test]
    fn random_returns_member() {
        let mut d: Dict<usize> = Dict::new();
        assert!(d.random().is_none());
        for i in 0..32 {
            d.insert(key(i), i);
        }
        for _ in 0..50 {
            let (k, v) = d.random().expect("non-empty");
            assert_eq!(d.get(k), Some(v));
        }
    }

    #[test]
    fn scan_covers_stable_dict() {
        let mut d: Dict<usize> = Dict::new();
        for i in 0..1000 {
            d.insert(key(i), i);
        }
        let mut seen = AHashSet::new();
        let mut cursor = 0;
        loop {
            cursor = d.scan(cursor, &mut |_, v| {
                seen.insert(*v);
            });
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn scan_complete_while_growing() {
        // interleave scan steps with inserts that force rehashes; keys
        // present from the start must all be emitted at least once
        let mut d: Dict<usize> = Dict::new();
        for i in 0..256 {
            d.insert(key(i), i);
        }
        let mut seen = AHashSet::new();
        let mut cursor = 0;
        let mut extra = 10_000;
        loop {
            cursor = d.scan(cursor, &mut |_, v| {
                seen.insert(*v);
            });
            if cursor == 0 {
                break;
            }
            // grow the table mid-scan
            for _ in 0..64 {
                d.insert(key(extra), extra);
                extra += 1;
            }
        }
        for i in 0..256 {
            assert!(seen.contains(&i), "scan lost original key:{i}");
        }
    }

    #[test]
    fn scan_complete_while_shrinking() {
        let mut d: Dict<usize> = Dict::new();
        for i in 0..4096 {
            d.insert(key(i), i);
        }
        // keep the first 64 keys, delete the rest, shrinking mid-scan
        let mut seen = AHashSet::new();
        let mut cursor = 0;
        let mut doomed = 4095;
        loop {
            cursor = d.scan(cursor, &mut |_, v| {
                seen.insert(*v);
            });
            if cursor == 0 {
                break;
            }
            for _ in 0..32 {
                if doomed >= 64 {
                    d.remove(&key(doomed));
                    doomed -= 1;
                }
            }
            d.resize_if_needed();
        }
        for i in 0..64 {
            assert!(seen.contains(&i), "scan lost surviving key:{i}");
        }
    }

    #[test]
    fn shrink_keeps_entries() {
        let mut d: Dict<usize> = Dict::new();
        for i in 0..2048 {
            d.insert(key(i), i);
        }
        for i in 64..2048 {
            d.remove(&key(i));
        }
        d.resize_if_needed();
        // drive the rehash to completion with reads and writes
        for i in 0..64 {
            assert_eq!(d.get(&key(i)), Some(&i));
            d.insert(key(10_000 + i), i);
        }
        assert_eq!(d.len(), 128);
    }

    #[test]
    fn stored_key_aliases() {
        let mut d: Dict<u8> = Dict::new();
        let k = Bytes::from_static(b"alpha");
        d.insert(k.clone(), 1);
        let (stored, _) = d.get_key_value(b"alpha").unwrap();
        // cloning the stored key shares the same buffer
        let alias = stored.clone();
        assert_eq!(alias, k);
    }
}
