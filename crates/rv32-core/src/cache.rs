//! Bounded least-frequently-used cache (translation cache policy B).
//!
//! Entries are filed into frequency buckets, each ordered by recency, so
//! both `get` and `put` stay O(1): a hit unlinks the entry and refiles it
//! at the head of the next bucket; an insert at capacity evicts the tail
//! of the lowest non-empty bucket (least frequent, then least recent).
//!
//! This backs the native code cache, where a full flush would throw away
//! work that is far too expensive to redo, and optionally the block cache
//! itself when native compilation is active.

use std::collections::HashMap;

/// Frequency buckets 0..999; counters saturate at the top bucket.
const THRESHOLD: u32 = 1000;

const NIL: u32 = u32::MAX;

struct Entry<V> {
    key: u32,
    value: V,
    freq: u32,
    prev: u32,
    next: u32,
}

#[derive(Clone, Copy)]
struct Bucket {
    head: u32,
    tail: u32,
}

pub struct Cache<V> {
    capacity: usize,
    index: HashMap<u32, u32>,
    slab: Vec<Option<Entry<V>>>,
    free: Vec<u32>,
    buckets: Vec<Bucket>,
}

impl<V> Cache<V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be non-zero");
        Self {
            capacity,
            index: HashMap::with_capacity(capacity),
            slab: Vec::with_capacity(capacity),
            free: Vec::new(),
            buckets: vec![Bucket { head: NIL, tail: NIL }; THRESHOLD as usize],
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn entry(&self, slot: u32) -> &Entry<V> {
        self.slab[slot as usize].as_ref().expect("live slot")
    }

    fn entry_mut(&mut self, slot: u32) -> &mut Entry<V> {
        self.slab[slot as usize].as_mut().expect("live slot")
    }

    fn unlink(&mut self, slot: u32) {
        let (freq, prev, next) = {
            let e = self.entry(slot);
            (e.freq, e.prev, e.next)
        };
        if prev != NIL {
            self.entry_mut(prev).next = next;
        } else {
            self.buckets[freq as usize].head = next;
        }
        if next != NIL {
            self.entry_mut(next).prev = prev;
        } else {
            self.buckets[freq as usize].tail = prev;
        }
    }

    fn push_head(&mut self, slot: u32, freq: u32) {
        let old_head = self.buckets[freq as usize].head;
        {
            let e = self.entry_mut(slot);
            e.freq = freq;
            e.prev = NIL;
            e.next = old_head;
        }
        if old_head != NIL {
            self.entry_mut(old_head).prev = slot;
        } else {
            self.buckets[freq as usize].tail = slot;
        }
        self.buckets[freq as usize].head = slot;
    }

    /// Look up `key`, bumping its frequency on a hit.
    pub fn get(&mut self, key: u32) -> Option<&V> {
        let slot = *self.index.get(&key)?;
        let freq = self.entry(slot).freq;
        if freq + 1 < THRESHOLD {
            self.unlink(slot);
            self.push_head(slot, freq + 1);
        }
        Some(&self.entry(slot).value)
    }

    /// Look up `key` without touching the frequency bookkeeping.
    pub fn peek(&self, key: u32) -> Option<&V> {
        let slot = *self.index.get(&key)?;
        Some(&self.entry(slot).value)
    }

    /// Use frequency of `key`, 0 when absent.
    pub fn freq(&self, key: u32) -> u32 {
        match self.index.get(&key) {
            Some(&slot) => self.entry(slot).freq,
            None => 0,
        }
    }

    /// Insert `key`, evicting the least-frequently / least-recently used
    /// entry if at capacity. Returns the evicted pair so the caller can
    /// release whatever the value owned.
    pub fn put(&mut self, key: u32, value: V) -> Option<(u32, V)> {
        debug_assert!(self.index.len() <= self.capacity);
        let mut evicted = None;
        if !self.index.contains_key(&key) && self.index.len() == self.capacity {
            let victim = self
                .buckets
                .iter()
                .find(|b| b.tail != NIL)
                .map(|b| b.tail)
                .expect("cache at capacity has a victim");
            self.unlink(victim);
            let entry = self.slab[victim as usize].take().expect("live slot");
            self.index.remove(&entry.key);
            self.free.push(victim);
            evicted = Some((entry.key, entry.value));
        }
        if let Some(&slot) = self.index.get(&key) {
            // Re-insert on an existing key replaces the value in place.
            self.entry_mut(slot).value = value;
            return evicted;
        }

        let entry = Entry {
            key,
            value,
            freq: 0,
            prev: NIL,
            next: NIL,
        };
        let slot = if let Some(slot) = self.free.pop() {
            self.slab[slot as usize] = Some(entry);
            slot
        } else {
            self.slab.push(Some(entry));
            (self.slab.len() - 1) as u32
        };
        self.index.insert(key, slot);
        self.push_head(slot, 0);
        evicted
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.slab.clear();
        self.free.clear();
        for bucket in &mut self.buckets {
            *bucket = Bucket { head: NIL, tail: NIL };
        }
    }

    /// Visit every entry, lowest frequency bucket first, most recent first
    /// within a bucket.
    pub fn profile(&self, mut f: impl FnMut(u32, u32, &V)) {
        for bucket in &self.buckets {
            let mut slot = bucket.head;
            while slot != NIL {
                let e = self.entry(slot);
                f(e.key, e.freq, &e.value);
                slot = e.next;
            }
        }
    }
}
