//! Bounded cookie cache — spec §5.
//!
//! Maps `PeerAddr -> CacheEntry`, bounded to a fixed capacity. When full,
//! a new peer evicts the oldest entry (FIFO), matching the reference
//! implementation's simple ring of entries rather than anything LRU-like:
//! the cache only needs to bound memory under a spoofed-source flood, not
//! to optimize hit rate.
//!
//! Concurrency is a deliberate simplification of spec §9's suggested
//! wait-free/seqlock scheme: each slot is an individually-lockable
//! `parking_lot::Mutex<CacheEntry>`, but [`Cache::lookup_or_create`] and
//! [`Cache::update_existing`] hold the cache-wide index lock for their
//! entire critical section, including the caller's closure. That
//! serializes every existence-check-then-mutate operation against
//! concurrent inserts and evictions: spec §4.2's "if no entry for P,
//! create no entry" and the send path's cold-create-vs-renew branch both
//! depend on "does an entry exist" and "mutate it" happening as one
//! atomic step, not two separate cache calls a concurrent eviction could
//! land between. [`Cache::get`] stays a cheap, separately-locked
//! read — callers that only need a snapshot for logging/diagnostics,
//! not a decision with a forward state mutation, can tolerate it going
//! stale by the time they act on it.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::entry::{CacheEntry, PeerAddr};

/// A bounded, FIFO-evicting map from peer address to cache entry.
pub struct Cache {
    capacity: usize,
    slots: Vec<Mutex<CacheEntry>>,
    index: Mutex<Index>,
}

struct Index {
    by_peer: HashMap<PeerAddr, usize>,
    free: Vec<usize>,
    order: VecDeque<usize>,
}

impl Cache {
    /// Build an empty cache holding at most `capacity` entries.
    ///
    /// `capacity == 0` is a degenerate but legal configuration: every
    /// lookup misses and every insert is immediately evicted, which is
    /// useful for an `accept_uncookied = false` deployment that wants the
    /// cookie path exercised on every single packet.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Mutex::new(CacheEntry::default())).collect();
        Self {
            capacity,
            slots,
            index: Mutex::new(Index {
                by_peer: HashMap::new(),
                free: (0..capacity).rev().collect(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.lock().by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up an existing entry for `peer`, without creating one. A
    /// plain snapshot read, not a basis for a subsequent mutation
    /// decision (use [`Cache::update_existing`] or
    /// [`Cache::lookup_or_create`] for that).
    pub fn get(&self, peer: PeerAddr) -> Option<CacheEntry> {
        let slot_idx = *self.index.lock().by_peer.get(&peer)?;
        Some(*self.slots[slot_idx].lock())
    }

    /// Run `f` against the live entry for `peer`, creating a fresh default
    /// entry (with `peer` already set) if none exists yet. If the cache is
    /// at capacity and `peer` is not already present, the oldest entry is
    /// evicted first (spec §5).
    ///
    /// `f`'s second argument is `was_created`: true iff this call is the
    /// one that allocated the slot. The index lock is held for the whole
    /// call, including `f`, so that flag reflects the true state at the
    /// moment of mutation rather than a separately-fetched, possibly-stale
    /// existence check (spec §4.4's cold-create-vs-renew branch must not
    /// re-run cold-create over an entry another thread just installed a
    /// cookie into).
    pub fn lookup_or_create<R>(&self, peer: PeerAddr, f: impl FnOnce(&mut CacheEntry, bool) -> R) -> R {
        if self.capacity == 0 {
            let mut entry = CacheEntry::default();
            entry.set_peer(peer);
            return f(&mut entry, true);
        }

        let mut index = self.index.lock();
        if let Some(&slot_idx) = index.by_peer.get(&peer) {
            let mut entry = self.slots[slot_idx].lock();
            return f(&mut entry, false);
        }

        let slot_idx = match index.free.pop() {
            Some(idx) => idx,
            None => {
                let evicted_idx = index.order.pop_front().expect("capacity > 0 implies an entry to evict");
                let evicted_peer = self.slots[evicted_idx].lock().peer();
                index.by_peer.remove(&evicted_peer);
                evicted_idx
            }
        };
        index.by_peer.insert(peer, slot_idx);
        index.order.push_back(slot_idx);

        let mut entry = self.slots[slot_idx].lock();
        *entry = CacheEntry::default();
        entry.set_peer(peer);
        f(&mut entry, true)
    }

    /// Run `f` against the live entry for `peer` iff one already exists;
    /// returns `None` without creating an entry or invoking `f` otherwise.
    /// The index lock is held for the whole call, so a concurrent insert
    /// or eviction can't land between the existence check and the
    /// mutation (spec §4.2's SET-COOKIE-from-unknown-peer rule: "create no
    /// entry" must never be observably violated by fabricating one).
    pub fn update_existing<R>(&self, peer: PeerAddr, f: impl FnOnce(&mut CacheEntry) -> R) -> Option<R> {
        if self.capacity == 0 {
            return None;
        }
        let index = self.index.lock();
        let slot_idx = *index.by_peer.get(&peer)?;
        let mut entry = self.slots[slot_idx].lock();
        Some(f(&mut entry))
    }

    /// Remove the entry for `peer`, if present.
    pub fn remove(&self, peer: PeerAddr) {
        let mut index = self.index.lock();
        if let Some(slot_idx) = index.by_peer.remove(&peer) {
            index.order.retain(|&idx| idx != slot_idx);
            index.free.push(slot_idx);
            *self.slots[slot_idx].lock() = CacheEntry::default();
        }
    }

    /// Snapshot the occupied entries, oldest-insertion-order first. Used to
    /// persist the cache into the shared region (spec §3's "destroyed only
    /// by eviction or explicit administrative clear" — a daemon restart is
    /// neither).
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let index = self.index.lock();
        index.order.iter().map(|&idx| *self.slots[idx].lock()).collect()
    }

    /// Rebuild a cache of the given `capacity` from a previously
    /// [`snapshot`](Self::snapshot)ted entry list, preserving FIFO
    /// eviction order. Entries beyond `capacity` are dropped (the region's
    /// capacity shrank since the snapshot was taken).
    pub fn from_entries(capacity: usize, entries: impl IntoIterator<Item = CacheEntry>) -> Self {
        let cache = Self::new(capacity);
        if capacity == 0 {
            return cache;
        }
        for entry in entries.into_iter().take(capacity) {
            cache.lookup_or_create(entry.peer(), |slot, _| *slot = entry);
        }
        cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn peer(n: u16) -> PeerAddr {
        Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, n)
    }

    #[test]
    fn create_then_lookup_round_trips() {
        let cache = Cache::new(4);
        cache.lookup_or_create(peer(1), |e, _| e.set_lifetime_log2(3));
        let entry = cache.get(peer(1)).unwrap();
        assert_eq!(entry.lifetime_log2(), 3);
        assert_eq!(entry.peer(), peer(1));
    }

    #[test]
    fn miss_returns_none() {
        let cache = Cache::new(4);
        assert!(cache.get(peer(99)).is_none());
    }

    #[test]
    fn evicts_oldest_when_full() {
        let cache = Cache::new(2);
        cache.lookup_or_create(peer(1), |_, _| {});
        cache.lookup_or_create(peer(2), |_, _| {});
        cache.lookup_or_create(peer(3), |_, _| {});

        assert!(cache.get(peer(1)).is_none(), "oldest entry should have been evicted");
        assert!(cache.get(peer(2)).is_some());
        assert!(cache.get(peer(3)).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn revisiting_existing_peer_does_not_evict() {
        let cache = Cache::new(2);
        cache.lookup_or_create(peer(1), |_, _| {});
        cache.lookup_or_create(peer(2), |_, _| {});
        cache.lookup_or_create(peer(1), |e, _| e.set_lifetime_log2(5));

        assert!(cache.get(peer(1)).is_some());
        assert!(cache.get(peer(2)).is_some());
    }

    #[test]
    fn zero_capacity_never_retains_entries() {
        let cache = Cache::new(0);
        cache.lookup_or_create(peer(1), |e, _| e.set_lifetime_log2(2));
        assert!(cache.get(peer(1)).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn remove_frees_the_slot_for_reuse() {
        let cache = Cache::new(1);
        cache.lookup_or_create(peer(1), |_, _| {});
        cache.remove(peer(1));
        assert!(cache.get(peer(1)).is_none());
        cache.lookup_or_create(peer(2), |_, _| {});
        assert!(cache.get(peer(2)).is_some());
    }

    #[test]
    fn lookup_or_create_reports_was_created() {
        let cache = Cache::new(2);
        let created_first = cache.lookup_or_create(peer(1), |_, was_created| was_created);
        assert!(created_first);
        let created_second = cache.lookup_or_create(peer(1), |_, was_created| was_created);
        assert!(!created_second);
    }

    #[test]
    fn update_existing_never_creates_an_entry() {
        let cache = Cache::new(2);
        let ran = cache.update_existing(peer(1), |e| e.set_lifetime_log2(7));
        assert!(ran.is_none());
        assert!(cache.get(peer(1)).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn update_existing_mutates_when_present() {
        let cache = Cache::new(2);
        cache.lookup_or_create(peer(1), |_, _| {});
        let ran = cache.update_existing(peer(1), |e| {
            e.set_lifetime_log2(7);
            42
        });
        assert_eq!(ran, Some(42));
        assert_eq!(cache.get(peer(1)).unwrap().lifetime_log2(), 7);
    }
}
