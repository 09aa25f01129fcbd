//! Adaptive Replacement Cache (ARC) for records fetched from disk
//!
//! Keyed by log address; values are full record images. Records are
//! immutable, so entries never go stale until recovery rewrites the log,
//! at which point the cache is cleared.
//!
//! - T1: records read once recently
//! - T2: records read more than once
//! - B1/B2: ghost addresses recently evicted from T1/T2
//!
//! The target size of T1 adapts to ghost hits.

use bytes::Bytes;
use hybridkv_common::Address;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache statistics
#[derive(Debug, Default)]
pub struct ReadCacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub inserts: AtomicU64,
    pub evictions: AtomicU64,
}

impl ReadCacheStats {
    /// Hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 { 0.0 } else { hits / total }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    T1,
    T2,
    B1,
    B2,
}

struct ArcState {
    t1: VecDeque<Address>,
    t2: VecDeque<Address>,
    b1: VecDeque<Address>,
    b2: VecDeque<Address>,
    location: HashMap<Address, List>,
    records: HashMap<Address, Bytes>,
    /// Target size of T1
    p: usize,
    capacity: usize,
}

impl ArcState {
    fn new(capacity: usize) -> Self {
        Self {
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            location: HashMap::with_capacity(capacity * 2),
            records: HashMap::with_capacity(capacity),
            p: 0,
            capacity,
        }
    }

    fn list_mut(&mut self, list: List) -> &mut VecDeque<Address> {
        match list {
            List::T1 => &mut self.t1,
            List::T2 => &mut self.t2,
            List::B1 => &mut self.b1,
            List::B2 => &mut self.b2,
        }
    }

    fn unlink(&mut self, address: Address) -> Option<List> {
        let list = self.location.remove(&address)?;
        self.list_mut(list).retain(|a| *a != address);
        Some(list)
    }

    fn link(&mut self, address: Address, list: List) {
        self.list_mut(list).push_back(address);
        self.location.insert(address, list);
    }

    fn pop_oldest(&mut self, list: List) -> Option<Address> {
        let address = self.list_mut(list).pop_front()?;
        self.location.remove(&address);
        Some(address)
    }

    fn resident(&self) -> usize {
        self.t1.len() + self.t2.len()
    }

    fn ghosts(&self) -> usize {
        self.b1.len() + self.b2.len()
    }

    /// Evict one resident record into its ghost list
    fn replace(&mut self, in_b2: bool, stats: &ReadCacheStats) {
        if self.resident() == 0 {
            return;
        }
        let t1 = self.t1.len();
        let from_t1 = t1 > 0 && (t1 > self.p || (in_b2 && t1 == self.p));
        let (from, ghost) = if from_t1 {
            (List::T1, List::B1)
        } else {
            (List::T2, List::B2)
        };
        if let Some(evicted) = self.pop_oldest(from) {
            self.records.remove(&evicted);
            self.link(evicted, ghost);
            stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Read cache of on-disk records
pub struct ReadCache {
    state: Mutex<ArcState>,
    stats: ReadCacheStats,
}

impl ReadCache {
    /// Create a cache holding up to `capacity` records
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ArcState::new(capacity.max(1))),
            stats: ReadCacheStats::default(),
        }
    }

    /// Look up the record image at `address`
    pub fn get(&self, address: Address) -> Option<Bytes> {
        let mut state = self.state.lock();
        match state.location.get(&address).copied() {
            Some(list @ (List::T1 | List::T2)) => {
                state.list_mut(list).retain(|a| *a != address);
                state.link(address, List::T2);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                state.records.get(&address).cloned()
            }
            _ => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert the record image read from `address`
    pub fn insert(&self, address: Address, record: Bytes) {
        let mut state = self.state.lock();
        let capacity = state.capacity;
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);

        match state.location.get(&address).copied() {
            Some(List::T1 | List::T2) => {
                state.unlink(address);
                state.link(address, List::T2);
                state.records.insert(address, record);
                return;
            }
            Some(List::B1) => {
                let delta = (state.b2.len() / state.b1.len().max(1)).max(1);
                state.p = (state.p + delta).min(capacity);
                state.unlink(address);
                state.replace(false, &self.stats);
                state.link(address, List::T2);
                state.records.insert(address, record);
                return;
            }
            Some(List::B2) => {
                let delta = (state.b1.len() / state.b2.len().max(1)).max(1);
                state.p = state.p.saturating_sub(delta);
                state.unlink(address);
                state.replace(true, &self.stats);
                state.link(address, List::T2);
                state.records.insert(address, record);
                return;
            }
            None => {}
        }

        let l1 = state.t1.len() + state.b1.len();
        if l1 >= capacity {
            if state.t1.len() < capacity {
                state.pop_oldest(List::B1);
                state.replace(false, &self.stats);
            } else if let Some(evicted) = state.pop_oldest(List::T1) {
                state.records.remove(&evicted);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        } else if state.resident() + state.ghosts() >= capacity {
            if state.resident() + state.ghosts() >= 2 * capacity {
                state.pop_oldest(List::B2);
            }
            state.replace(false, &self.stats);
        }

        state.link(address, List::T1);
        state.records.insert(address, record);
    }

    /// Drop every record
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let capacity = state.capacity;
        *state = ArcState::new(capacity);
    }

    /// Number of resident records
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether no record is resident
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get statistics
    pub fn stats(&self) -> &ReadCacheStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(i: u64) -> Address {
        Address::new(64 * i)
    }

    fn rec(i: u64) -> Bytes {
        Bytes::from(format!("record-{i}"))
    }

    #[test]
    fn test_insert_get() {
        let cache = ReadCache::new(10);
        cache.insert(addr(1), rec(1));
        cache.insert(addr(2), rec(2));

        assert_eq!(cache.get(addr(1)), Some(rec(1)));
        assert_eq!(cache.get(addr(2)), Some(rec(2)));
        assert_eq!(cache.get(addr(3)), None);
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 2);
        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_eviction_of_oldest_single_use() {
        let cache = ReadCache::new(3);
        for i in 1..=3 {
            cache.insert(addr(i), rec(i));
        }
        assert_eq!(cache.len(), 3);

        cache.insert(addr(4), rec(4));
        assert_eq!(cache.len(), 3);
        assert!(cache.get(addr(1)).is_none());
        assert_eq!(cache.get(addr(4)), Some(rec(4)));
    }

    #[test]
    fn test_frequent_records_survive_scan() {
        let cache = ReadCache::new(4);
        cache.insert(addr(1), rec(1));
        cache.get(addr(1));

        // A one-pass scan over many addresses
        for i in 100..110 {
            cache.insert(addr(i), rec(i));
        }
        assert_eq!(cache.get(addr(1)), Some(rec(1)));
        assert!(cache.len() <= 4);
    }

    #[test]
    fn test_ghost_hit_readmits() {
        let cache = ReadCache::new(2);
        cache.insert(addr(1), rec(1));
        cache.insert(addr(2), rec(2));
        cache.insert(addr(3), rec(3));
        assert!(cache.get(addr(1)).is_none());

        cache.insert(addr(1), rec(1));
        assert_eq!(cache.get(addr(1)), Some(rec(1)));
        assert!(cache.len() <= 2);
    }

    #[test]
    fn test_clear() {
        let cache = ReadCache::new(10);
        cache.insert(addr(1), rec(1));
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(addr(1)).is_none());
    }
}
