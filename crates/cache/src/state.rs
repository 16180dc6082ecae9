//! Cache occupancy ledger for a single bundle
//!
//! Tracks one entry per cached tensor over the bundle's execution schedule,
//! together with the aggregate occupancy and liveness counters measured
//! against a fixed byte budget.
//!
//! An entry moves strictly forward through its lifecycle:
//!
//! ```text
//! Alive --release--> Dead --reclaim--> Reclaimed
//!   |                                     ^
//!   +---------------reclaim---------------+
//! ```
//!
//! Dead entries still occupy capacity until they are reclaimed. Reclaimed
//! entries are kept in the arena for post-mortem inspection but are no longer
//! reachable by key.

use std::collections::HashMap;

use serde::Serialize;

/// Identifies the real (de-aliased) tensor owning a cache entry
pub type CacheKey = u64;

/// Signed byte count. Free capacity goes negative while over-subscribed.
pub type Capacity = i64;

/// Schedule position of the operation that accessed an entry
pub type AccessIndex = usize;

/// Lifecycle state of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EntryState {
    /// In use by upcoming accesses
    Alive,
    /// Released, capacity not yet returned to the free pool
    Dead,
    /// Capacity returned, entry no longer tracked
    Reclaimed,
}

/// A single tensor's occupancy record
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key: CacheKey,
    capacity: Capacity,
    accesses: Vec<AccessIndex>,
    state: EntryState,
}

impl CacheEntry {
    fn new(key: CacheKey, capacity: Capacity) -> Self {
        Self {
            key,
            capacity,
            accesses: Vec::new(),
            state: EntryState::Alive,
        }
    }

    pub fn key(&self) -> CacheKey {
        self.key
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// Accesses in insertion order
    pub fn accesses(&self) -> &[AccessIndex] {
        &self.accesses
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    fn last_access(&self) -> Option<AccessIndex> {
        self.accesses.last().copied()
    }
}

/// Snapshot of the ledger counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStateStats {
    /// Fixed budget in bytes
    pub budget: Capacity,

    /// Capacity held by alive and dead entries
    pub occupied: Capacity,

    /// Capacity held by alive entries
    pub live: Capacity,

    /// High-water mark of `live`
    pub max_live: Capacity,

    /// Number of entries per state
    pub alive_entries: usize,
    pub dead_entries: usize,
    pub reclaimed_entries: usize,
}

impl CacheStateStats {
    /// Occupied capacity relative to the budget. Exceeds 1.0 while over-subscribed.
    pub fn utilization(&self) -> f64 {
        if self.budget == 0 {
            0.0
        } else {
            self.occupied as f64 / self.budget as f64
        }
    }

    /// Peak live capacity relative to the budget
    pub fn peak_utilization(&self) -> f64 {
        if self.budget == 0 {
            0.0
        } else {
            self.max_live as f64 / self.budget as f64
        }
    }
}

/// Per-bundle cache ledger
///
/// Entries live in an arena with a side index from key to arena slot. The
/// index only holds entries that were not reclaimed yet.
///
/// # Example
///
/// ```
/// use bundle_cache::BundleCacheState;
///
/// let mut state = BundleCacheState::new(100);
/// state.cache(1, 80);
/// state.add_access(1, 0);
/// state.release(1);
///
/// assert_eq!(state.total_free(), 20);
/// assert_eq!(state.max_reclaim(), 80);
/// assert_eq!(state.lru_reclaim_candidates(), vec![1]);
/// ```
#[derive(Debug, Clone)]
pub struct BundleCacheState {
    budget: Capacity,
    occupied: Capacity,
    live: Capacity,
    max_live: Capacity,
    entries: Vec<CacheEntry>,
    index: HashMap<CacheKey, usize>,
}

impl BundleCacheState {
    /// Create an empty ledger with a fixed budget in bytes
    pub fn new(budget: Capacity) -> Self {
        assert!(budget >= 0, "cache budget must not be negative, got {budget}");
        Self {
            budget,
            occupied: 0,
            live: 0,
            max_live: 0,
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn budget(&self) -> Capacity {
        self.budget
    }

    /// `budget - occupied`, negative while over-subscribed
    pub fn total_free(&self) -> Capacity {
        self.budget - self.occupied
    }

    pub fn total_occupied(&self) -> Capacity {
        self.occupied
    }

    pub fn total_live(&self) -> Capacity {
        self.live
    }

    pub fn max_live_capacity(&self) -> Capacity {
        self.max_live
    }

    /// Capacity held by dead entries, i.e. what reclaiming could free
    pub fn max_reclaim(&self) -> Capacity {
        self.occupied - self.live
    }

    pub fn is_cached(&self, key: CacheKey) -> bool {
        self.state_of(key) == Some(EntryState::Alive)
    }

    pub fn is_reclaim_candidate(&self, key: CacheKey) -> bool {
        self.state_of(key) == Some(EntryState::Dead)
    }

    fn state_of(&self, key: CacheKey) -> Option<EntryState> {
        self.entry(key).map(CacheEntry::state)
    }

    /// Tracked (non-reclaimed) entry for `key`
    pub fn entry(&self, key: CacheKey) -> Option<&CacheEntry> {
        self.index.get(&key).map(|&slot| &self.entries[slot])
    }

    fn tracked_mut(&mut self, key: CacheKey, operation: &str) -> &mut CacheEntry {
        match self.index.get(&key) {
            Some(&slot) => &mut self.entries[slot],
            None => panic!("{operation}: no tracked cache entry for key {key}"),
        }
    }

    /// Start tracking a new alive entry
    ///
    /// # Panics
    ///
    /// If `key` already has an alive or dead entry.
    pub fn cache(&mut self, key: CacheKey, capacity: Capacity) {
        assert!(
            !self.index.contains_key(&key),
            "cache: key {key} already has a tracked entry"
        );
        assert!(capacity >= 0, "cache: negative capacity {capacity} for key {key}");

        self.index.insert(key, self.entries.len());
        self.entries.push(CacheEntry::new(key, capacity));
        self.occupied += capacity;
        self.live += capacity;
        self.max_live = self.max_live.max(self.live);
    }

    /// Mark an alive entry dead. Its capacity stays occupied until reclaimed.
    ///
    /// # Panics
    ///
    /// If the entry is missing or not alive.
    pub fn release(&mut self, key: CacheKey) {
        let entry = self.tracked_mut(key, "release");
        assert_eq!(
            entry.state,
            EntryState::Alive,
            "release: entry for key {key} is not alive"
        );
        entry.state = EntryState::Dead;
        let capacity = entry.capacity;
        self.live -= capacity;
    }

    /// Return the entry's capacity to the free pool and stop tracking it
    ///
    /// # Panics
    ///
    /// If the entry was already reclaimed (or never cached).
    pub fn reclaim(&mut self, key: CacheKey) {
        let slot = match self.index.remove(&key) {
            Some(slot) => slot,
            None => panic!("reclaim: no tracked cache entry for key {key}"),
        };
        let entry = &mut self.entries[slot];
        let was_alive = entry.state == EntryState::Alive;
        entry.state = EntryState::Reclaimed;
        let capacity = entry.capacity;

        self.occupied -= capacity;
        if was_alive {
            self.live -= capacity;
        }
    }

    /// Capacity of the tracked entry, 0 when untracked
    pub fn capacity(&self, key: CacheKey) -> Capacity {
        self.entry(key).map_or(0, CacheEntry::capacity)
    }

    /// Accesses of the tracked entry, empty when untracked
    pub fn accesses(&self, key: CacheKey) -> &[AccessIndex] {
        self.entry(key).map_or(&[], CacheEntry::accesses)
    }

    pub fn add_access(&mut self, key: CacheKey, access: AccessIndex) {
        self.tracked_mut(key, "add_access").accesses.push(access);
    }

    /// Dead entries, least recently used first
    ///
    /// Entries with the same last access keep their insertion order.
    ///
    /// # Panics
    ///
    /// If a dead entry was never accessed.
    pub fn lru_reclaim_candidates(&self) -> Vec<CacheKey> {
        let mut candidates: Vec<(AccessIndex, CacheKey)> = self
            .entries
            .iter()
            .filter(|entry| entry.state == EntryState::Dead)
            .map(|entry| match entry.last_access() {
                Some(last) => (last, entry.key),
                None => panic!("dead cache entry for key {} has no recorded access", entry.key),
            })
            .collect();
        candidates.sort_by_key(|&(last, _)| last);
        candidates.into_iter().map(|(_, key)| key).collect()
    }

    /// All entries ever created, reclaimed ones included, in creation order
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.iter()
    }

    pub fn stats(&self) -> CacheStateStats {
        let count = |state: EntryState| self.entries.iter().filter(|e| e.state == state).count();
        CacheStateStats {
            budget: self.budget,
            occupied: self.occupied,
            live: self.live,
            max_live: self.max_live,
            alive_entries: count(EntryState::Alive),
            dead_entries: count(EntryState::Dead),
            reclaimed_entries: count(EntryState::Reclaimed),
        }
    }
}
