//! LRU reclaiming allocator over the bundle cache ledger
//!
//! Answers "can `capacity` bytes be made available for this tensor, and by
//! reclaiming which dead entries" and performs the matching ledger mutation.
//! Every reclaimed entry contributes its recorded accesses as dependencies:
//! the operations at those schedule positions must complete before the new
//! owner of the capacity starts.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use crate::state::{AccessIndex, BundleCacheState, CacheKey, Capacity};

/// Outcome of an allocation request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationResult {
    pub successful: bool,

    /// Schedule positions that must be ordered before the new allocation's user
    pub dependencies: BTreeSet<AccessIndex>,

    /// Bytes that could not be made available (0 on success)
    pub missing_capacity: Capacity,
}

impl AllocationResult {
    fn success(dependencies: BTreeSet<AccessIndex>) -> Self {
        Self {
            successful: true,
            dependencies,
            missing_capacity: 0,
        }
    }

    fn failure(missing_capacity: Capacity) -> Self {
        Self {
            successful: false,
            dependencies: BTreeSet::new(),
            missing_capacity,
        }
    }
}

/// Allocator reclaiming least-recently-used dead entries on demand
///
/// # Example
///
/// ```
/// use bundle_cache::{BundleCacheState, LruReclaimAllocator};
///
/// let mut state = BundleCacheState::new(100);
/// let mut allocator = LruReclaimAllocator::new(&mut state);
///
/// assert!(allocator.allocate(1, 80).successful);
/// allocator.record_access(1, 0);
/// assert!(allocator.free(1));
///
/// // Reusing the capacity of tensor 1 depends on its accessor
/// let result = allocator.allocate(2, 40);
/// assert!(result.successful);
/// assert_eq!(result.dependencies.into_iter().collect::<Vec<_>>(), vec![0]);
/// ```
#[derive(Debug)]
pub struct LruReclaimAllocator<'s> {
    state: &'s mut BundleCacheState,
}

impl<'s> LruReclaimAllocator<'s> {
    pub fn new(state: &'s mut BundleCacheState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &BundleCacheState {
        self.state
    }

    /// Free capacity plus everything reclaiming could return
    pub fn potential_capacity(&self) -> Capacity {
        self.state.total_free() + self.state.max_reclaim()
    }

    /// Make `capacity` bytes available for `key`
    pub fn allocate(&mut self, key: CacheKey, capacity: Capacity) -> AllocationResult {
        if self.state.is_cached(key) {
            self.reallocate(key, capacity)
        } else if self.state.is_reclaim_candidate(key) {
            self.revive(key, capacity)
        } else {
            self.new_allocation(key, capacity)
        }
    }

    /// Release `key` if it is cached. Returns false when it was not.
    pub fn free(&mut self, key: CacheKey) -> bool {
        if !self.state.is_cached(key) {
            return false;
        }
        trace!(key, capacity = self.state.capacity(key), "releasing cache entry");
        self.state.release(key);
        true
    }

    pub fn record_access(&mut self, key: CacheKey, access: AccessIndex) {
        self.state.add_access(key, access);
    }

    fn new_allocation(&mut self, key: CacheKey, capacity: Capacity) -> AllocationResult {
        let potential = self.potential_capacity();
        if capacity > potential {
            debug!(key, capacity, potential, "not enough reclaimable cache capacity");
            return AllocationResult::failure(capacity - potential);
        }

        let dependencies = self.reclaim_for(capacity);
        self.state.cache(key, capacity);
        AllocationResult::success(dependencies)
    }

    /// Reclaim LRU dead entries until `capacity` bytes are free
    fn reclaim_for(&mut self, capacity: Capacity) -> BTreeSet<AccessIndex> {
        let mut dependencies = BTreeSet::new();
        let shortfall = capacity - self.state.total_free();
        if shortfall <= 0 {
            return dependencies;
        }

        let mut reclaimed: Capacity = 0;
        for candidate in self.state.lru_reclaim_candidates() {
            dependencies.extend(self.state.accesses(candidate).iter().copied());
            reclaimed += self.state.capacity(candidate);
            trace!(key = candidate, reclaimed, shortfall, "reclaiming dead cache entry");
            self.state.reclaim(candidate);
            if reclaimed >= shortfall {
                break;
            }
        }
        assert!(
            reclaimed >= shortfall,
            "reclaimed {reclaimed} bytes out of a {shortfall} bytes shortfall despite the capacity check"
        );
        dependencies
    }

    fn reallocate(&mut self, key: CacheKey, capacity: Capacity) -> AllocationResult {
        let extra = capacity - self.state.capacity(key);
        if extra == 0 {
            return AllocationResult::success(BTreeSet::new());
        }

        let potential = self.potential_capacity();
        if extra > potential {
            debug!(key, capacity, extra, potential, "cannot grow cache entry");
            return AllocationResult::failure(extra - potential);
        }

        let accesses = self.state.accesses(key).to_vec();
        self.state.reclaim(key);
        let result = self.new_allocation(key, capacity);
        assert!(
            result.successful,
            "re-allocation of key {key} failed after the capacity check"
        );
        for access in accesses {
            self.state.add_access(key, access);
        }
        result
    }

    /// A dead entry cannot become alive again: reclaim it and start a new one
    fn revive(&mut self, key: CacheKey, capacity: Capacity) -> AllocationResult {
        let potential = self.potential_capacity();
        if capacity > potential {
            debug!(key, capacity, potential, "cannot revive dead cache entry");
            return AllocationResult::failure(capacity - potential);
        }

        let mut dependencies: BTreeSet<AccessIndex> =
            self.state.accesses(key).iter().copied().collect();
        self.state.reclaim(key);
        let result = self.new_allocation(key, capacity);
        assert!(
            result.successful,
            "revival of key {key} failed after the capacity check"
        );
        dependencies.extend(result.dependencies);
        AllocationResult::success(dependencies)
    }
}
