//! Bundle Cache Library
//!
//! Compile-time bookkeeping of a fixed-size accelerator cache over one bundle's
//! execution schedule: the occupancy ledger, the LRU reclaiming allocator, the
//! per-access caching requirements and the planner configuration.
//!
//! # Example
//!
//! ```
//! use bundle_cache::{BundleCacheState, CachePlannerConfig, LruReclaimAllocator};
//!
//! let config = CachePlannerConfig::default().with_fragmentation_factor(0.5);
//! let mut state = BundleCacheState::new(config.effective_budget(200) as i64);
//!
//! let mut allocator = LruReclaimAllocator::new(&mut state);
//! assert!(allocator.allocate(1, 100).successful);
//! assert!(!allocator.allocate(2, 1).successful);
//! ```

pub mod allocator;
pub mod config;
pub mod requirement;
pub mod state;

pub use allocator::{AllocationResult, LruReclaimAllocator};
pub use config::{CachePlannerConfig, ConfigError, ThrashingPreventionMode};
pub use requirement::{
    CacheClass, CacheDirective, CacheMaintenanceAction, CacheMetaData, PostAccessAction,
    ReleaseType, RequirementDetails,
};
pub use state::{
    AccessIndex, BundleCacheState, CacheEntry, CacheKey, CacheStateStats, Capacity, EntryState,
};
