//! Caching requirements and per-operand cache metadata
//!
//! A [`RequirementDetails`] is the decision taken for one tensor access: how
//! much capacity it needs, which allocation directive the hardware should use,
//! its eviction class, and what should happen to the entry after the access.
//! [`CacheMetaData`] is what ends up attached to the operand of the scheduled
//! operation.

use serde::{Deserialize, Serialize};

use crate::state::Capacity;

/// Allocation directive for a single operand access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CacheDirective {
    /// Do not allocate cache lines on a miss
    #[default]
    NoAllocate,
    /// Allocate a single copy in the home core of the address
    HomeAllocate,
    /// Allocate in the accessing core
    DcoreAllocate,
    /// Allocate a copy in every accessing core
    SharedAllocate,
}

/// Eviction priority tier, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum CacheClass {
    Low,
    #[default]
    Normal,
    High,
    Top,
}

/// Post-access cache maintenance instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CacheMaintenanceAction {
    #[default]
    Nop,
    /// Downgrade the lines' state so they are the first to be replaced
    Degrade,
    /// Drop the lines without write-back
    Discard,
}

/// What happens to the cache entry once the access completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PostAccessAction {
    #[default]
    None,
    Release,
}

/// How a released (or yielded) access gives up its cache lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReleaseType {
    #[default]
    None,
    /// Lower the class of the access, no maintenance instruction
    DegradeClass,
    /// Issue a degrade maintenance instruction after the access
    DegradeCme,
    /// Issue a discard maintenance instruction after the access
    DiscardCme,
}

impl ReleaseType {
    /// Returns true if releasing this way emits a maintenance instruction
    pub fn needs_maintenance_instruction(&self) -> bool {
        matches!(self, ReleaseType::DegradeCme | ReleaseType::DiscardCme)
    }
}

/// Caching decision for one tensor access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementDetails {
    /// Bytes required in the cache
    pub capacity: Capacity,
    pub directive: CacheDirective,
    pub class: CacheClass,
    pub post_access: PostAccessAction,
    pub release: ReleaseType,
}

impl Default for RequirementDetails {
    fn default() -> Self {
        Self::no_alloc()
    }
}

impl RequirementDetails {
    /// No caching, no release
    pub fn no_alloc() -> Self {
        Self {
            capacity: 0,
            directive: CacheDirective::NoAllocate,
            class: CacheClass::Normal,
            post_access: PostAccessAction::None,
            release: ReleaseType::None,
        }
    }

    /// Home allocation of `capacity` bytes
    pub fn alloc_h(capacity: Capacity) -> Self {
        Self::allocating(CacheDirective::HomeAllocate, capacity)
    }

    /// Per-core allocation of `capacity` bytes
    pub fn alloc_d(capacity: Capacity) -> Self {
        Self::allocating(CacheDirective::DcoreAllocate, capacity)
    }

    /// Shared multi-core allocation; `capacity` already accounts for the replicas
    pub fn alloc_dh(capacity: Capacity) -> Self {
        Self::allocating(CacheDirective::SharedAllocate, capacity)
    }

    fn allocating(directive: CacheDirective, capacity: Capacity) -> Self {
        Self {
            capacity,
            directive,
            class: CacheClass::High,
            post_access: PostAccessAction::None,
            release: ReleaseType::None,
        }
    }

    /// Set the release policy applied once the entry is released or yielded
    pub fn with_release(mut self, release: ReleaseType) -> Self {
        self.release = release;
        self
    }

    /// Release the entry right after this access
    pub fn releasing(mut self, release: ReleaseType) -> Self {
        self.release = release;
        self.post_access = PostAccessAction::Release;
        self
    }

    pub fn with_class(mut self, class: CacheClass) -> Self {
        self.class = class;
        self
    }

    pub fn is_caching_required(&self) -> bool {
        self.directive != CacheDirective::NoAllocate
    }

    pub fn is_release_required(&self) -> bool {
        self.post_access == PostAccessAction::Release
    }

    /// An entry may be yielded when it is cached and kept alive past this access
    pub fn is_yield_allowed(&self) -> bool {
        self.is_caching_required() && !self.is_release_required()
    }
}

/// Cache metadata attached to a single operand of a scheduled operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheMetaData {
    pub cache_directive: CacheDirective,
    pub cache_class: CacheClass,
    pub cm_action: CacheMaintenanceAction,
    /// Maintenance instruction id, 0 when no instruction is attached
    pub mcid: u32,
}

impl CacheMetaData {
    /// Record the allocation decision of a successfully cached access
    pub fn apply_requirement(&mut self, requirement: &RequirementDetails) {
        self.cache_directive = requirement.directive;
        self.cache_class = requirement.class;
    }

    /// Apply a release policy. `mcid` is only consumed for maintenance instructions.
    ///
    /// Degrading the class also drops the directive: an access whose lines are
    /// about to be given up must not allocate new ones on a miss.
    pub fn apply_release(&mut self, release: ReleaseType, mcid: impl FnOnce() -> u32) {
        match release {
            ReleaseType::None => {}
            ReleaseType::DegradeClass => {
                self.cache_class = CacheClass::Low;
                self.cache_directive = CacheDirective::NoAllocate;
            }
            ReleaseType::DegradeCme => {
                self.cm_action = CacheMaintenanceAction::Degrade;
                self.mcid = mcid();
            }
            ReleaseType::DiscardCme => {
                self.cm_action = CacheMaintenanceAction::Discard;
                self.mcid = mcid();
            }
        }
    }
}
