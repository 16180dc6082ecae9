//! Bundle Cache Scheduler Library
//!
//! Schedule-aware pieces of cache planning: the yield candidate queue with its
//! pipeline safety margin, and the policy turning reclaim dependencies into
//! ordering edges.
//!
//! # Example
//!
//! ```
//! use bundle_cache::{ReleaseType, RequirementDetails};
//! use bundle_cache_scheduler::{is_beyond_pipeline, YieldQueue};
//!
//! let mut queue = YieldQueue::new();
//! let requirement = RequirementDetails::alloc_h(64).with_release(ReleaseType::DegradeCme);
//! queue.add_candidate(0, Some(0), 42, 0, requirement);
//!
//! // Current operation runs in lane 2, pipeline depth 2
//! let options = queue.yielding_options(|c| is_beyond_pipeline(c.lane, 2, 2).then(|| c.capacity()));
//! assert_eq!(options.select(32), Some(&[42][..]));
//! ```

pub mod dependency;
pub mod yield_queue;

pub use dependency::DependencyPolicy;
pub use yield_queue::{
    is_beyond_pipeline, NodeIndex, PipelineLane, YieldCandidate, YieldQueue, YieldingOptions,
};
