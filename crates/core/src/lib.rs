//! Bundle Cache Core Library
//!
//! Cache planning for the operations of a bundle: the bundle model, operand
//! access profiles, the requirement analyzer, the per-operation directive
//! setter and the whole-bundle planner.

pub mod analyzer;
pub mod bundle;
pub mod node_cache_setter;
pub mod planner;
pub mod profile;

pub use analyzer::{CacheRequirementsAnalyzer, DeviceTopology, ProfileRequirementsAnalyzer};
pub use bundle::{Bundle, ControlEdge, Engine, Node, NodeKind, Operand, Tensor, TensorId};
pub use node_cache_setter::NodeCacheSetter;
pub use planner::{BundleCachePlan, BundleCachePlanner, CachePlanError, CachePlanResult, PlanJob};
pub use profile::{
    AccessProfileSource, AccessStats, InputAccessProfile, OutputAccessProfile, ProfileTable,
};
