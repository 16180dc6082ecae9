//! Whole-bundle cache planning
//!
//! Drives the [`NodeCacheSetter`] over every operation of a bundle in
//! schedule order and reports the outcome.

use std::thread;

use bundle_cache::{BundleCacheState, CachePlannerConfig, CacheStateStats, Capacity};
use bundle_cache_scheduler::NodeIndex;
use serde::Serialize;
use tracing::debug;

use crate::analyzer::CacheRequirementsAnalyzer;
use crate::bundle::{Bundle, ControlEdge};
use crate::node_cache_setter::NodeCacheSetter;

/// Error types for bundle cache planning
#[derive(Debug, thiserror::Error)]
pub enum CachePlanError {
    #[error("Insufficient cache capacity for operation {name} (node {node})")]
    InsufficientCapacity { node: NodeIndex, name: String },

    #[error("Cache budget out of range: {0} bytes")]
    InvalidBudget(u64),

    #[error("Failed to spawn planning thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CachePlanResult<T> = Result<T, CachePlanError>;

/// Outcome of planning one bundle
#[derive(Debug, Clone, Serialize)]
pub struct BundleCachePlan {
    /// Budget after fragmentation compensation
    pub budget: Capacity,
    pub max_live_capacity: Capacity,
    pub maintenance_instructions: u32,
    pub inserted_edges: Vec<ControlEdge>,
    pub stats: CacheStateStats,
}

impl BundleCachePlan {
    pub fn to_json(&self) -> CachePlanResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// One bundle of a parallel planning batch
pub struct PlanJob<'a> {
    pub bundle: &'a mut Bundle,
    /// Raw budget in bytes, before fragmentation compensation
    pub budget: u64,
    pub analyzer: &'a (dyn CacheRequirementsAnalyzer + Sync),
}

/// Plans the cache usage of whole bundles
#[derive(Debug, Clone, Default)]
pub struct BundleCachePlanner {
    config: CachePlannerConfig,
}

impl BundleCachePlanner {
    pub fn new(config: CachePlannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CachePlannerConfig {
        &self.config
    }

    /// Set the cache directives of every operation of `bundle`
    ///
    /// # Errors
    ///
    /// Returns [`CachePlanError::InsufficientCapacity`] for the first
    /// operation whose requirements could not all be met. Operations before
    /// it keep their metadata.
    ///
    /// # Panics
    ///
    /// If cache capacity is still live once the last operation was planned,
    /// i.e. some cached tensor was never released.
    pub fn plan(
        &self,
        bundle: &mut Bundle,
        budget: u64,
        analyzer: &dyn CacheRequirementsAnalyzer,
    ) -> CachePlanResult<BundleCachePlan> {
        let effective = self.config.effective_budget(budget);
        let effective = Capacity::try_from(effective).map_err(|_| CachePlanError::InvalidBudget(budget))?;
        debug!(nodes = bundle.len(), budget, effective, "planning bundle cache usage");

        let mut state = BundleCacheState::new(effective);
        let mut setter = NodeCacheSetter::new(&mut state, &self.config);
        for node in 0..bundle.len() {
            if !setter.set_directives(bundle, node, analyzer) {
                return Err(CachePlanError::InsufficientCapacity {
                    node,
                    name: bundle.node(node).name.clone(),
                });
            }
        }
        let inserted_edges = setter.inserted_edges().to_vec();
        let maintenance_instructions = setter.maintenance_instructions();

        assert_eq!(
            state.total_live(),
            0,
            "cache capacity still live at the end of the bundle"
        );

        let plan = BundleCachePlan {
            budget: effective,
            max_live_capacity: state.max_live_capacity(),
            maintenance_instructions,
            inserted_edges,
            stats: state.stats(),
        };
        debug!(
            max_live = plan.max_live_capacity,
            edges = plan.inserted_edges.len(),
            maintenance_instructions,
            "bundle cache plan complete"
        );
        Ok(plan)
    }

    /// Plan independent bundles concurrently, one thread and ledger each
    ///
    /// Results are returned in job order.
    pub fn plan_independent(&self, jobs: Vec<PlanJob<'_>>) -> Vec<CachePlanResult<BundleCachePlan>> {
        thread::scope(|scope| {
            let handles: Vec<_> = jobs
                .into_iter()
                .enumerate()
                .map(|(idx, job)| {
                    thread::Builder::new()
                        .name(format!("bundle-cache-{idx}"))
                        .spawn_scoped(scope, move || self.plan(job.bundle, job.budget, job.analyzer))
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| match handle {
                    Ok(handle) => handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic)),
                    Err(err) => Err(CachePlanError::Spawn(err)),
                })
                .collect()
        })
    }
}
