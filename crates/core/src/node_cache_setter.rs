//! Per-operation cache directive setter
//!
//! Walks the operands of one scheduled operation, asks the requirement
//! analyzer what each access needs, and turns the answers into ledger
//! allocations, operand cache metadata and ordering edges. Outputs are
//! processed before inputs, and releases requested by this operation only take
//! effect once all of its operands were allocated.
//!
//! When an allocation does not fit, cached inputs of earlier operations that
//! were kept alive for later reuse may be yielded: their recorded metadata is
//! rewritten with their release policy and their entries are freed. Only
//! operations running at least `pipeline_depth` lanes behind the current one
//! are eligible, since operations of closer lanes may still be in flight.

use std::collections::{BTreeSet, HashSet};

use bundle_cache::{
    AccessIndex, BundleCacheState, CacheKey, CachePlannerConfig, Capacity, LruReclaimAllocator,
    RequirementDetails,
};
use bundle_cache_scheduler::{is_beyond_pipeline, DependencyPolicy, NodeIndex, YieldQueue};
use tracing::{debug, trace};

use crate::analyzer::CacheRequirementsAnalyzer;
use crate::bundle::{Bundle, ControlEdge, Operand};

/// Scratch state of a single `set_directives` call
#[derive(Debug, Default)]
struct NodeScratch {
    /// Keys of every operand of the operation, never yielded for it
    touched: HashSet<CacheKey>,
    keys_to_release: Vec<CacheKey>,
    dependencies: BTreeSet<AccessIndex>,
    failed: bool,
}

/// Sets the cache directives of a bundle's operations, one at a time
///
/// # Example
///
/// ```
/// use bundle_cache::{BundleCacheState, CacheDirective, CachePlannerConfig};
/// use bundle_cache_core::{
///     AccessStats, Bundle, Engine, InputAccessProfile, NodeCacheSetter, NodeKind,
///     ProfileRequirementsAnalyzer, ProfileTable,
/// };
///
/// let mut bundle = Bundle::new();
/// let input = bundle.add_tensor("in", 64);
/// let output = bundle.add_tensor("out", 64);
/// let node = bundle.add_node("gemm", NodeKind::Compute(Engine::Mme), vec![input], vec![output]);
///
/// let mut profiles = ProfileTable::new();
/// profiles.set_input(node, 0, InputAccessProfile::new(64, AccessStats::new(4, 1, 4)));
///
/// let config = CachePlannerConfig::default();
/// let analyzer = ProfileRequirementsAnalyzer::new(profiles, &config);
/// let mut state = BundleCacheState::new(1024);
/// let mut setter = NodeCacheSetter::new(&mut state, &config);
///
/// assert!(setter.set_directives(&mut bundle, node, &analyzer));
/// assert_eq!(bundle.node(node).inputs_cache_meta[0].cache_directive, CacheDirective::HomeAllocate);
/// ```
#[derive(Debug)]
pub struct NodeCacheSetter<'s> {
    allocator: LruReclaimAllocator<'s>,
    yield_queue: YieldQueue,
    policy: DependencyPolicy,
    enable_yielding: bool,
    pipeline_depth: u32,
    next_mcid: u32,
    inserted_edges: Vec<ControlEdge>,
}

impl<'s> NodeCacheSetter<'s> {
    pub fn new(state: &'s mut BundleCacheState, config: &CachePlannerConfig) -> Self {
        Self {
            allocator: LruReclaimAllocator::new(state),
            yield_queue: YieldQueue::new(),
            policy: DependencyPolicy::new(config.thrashing_prevention_mode),
            enable_yielding: config.enable_yielding,
            pipeline_depth: config.pipeline_depth,
            next_mcid: 1,
            inserted_edges: Vec::new(),
        }
    }

    pub fn cache_state(&self) -> &BundleCacheState {
        self.allocator.state()
    }

    pub fn yield_queue(&self) -> &YieldQueue {
        &self.yield_queue
    }

    /// Ordering edges added so far, in insertion order
    pub fn inserted_edges(&self) -> &[ControlEdge] {
        &self.inserted_edges
    }

    /// Number of maintenance instructions attached to operands so far
    pub fn maintenance_instructions(&self) -> u32 {
        self.next_mcid - 1
    }

    /// Set the cache metadata of every operand of `node_idx`
    ///
    /// Returns false if any required allocation could not be satisfied. The
    /// remaining operands are still processed, and the operation may be
    /// processed again with different requirements.
    pub fn set_directives(
        &mut self,
        bundle: &mut Bundle,
        node_idx: NodeIndex,
        analyzer: &dyn CacheRequirementsAnalyzer,
    ) -> bool {
        if bundle.node(node_idx).is_logical() {
            trace!(node = node_idx, "skipping logical operation");
            return true;
        }

        bundle.reset_cache_meta(node_idx);
        let node = bundle.node(node_idx);
        // An output must never take over the entry of an input read by the same operation
        let mut scratch = NodeScratch {
            touched: node
                .inputs
                .iter()
                .chain(&node.outputs)
                .map(|&tensor| bundle.cache_key(tensor))
                .collect(),
            ..NodeScratch::default()
        };

        for output in 0..bundle.node(node_idx).outputs.len() {
            let requirement = analyzer.output_requirement(bundle, node_idx, output);
            self.set_operand(bundle, node_idx, Operand::Output(output), requirement, &mut scratch);
        }
        for input in 0..bundle.node(node_idx).inputs.len() {
            let requirement = analyzer.input_requirement(bundle, node_idx, input);
            self.set_operand(bundle, node_idx, Operand::Input(input), requirement, &mut scratch);
        }

        for &key in &scratch.keys_to_release {
            self.allocator.free(key);
        }
        self.add_dependencies(bundle, node_idx, &scratch.dependencies);

        if scratch.failed {
            debug!(node = node_idx, name = %bundle.node(node_idx).name, "not all cache requirements were met");
        }
        !scratch.failed
    }

    fn set_operand(
        &mut self,
        bundle: &mut Bundle,
        node_idx: NodeIndex,
        operand: Operand,
        requirement: RequirementDetails,
        scratch: &mut NodeScratch,
    ) {
        let key = bundle.cache_key(bundle.operand_tensor(node_idx, operand));

        if requirement.is_caching_required() {
            match self.allocate(bundle, node_idx, key, requirement.capacity, &scratch.touched) {
                Some(dependencies) => {
                    bundle.cache_meta_mut(node_idx, operand).apply_requirement(&requirement);
                    scratch.dependencies.extend(dependencies);
                }
                None => scratch.failed = true,
            }
        }

        let cached = self.allocator.state().is_cached(key);
        if cached {
            self.allocator.record_access(key, node_idx);
        }

        if requirement.is_release_required() && cached {
            let next_mcid = &mut self.next_mcid;
            bundle
                .cache_meta_mut(node_idx, operand)
                .apply_release(requirement.release, || take_mcid(next_mcid));
            if !scratch.keys_to_release.contains(&key) {
                scratch.keys_to_release.push(key);
            }
            self.yield_queue.erase(key);
        } else if requirement.is_yield_allowed() && cached {
            if let Operand::Input(input_idx) = operand {
                let lane = bundle.node(node_idx).lane;
                self.yield_queue
                    .add_candidate(node_idx, lane, key, input_idx, requirement);
            }
        }
    }

    /// Allocate `capacity` for `key`, yielding earlier candidates if needed.
    /// Returns the dependencies of the allocation, or `None` on failure.
    fn allocate(
        &mut self,
        bundle: &mut Bundle,
        node_idx: NodeIndex,
        key: CacheKey,
        capacity: Capacity,
        touched: &HashSet<CacheKey>,
    ) -> Option<BTreeSet<AccessIndex>> {
        let result = self.allocator.allocate(key, capacity);
        if result.successful {
            return Some(result.dependencies);
        }

        let missing = result.missing_capacity;
        if !self.enable_yielding {
            debug!(node = node_idx, key, capacity, missing, "cache allocation failed");
            return None;
        }
        let Some(current_lane) = bundle.node(node_idx).lane else {
            debug!(node = node_idx, key, capacity, missing, "cache allocation failed, no lane to yield from");
            return None;
        };

        let depth = self.pipeline_depth;
        let state = self.allocator.state();
        let options = self.yield_queue.yielding_options(|candidate| {
            let eligible = !touched.contains(&candidate.key)
                && state.is_cached(candidate.key)
                && is_beyond_pipeline(candidate.lane, current_lane, depth);
            eligible.then(|| state.capacity(candidate.key))
        });
        let Some(selected) = options.select(missing) else {
            debug!(
                node = node_idx,
                key,
                capacity,
                missing,
                yieldable = options.capacity,
                "cache allocation failed, yielding would not help"
            );
            return None;
        };

        for &victim in selected {
            self.yield_entry(bundle, victim);
        }

        let retry = self.allocator.allocate(key, capacity);
        assert!(
            retry.successful,
            "allocation of {capacity} bytes for key {key} failed after yielding {missing} bytes"
        );
        Some(retry.dependencies)
    }

    /// Retroactively release a yield candidate at its registering access
    fn yield_entry(&mut self, bundle: &mut Bundle, key: CacheKey) {
        let Some(candidate) = self.yield_queue.erase(key) else {
            return;
        };
        debug!(
            node = candidate.node_idx,
            key,
            capacity = self.allocator.state().capacity(key),
            "yielding cache entry"
        );

        let next_mcid = &mut self.next_mcid;
        bundle
            .cache_meta_mut(candidate.node_idx, Operand::Input(candidate.input_idx))
            .apply_release(candidate.requirement.release, || take_mcid(next_mcid));
        self.allocator.free(key);
    }

    fn add_dependencies(
        &mut self,
        bundle: &mut Bundle,
        node_idx: NodeIndex,
        dependencies: &BTreeSet<AccessIndex>,
    ) {
        let kind = bundle.node(node_idx).kind;
        let ancestors = bundle.ancestors(node_idx);
        for &dependency in dependencies.range(..node_idx) {
            if ancestors.contains(&dependency) {
                continue;
            }
            if !self.policy.requires_edge(&bundle.node(dependency).kind, &kind) {
                trace!(from = dependency, to = node_idx, "dependency edge skipped by policy");
                continue;
            }
            if bundle.add_control_edge(dependency, node_idx) {
                debug!(from = dependency, to = node_idx, "added cache thrashing prevention edge");
                self.inserted_edges.push(ControlEdge {
                    from: dependency,
                    to: node_idx,
                });
            }
        }
    }
}

fn take_mcid(next: &mut u32) -> u32 {
    let mcid = *next;
    *next += 1;
    mcid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{Engine, NodeKind, TensorId};
    use bundle_cache::{
        CacheClass, CacheDirective, CacheMaintenanceAction, ReleaseType, ThrashingPreventionMode,
    };
    use std::collections::HashMap;

    use CacheDirective::{DcoreAllocate, HomeAllocate, NoAllocate, SharedAllocate};

    const TPC: NodeKind = NodeKind::Compute(Engine::Tpc);
    const MB: Capacity = 1024 * 1024;

    struct NotRequired;

    impl CacheRequirementsAnalyzer for NotRequired {
        fn input_requirement(&self, _: &Bundle, _: NodeIndex, _: usize) -> RequirementDetails {
            RequirementDetails::no_alloc()
        }

        fn output_requirement(&self, _: &Bundle, _: NodeIndex, _: usize) -> RequirementDetails {
            RequirementDetails::no_alloc()
        }
    }

    /// Home allocation of a fixed capacity for every input and every output
    struct ConstCap {
        input: RequirementDetails,
        output: RequirementDetails,
    }

    impl ConstCap {
        fn new(input_cap: Capacity, output_cap: Capacity, release_inputs: bool, release: ReleaseType) -> Self {
            let input = RequirementDetails::alloc_h(input_cap);
            let input = if release_inputs {
                input.releasing(release)
            } else {
                input.with_release(release)
            };
            Self {
                input,
                output: RequirementDetails::alloc_h(output_cap),
            }
        }

        /// Inputs stay alive after the access and may be yielded
        fn yielding(input_cap: Capacity, output_cap: Capacity) -> Self {
            Self::new(input_cap, output_cap, false, ReleaseType::DegradeCme)
        }

        fn releasing(input_cap: Capacity, output_cap: Capacity) -> Self {
            Self::new(input_cap, output_cap, true, ReleaseType::DegradeCme)
        }
    }

    impl CacheRequirementsAnalyzer for ConstCap {
        fn input_requirement(&self, _: &Bundle, _: NodeIndex, _: usize) -> RequirementDetails {
            self.input
        }

        fn output_requirement(&self, _: &Bundle, _: NodeIndex, _: usize) -> RequirementDetails {
            self.output
        }
    }

    /// Requirement per operand position
    struct Mapped {
        inputs: HashMap<usize, RequirementDetails>,
        outputs: HashMap<usize, RequirementDetails>,
    }

    impl Mapped {
        fn new(inputs: &[RequirementDetails], outputs: &[RequirementDetails]) -> Self {
            Self {
                inputs: inputs.iter().copied().enumerate().collect(),
                outputs: outputs.iter().copied().enumerate().collect(),
            }
        }
    }

    impl CacheRequirementsAnalyzer for Mapped {
        fn input_requirement(&self, _: &Bundle, _: NodeIndex, input: usize) -> RequirementDetails {
            self.inputs[&input]
        }

        fn output_requirement(&self, _: &Bundle, _: NodeIndex, output: usize) -> RequirementDetails {
            self.outputs[&output]
        }
    }

    /// [t0]->n0->[t1]->n1->[t2]->...
    fn chain(nodes: usize) -> Bundle {
        let mut bundle = Bundle::new();
        for idx in 0..=nodes {
            bundle.add_tensor(format!("t{idx}"), 0);
        }
        for idx in 0..nodes {
            bundle.add_node(format!("n{idx}"), TPC, vec![idx], vec![idx + 1]);
        }
        bundle
    }

    /// Single operation with fresh input and output tensors
    fn single(inputs: usize, outputs: usize) -> Bundle {
        let mut bundle = Bundle::new();
        let ins: Vec<TensorId> = (0..inputs).map(|i| bundle.add_tensor(format!("in{i}"), 0)).collect();
        let outs: Vec<TensorId> = (0..outputs).map(|i| bundle.add_tensor(format!("out{i}"), 0)).collect();
        bundle.add_node("n", TPC, ins, outs);
        bundle
    }

    /// Bundle from (inputs, outputs) tensor lists over `tensors` plain tensors
    fn graph(tensors: usize, nodes: &[(&[TensorId], &[TensorId])]) -> Bundle {
        let mut bundle = Bundle::new();
        for idx in 0..tensors {
            bundle.add_tensor(format!("t{idx}"), 0);
        }
        for (idx, (inputs, outputs)) in nodes.iter().enumerate() {
            bundle.add_node(format!("n{idx}"), TPC, inputs.to_vec(), outputs.to_vec());
        }
        bundle
    }

    fn with_lanes(mut bundle: Bundle, lanes: &[u32]) -> Bundle {
        for (node, &lane) in lanes.iter().enumerate() {
            bundle.set_lane(node, lane);
        }
        bundle
    }

    fn input_directives(bundle: &Bundle, node: NodeIndex) -> Vec<CacheDirective> {
        bundle.node(node).inputs_cache_meta.iter().map(|m| m.cache_directive).collect()
    }

    fn output_directives(bundle: &Bundle, node: NodeIndex) -> Vec<CacheDirective> {
        bundle.node(node).outputs_cache_meta.iter().map(|m| m.cache_directive).collect()
    }

    fn input_cm(bundle: &Bundle, node: NodeIndex, input: usize) -> (CacheMaintenanceAction, u32) {
        let meta = bundle.cache_meta(node, Operand::Input(input));
        (meta.cm_action, meta.mcid)
    }

    const NOP: (CacheMaintenanceAction, u32) = (CacheMaintenanceAction::Nop, 0);

    fn degrade(mcid: u32) -> (CacheMaintenanceAction, u32) {
        (CacheMaintenanceAction::Degrade, mcid)
    }

    #[test]
    fn test_no_alloc_directive_when_no_cache_required() {
        let mut bundle = chain(1);
        let mut state = BundleCacheState::new(0);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        assert!(ncs.set_directives(&mut bundle, 0, &NotRequired));
        assert_eq!(input_directives(&bundle, 0), vec![NoAllocate]);
        assert_eq!(output_directives(&bundle, 0), vec![NoAllocate]);
    }

    #[test]
    fn test_cache_usage_directive_within_budget() {
        let mut bundle = chain(1);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        assert!(ncs.set_directives(&mut bundle, 0, &ConstCap::yielding(20, 20)));
        assert_eq!(input_directives(&bundle, 0), vec![HomeAllocate]);
        assert_eq!(output_directives(&bundle, 0), vec![HomeAllocate]);
        assert_eq!(ncs.cache_state().total_live(), 40);
    }

    #[test]
    fn test_no_alloc_when_exceeding_budget() {
        let mut bundle = chain(1);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        assert!(!ncs.set_directives(&mut bundle, 0, &ConstCap::yielding(120, 120)));
        assert_eq!(input_directives(&bundle, 0), vec![NoAllocate]);
        assert_eq!(output_directives(&bundle, 0), vec![NoAllocate]);
    }

    #[test]
    fn test_operands_within_budget_are_cached_input_exceeds() {
        let mut bundle = chain(1);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        assert!(!ncs.set_directives(&mut bundle, 0, &ConstCap::yielding(120, 80)));
        assert_eq!(input_directives(&bundle, 0), vec![NoAllocate]);
        assert_eq!(output_directives(&bundle, 0), vec![HomeAllocate]);
    }

    #[test]
    fn test_operands_within_budget_are_cached_output_exceeds() {
        let mut bundle = chain(1);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        assert!(!ncs.set_directives(&mut bundle, 0, &ConstCap::yielding(60, 120)));
        assert_eq!(input_directives(&bundle, 0), vec![HomeAllocate]);
        assert_eq!(output_directives(&bundle, 0), vec![NoAllocate]);
    }

    #[test]
    fn test_outputs_are_allocated_before_inputs() {
        let mut bundle = chain(1);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        // Either operand fits alone, the output wins
        assert!(!ncs.set_directives(&mut bundle, 0, &ConstCap::yielding(60, 60)));
        assert_eq!(output_directives(&bundle, 0), vec![HomeAllocate]);
        assert_eq!(input_directives(&bundle, 0), vec![NoAllocate]);
    }

    #[test]
    fn test_assignments_limited_to_budget() {
        // [in0, in1]->n->[out]
        let mut bundle = single(2, 1);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        // The first input is only released after all operands were allocated
        assert!(!ncs.set_directives(&mut bundle, 0, &ConstCap::releasing(40, 40)));
        assert_eq!(input_directives(&bundle, 0), vec![HomeAllocate, NoAllocate]);
        assert_eq!(output_directives(&bundle, 0), vec![HomeAllocate]);
        // The uncached input got no maintenance instruction
        assert_eq!(input_cm(&bundle, 0, 0), degrade(1));
        assert_eq!(input_cm(&bundle, 0, 1), NOP);
    }

    #[test]
    fn test_uncached_tensors_are_not_released() {
        // [in0, in1, in2, in3]->n->[out0, out1, out2]
        let mut bundle = single(4, 3);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        let alloc_d = RequirementDetails::alloc_d(10).releasing(ReleaseType::DegradeCme);
        let alloc_h = RequirementDetails::alloc_h(10);
        let alloc_dh = RequirementDetails::alloc_dh(10).with_release(ReleaseType::DegradeClass);
        let no_alloc = RequirementDetails::no_alloc();
        let analyzer = Mapped::new(&[alloc_d, alloc_h, alloc_dh, no_alloc], &[alloc_d, alloc_h, no_alloc]);

        assert!(ncs.set_directives(&mut bundle, 0, &analyzer));

        let node = bundle.node(0);
        assert_eq!(
            input_directives(&bundle, 0),
            vec![DcoreAllocate, HomeAllocate, SharedAllocate, NoAllocate]
        );
        assert_eq!(input_cm(&bundle, 0, 0), degrade(2));
        assert_eq!(node.inputs_cache_meta[0].cache_class, CacheClass::High);
        assert_eq!(input_cm(&bundle, 0, 1), NOP);
        assert_eq!(node.inputs_cache_meta[1].cache_class, CacheClass::High);
        // Class degrade is only a release recipe here, nothing is released
        assert_eq!(input_cm(&bundle, 0, 2), NOP);
        assert_eq!(node.inputs_cache_meta[2].cache_class, CacheClass::High);
        assert_eq!(input_cm(&bundle, 0, 3), NOP);
        assert_eq!(node.inputs_cache_meta[3].cache_class, CacheClass::Normal);

        assert_eq!(output_directives(&bundle, 0), vec![DcoreAllocate, HomeAllocate, NoAllocate]);
        let out = &node.outputs_cache_meta;
        assert_eq!((out[0].cm_action, out[0].mcid), degrade(1));
        assert_eq!(out[0].cache_class, CacheClass::High);
        assert_eq!((out[1].cm_action, out[1].mcid), NOP);
        assert_eq!(out[1].cache_class, CacheClass::High);
        assert_eq!(out[2].cm_action, CacheMaintenanceAction::Nop);
        assert_eq!(ncs.maintenance_instructions(), 2);
    }

    #[test]
    fn test_reuse_dead_tensors_budget() {
        let mut bundle = chain(2);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());
        let analyzer = ConstCap::releasing(40, 40);

        assert!(ncs.set_directives(&mut bundle, 0, &analyzer));
        assert!(ncs.set_directives(&mut bundle, 1, &analyzer));
        assert_eq!(input_directives(&bundle, 1), vec![HomeAllocate]);
        assert_eq!(output_directives(&bundle, 1), vec![HomeAllocate]);

        assert_eq!(input_cm(&bundle, 0, 0), degrade(1));
        assert_eq!(input_cm(&bundle, 1, 0), degrade(2));
        // n0 already precedes n1 through t1
        assert!(ncs.inserted_edges().is_empty());
    }

    #[test]
    fn test_multiple_views_of_a_tensor_are_released_once() {
        // [t0]->n0->[t1]->n1->[t2]->n2->[t3], t2 a view of t1 and t1 also read by n2
        let mut bundle = Bundle::new();
        let t0 = bundle.add_tensor("t0", 0);
        let t1 = bundle.add_tensor("t1", 0);
        let t2 = bundle.add_alias("t2", 0, t1);
        let t3 = bundle.add_tensor("t3", 0);
        bundle.add_node("n0", TPC, vec![t0], vec![t1]);
        bundle.add_node("n1", TPC, vec![t1], vec![t2]);
        bundle.add_node("n2", TPC, vec![t2, t1], vec![t3]);

        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        assert!(ncs.set_directives(&mut bundle, 2, &ConstCap::releasing(20, 80)));
        assert_eq!(input_directives(&bundle, 2), vec![HomeAllocate, HomeAllocate]);
        assert_eq!(output_directives(&bundle, 2), vec![HomeAllocate]);
        // Both views carry a maintenance instruction, the entry is released once
        assert_eq!(input_cm(&bundle, 2, 0), degrade(1));
        assert_eq!(input_cm(&bundle, 2, 1), degrade(2));
        assert!(ncs.cache_state().is_reclaim_candidate(bundle.cache_key(t1)));
        assert_eq!(ncs.cache_state().total_live(), 80);
    }

    #[test]
    fn test_reuse_yielded_tensors_budget() {
        let mut bundle = with_lanes(chain(2), &[0, 2]);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        assert!(ncs.set_directives(&mut bundle, 0, &ConstCap::yielding(40, 40)));
        assert_eq!(input_cm(&bundle, 0, 0), NOP);
        assert_eq!(ncs.yield_queue().len(), 1);

        // t0 can be yielded to make room for t2
        assert!(ncs.set_directives(&mut bundle, 1, &ConstCap::releasing(40, 40)));
        assert_eq!(input_directives(&bundle, 1), vec![HomeAllocate]);
        assert_eq!(output_directives(&bundle, 1), vec![HomeAllocate]);

        assert_eq!(input_cm(&bundle, 0, 0), degrade(1));
        assert_eq!(input_cm(&bundle, 1, 0), degrade(2));
        assert!(ncs.yield_queue().is_empty());
    }

    #[test]
    fn test_reuse_multiple_yielded_tensors_budget() {
        // [t0, t4]->n0->[t1]->n1->[t2]->n2->[t3]
        let bundle = graph(5, &[(&[0, 4], &[1]), (&[1], &[2]), (&[2], &[3])]);
        let mut bundle = with_lanes(bundle, &[0, 0, 2]);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        let yielding = ConstCap::yielding(25, 25);
        assert!(ncs.set_directives(&mut bundle, 0, &yielding)); // t0, t4, t1: 75
        assert!(ncs.set_directives(&mut bundle, 1, &yielding)); // t2: 100
        assert_eq!(input_cm(&bundle, 0, 0), NOP);
        assert_eq!(input_cm(&bundle, 0, 1), NOP);
        assert_eq!(input_cm(&bundle, 1, 0), NOP);

        // t3 needs all of t0, t4 and t1
        assert!(ncs.set_directives(&mut bundle, 2, &ConstCap::releasing(25, 75)));
        assert_eq!(input_cm(&bundle, 0, 0), degrade(1));
        assert_eq!(input_cm(&bundle, 0, 1), degrade(2));
        assert_eq!(input_cm(&bundle, 1, 0), degrade(3));
        assert_eq!(input_cm(&bundle, 2, 0), degrade(4));
    }

    #[test]
    fn test_no_class_or_directive_downgrade_when_not_releasing() {
        let mut bundle = chain(1);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        let analyzer = ConstCap::new(20, 30, false, ReleaseType::DegradeClass);
        assert!(ncs.set_directives(&mut bundle, 0, &analyzer));
        assert_eq!(input_directives(&bundle, 0), vec![HomeAllocate]);
        assert_eq!(bundle.node(0).inputs_cache_meta[0].cache_class, CacheClass::High);
        assert_eq!(bundle.node(0).outputs_cache_meta[0].cache_class, CacheClass::High);
    }

    #[test]
    fn test_class_and_directive_downgrade_when_releasing() {
        let mut bundle = chain(1);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        let analyzer = ConstCap::new(20, 30, true, ReleaseType::DegradeClass);
        assert!(ncs.set_directives(&mut bundle, 0, &analyzer));
        assert_eq!(bundle.node(0).inputs_cache_meta[0].cache_class, CacheClass::Low);
        assert_eq!(bundle.node(0).outputs_cache_meta[0].cache_class, CacheClass::High);
        assert_eq!(input_directives(&bundle, 0), vec![NoAllocate]);
        assert_eq!(input_cm(&bundle, 0, 0), NOP);
        assert_eq!(ncs.maintenance_instructions(), 0);
    }

    #[test]
    fn test_class_and_directive_downgrade_when_yielding() {
        let mut bundle = with_lanes(chain(2), &[0, 2]);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        let yielding = ConstCap::new(40, 40, false, ReleaseType::DegradeClass);
        assert!(ncs.set_directives(&mut bundle, 0, &yielding));
        assert_eq!(input_cm(&bundle, 0, 0), NOP);
        assert_eq!(bundle.node(0).inputs_cache_meta[0].cache_class, CacheClass::High);

        assert!(ncs.set_directives(&mut bundle, 1, &ConstCap::releasing(40, 40)));
        assert_eq!(input_directives(&bundle, 1), vec![HomeAllocate]);
        assert_eq!(output_directives(&bundle, 1), vec![HomeAllocate]);

        let yielded = bundle.cache_meta(0, Operand::Input(0));
        assert_eq!((yielded.cm_action, yielded.mcid), NOP);
        assert_eq!(yielded.cache_class, CacheClass::Low);
        assert_eq!(yielded.cache_directive, NoAllocate);

        assert_eq!(input_cm(&bundle, 1, 0), degrade(1));
        assert_eq!(bundle.node(1).inputs_cache_meta[0].cache_class, CacheClass::High);
    }

    #[test]
    fn test_no_yield_when_it_would_not_help() {
        let mut bundle = with_lanes(chain(2), &[0, 2]);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        assert!(ncs.set_directives(&mut bundle, 0, &ConstCap::yielding(40, 40)));

        // Yielding t0 frees 40 bytes, t2 misses 50
        assert!(!ncs.set_directives(&mut bundle, 1, &ConstCap::releasing(30, 70)));
        assert_eq!(input_cm(&bundle, 0, 0), NOP);
        assert!(ncs.cache_state().is_cached(0));
        assert!(ncs.yield_queue().get(0).is_some());
        assert_eq!(output_directives(&bundle, 1), vec![NoAllocate]);
    }

    /// n0 keeps t0 alive for later reuse, n1 rewrites t0 at `rewrite_cap` and
    /// keeps t2 (20 bytes), n2 reads t2 and writes t3
    fn plan_resized_candidate(
        ncs: &mut NodeCacheSetter<'_>,
        bundle: &mut Bundle,
        read_cap: Capacity,
        rewrite_cap: Capacity,
    ) {
        let no_alloc = RequirementDetails::no_alloc();
        let read = RequirementDetails::alloc_h(read_cap).with_release(ReleaseType::DegradeCme);
        assert!(ncs.set_directives(bundle, 0, &Mapped::new(&[read], &[no_alloc])));
        assert_eq!(ncs.yield_queue().get(0).map(|c| c.capacity()), Some(read_cap));

        let rewrite = Mapped::new(
            &[no_alloc],
            &[RequirementDetails::alloc_d(rewrite_cap), RequirementDetails::alloc_h(20)],
        );
        assert!(ncs.set_directives(bundle, 1, &rewrite));
        assert_eq!(ncs.cache_state().capacity(0), rewrite_cap);
    }

    fn resized_candidate_bundle() -> Bundle {
        // [t0]->n0->[t1]->n1->[t0, t2]->n2->[t3]
        let bundle = graph(4, &[(&[0], &[1]), (&[1], &[0, 2]), (&[2], &[3])]);
        with_lanes(bundle, &[0, 1, 2])
    }

    #[test]
    fn test_yield_sized_by_shrunk_entry() {
        let mut bundle = resized_candidate_bundle();
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());
        plan_resized_candidate(&mut ncs, &mut bundle, 60, 10);

        // 30 bytes missing, t0 only holds 10 of its original 60
        let write = Mapped::new(&[RequirementDetails::no_alloc()], &[RequirementDetails::alloc_h(100)]);
        assert!(!ncs.set_directives(&mut bundle, 2, &write));
        assert_eq!(output_directives(&bundle, 2), vec![NoAllocate]);
        assert_eq!(input_cm(&bundle, 0, 0), NOP);
        assert!(ncs.cache_state().is_cached(0));
        assert!(ncs.yield_queue().get(0).is_some());
        assert_eq!(ncs.cache_state().total_live(), 30);
    }

    #[test]
    fn test_yield_sized_by_grown_entry() {
        let mut bundle = resized_candidate_bundle();
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());
        plan_resized_candidate(&mut ncs, &mut bundle, 10, 60);

        // 40 bytes missing, t0 grew from 10 to 60
        let write = Mapped::new(&[RequirementDetails::no_alloc()], &[RequirementDetails::alloc_h(60)]);
        assert!(ncs.set_directives(&mut bundle, 2, &write));
        assert_eq!(output_directives(&bundle, 2), vec![HomeAllocate]);
        assert_eq!(input_cm(&bundle, 0, 0), degrade(1));
        assert!(!ncs.cache_state().is_cached(0));
        assert!(ncs.yield_queue().is_empty());
        assert_eq!(ncs.cache_state().total_live(), 80);
    }

    /// n0 keeps t0 (50 bytes) alive for later reuse, n1 reads and releases it
    fn plan_reread_input(output_cap: Capacity) -> (bool, Bundle, BundleCacheState) {
        // [t0]->n0->[t1], [t0]->n1->[t2]
        let bundle = graph(3, &[(&[0], &[1]), (&[0], &[2])]);
        let mut bundle = with_lanes(bundle, &[0, 2]);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        let no_alloc = RequirementDetails::no_alloc();
        let keep = RequirementDetails::alloc_h(50).with_release(ReleaseType::DegradeCme);
        assert!(ncs.set_directives(&mut bundle, 0, &Mapped::new(&[keep], &[no_alloc])));
        assert!(ncs.yield_queue().get(0).is_some());

        let reread = Mapped::new(
            &[RequirementDetails::alloc_h(50).releasing(ReleaseType::DegradeCme)],
            &[RequirementDetails::alloc_h(output_cap)],
        );
        let ok = ncs.set_directives(&mut bundle, 1, &reread);
        assert!(ncs.inserted_edges().is_empty());
        (ok, bundle, state)
    }

    #[test]
    fn test_output_does_not_yield_own_input() {
        // t0 is far enough behind to be yielded, but n1 still reads it
        let (ok, bundle, state) = plan_reread_input(60);
        assert!(!ok);
        assert_eq!(output_directives(&bundle, 1), vec![NoAllocate]);
        assert_eq!(input_directives(&bundle, 1), vec![HomeAllocate]);
        assert_eq!(input_cm(&bundle, 1, 0), degrade(1));

        // n0's access was left untouched
        assert_eq!(input_directives(&bundle, 0), vec![HomeAllocate]);
        assert_eq!(input_cm(&bundle, 0, 0), NOP);
        assert!(state.is_reclaim_candidate(0));
        assert_eq!(state.total_live(), 0);
    }

    #[test]
    fn test_output_reserved_next_to_own_released_input() {
        // The output needs exactly the space t0 gives up after n1
        let (ok, bundle, state) = plan_reread_input(50);
        assert!(ok);
        assert_eq!(output_directives(&bundle, 1), vec![HomeAllocate]);
        assert_eq!(input_directives(&bundle, 1), vec![HomeAllocate]);
        assert_eq!(input_cm(&bundle, 1, 0), degrade(1));
        assert_eq!(input_cm(&bundle, 0, 0), NOP);

        // Both were resident during n1, t0 only released afterwards
        assert_eq!(state.max_live_capacity(), 100);
        assert!(state.is_reclaim_candidate(0));
        assert_eq!(state.capacity(0), 50);
        assert_eq!(state.total_live(), 50);
    }

    #[test]
    fn test_no_reuse_of_yielded_budget_from_recent_lanes() {
        let mut bundle = with_lanes(chain(4), &[0, 1, 2, 2]);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        let analyzer = ConstCap::yielding(25, 25);
        assert!(ncs.set_directives(&mut bundle, 0, &analyzer)); // t0, t1: 50
        assert!(ncs.set_directives(&mut bundle, 1, &analyzer)); // t2: 75
        assert!(ncs.set_directives(&mut bundle, 2, &analyzer)); // t3: 100

        // Only t0 (lane 0) is far enough behind lane 2 and it is too small for 30 bytes
        assert!(!ncs.set_directives(&mut bundle, 3, &ConstCap::yielding(25, 30)));
        assert_eq!(input_cm(&bundle, 0, 0), NOP);

        // 25 bytes are enough
        assert!(ncs.set_directives(&mut bundle, 3, &ConstCap::yielding(25, 25)));
        assert_eq!(input_directives(&bundle, 3), vec![HomeAllocate]);
        assert_eq!(output_directives(&bundle, 3), vec![HomeAllocate]);
        assert_eq!(input_cm(&bundle, 0, 0), degrade(1));
    }

    #[test]
    fn test_yield_candidates_across_lanes() {
        // [t0]->n0->[t1]->n1->[t2]->n2->[t3]    n3 reads t1 and t0 again
        let bundle = graph(5, &[(&[0], &[1]), (&[1], &[2]), (&[2], &[3]), (&[1, 0], &[4])]);
        let mut bundle = with_lanes(bundle, &[1, 0, 3, 3]);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        assert!(ncs.set_directives(&mut bundle, 0, &ConstCap::yielding(50, 10))); // t0 yieldable from lane 1
        assert!(ncs.set_directives(&mut bundle, 1, &ConstCap::yielding(10, 10))); // t1 yieldable from lane 0
        assert!(ncs.set_directives(&mut bundle, 2, &ConstCap::yielding(10, 50))); // t3 takes t0's budget
        assert_eq!(input_cm(&bundle, 0, 0), degrade(1));
        assert_eq!(input_cm(&bundle, 1, 0), NOP);
        assert!(ncs.cache_state().is_cached(1));

        // t1 is still alive, t0 is allocated again
        assert!(ncs.set_directives(&mut bundle, 3, &ConstCap::yielding(10, 20)));
        assert_eq!(ncs.cache_state().total_live(), 100);
        assert_eq!(ncs.cache_state().capacity(0), 10);
    }

    #[test]
    fn test_revive_released_tensor() {
        // t0 released by n0 and cached again by n1
        let mut bundle = graph(3, &[(&[0], &[1]), (&[0], &[2])]);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        let no_alloc = RequirementDetails::no_alloc();
        let release = Mapped::new(&[RequirementDetails::alloc_h(30).releasing(ReleaseType::DegradeCme)], &[no_alloc]);
        assert!(ncs.set_directives(&mut bundle, 0, &release));
        assert!(ncs.cache_state().is_reclaim_candidate(0));

        let cache = Mapped::new(&[RequirementDetails::alloc_h(30)], &[no_alloc]);
        assert!(ncs.set_directives(&mut bundle, 1, &cache));
        assert!(ncs.cache_state().is_cached(0));
        assert_eq!(ncs.cache_state().total_occupied(), 30);
        // The dead entry's accessor must complete before its lines are reused
        assert_eq!(ncs.inserted_edges(), &[ControlEdge { from: 0, to: 1 }]);
    }

    /// [t0]->n0->[t1]->n1->[t2], and n2 reads t0 instead of t2
    fn reclaim_dependency_bundle() -> Bundle {
        graph(4, &[(&[0], &[1]), (&[1], &[2]), (&[0], &[3])])
    }

    fn plan_reclaim_dependency(bundle: &mut Bundle, config: &CachePlannerConfig) -> Vec<ControlEdge> {
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, config);

        assert!(ncs.set_directives(bundle, 0, &ConstCap::yielding(20, 20)));
        assert!(ncs.set_directives(bundle, 1, &ConstCap::releasing(20, 20)));
        // t1 was released by n1, t3 needs its budget
        assert!(ncs.set_directives(bundle, 2, &ConstCap::releasing(20, 50)));
        ncs.inserted_edges().to_vec()
    }

    #[test]
    fn test_dependency_when_reusing_reclaimed_budget() {
        let mut bundle = reclaim_dependency_bundle();
        assert!(!bundle.is_ancestor(1, 2));

        let edges = plan_reclaim_dependency(&mut bundle, &CachePlannerConfig::default());
        assert!(bundle.is_ancestor(1, 2));
        assert_eq!(edges, vec![ControlEdge { from: 0, to: 2 }, ControlEdge { from: 1, to: 2 }]);
    }

    #[test]
    fn test_dependency_policy_modes() {
        let mut bundle = reclaim_dependency_bundle();
        let config = CachePlannerConfig::default()
            .with_thrashing_prevention_mode(ThrashingPreventionMode::Disabled);
        assert!(plan_reclaim_dependency(&mut bundle, &config).is_empty());
        assert!(!bundle.is_ancestor(1, 2));

        // All operations run on the same engine
        let mut bundle = reclaim_dependency_bundle();
        let config = CachePlannerConfig::default()
            .with_thrashing_prevention_mode(ThrashingPreventionMode::SkipSameEngine);
        assert!(plan_reclaim_dependency(&mut bundle, &config).is_empty());
    }

    #[test]
    fn test_max_cache_usage() {
        let mut bundle = chain(3);
        let mut state = BundleCacheState::new(96 * MB);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        let analyzer = ConstCap::yielding(MB, MB);
        for node in 0..3 {
            assert!(ncs.set_directives(&mut bundle, node, &analyzer));
        }
        // A chain has one more tensor than operations
        assert_eq!(ncs.cache_state().max_live_capacity(), 4 * MB);
    }

    #[test]
    fn test_steady_state() {
        let mut bundle = chain(13);
        let mut state = BundleCacheState::new(96 * MB);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        let (read, write) = (20 * MB, 5 * MB);
        let analyzer = ConstCap::releasing(read, write);
        for node in 0..13 {
            assert!(ncs.set_directives(&mut bundle, node, &analyzer));
            // A single input and a single output are alive at any time
            assert_eq!(ncs.cache_state().max_live_capacity(), read + write, "node {node}");
        }
    }

    #[test]
    fn test_release_separately_from_caching() {
        // [t0]->n0->[t1]->n1->[t2], and n1 also reads t0
        let mut bundle = graph(3, &[(&[0], &[1]), (&[1, 0], &[2])]);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        assert!(ncs.set_directives(&mut bundle, 0, &ConstCap::yielding(10, 10)));
        assert!(ncs.cache_state().is_cached(0));
        assert!(ncs.cache_state().is_cached(1));
        assert_eq!(ncs.cache_state().total_live(), 20);

        let release_only = RequirementDetails::no_alloc().releasing(ReleaseType::DegradeCme);
        let analyzer = Mapped::new(&[release_only, release_only], &[release_only]);
        assert!(ncs.set_directives(&mut bundle, 1, &analyzer));
        assert!(!ncs.cache_state().is_cached(0));
        assert!(!ncs.cache_state().is_cached(1));
        assert_eq!(ncs.cache_state().total_live(), 0);
        assert_eq!(input_cm(&bundle, 1, 0), degrade(1));
        assert_eq!(input_cm(&bundle, 1, 1), degrade(2));
        assert_eq!(bundle.node(1).outputs_cache_meta[0].cm_action, CacheMaintenanceAction::Nop);
    }

    #[test]
    fn test_logical_operations_are_skipped() {
        let mut bundle = Bundle::new();
        let t0 = bundle.add_tensor("t0", 0);
        let t1 = bundle.add_alias("t1", 0, t0);
        bundle.add_node("reshape", NodeKind::Logical, vec![t0], vec![t1]);

        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());
        assert!(ncs.set_directives(&mut bundle, 0, &ConstCap::releasing(10, 10)));
        assert_eq!(input_directives(&bundle, 0), vec![NoAllocate]);
        assert_eq!(ncs.cache_state().total_occupied(), 0);
    }

    #[test]
    fn test_no_yielding_when_disabled() {
        let mut bundle = with_lanes(chain(2), &[0, 2]);
        let mut state = BundleCacheState::new(100);
        let config = CachePlannerConfig::default().with_yielding(false);
        let mut ncs = NodeCacheSetter::new(&mut state, &config);

        assert!(ncs.set_directives(&mut bundle, 0, &ConstCap::yielding(40, 40)));
        assert!(!ncs.set_directives(&mut bundle, 1, &ConstCap::releasing(40, 40)));
        assert_eq!(input_cm(&bundle, 0, 0), NOP);
    }

    #[test]
    fn test_no_yield_candidates_without_lanes() {
        let mut bundle = chain(2);
        let mut state = BundleCacheState::new(100);
        let mut ncs = NodeCacheSetter::new(&mut state, &CachePlannerConfig::default());

        assert!(ncs.set_directives(&mut bundle, 0, &ConstCap::yielding(40, 40)));
        assert!(ncs.yield_queue().is_empty());
        assert!(!ncs.set_directives(&mut bundle, 1, &ConstCap::releasing(40, 40)));
    }
}
