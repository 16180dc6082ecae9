//! Yield candidate queue
//!
//! Keeps the cached inputs that are still alive after their access and could
//! be given up retroactively when a later allocation runs short. Candidates are
//! ordered so that the oldest, smallest buffers are yielded first.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use bundle_cache::{CacheKey, Capacity, RequirementDetails};
use tracing::{trace, warn};

/// Schedule position of an operation within its bundle
pub type NodeIndex = usize;

/// Pipeline lane (thread index) an operation runs in
pub type PipelineLane = u32;

/// A cached input that may be released before its natural last use
///
/// Candidates are ordered by node index, then capacity, then key (all
/// ascending), which is the order they are yielded in.
#[derive(Debug, Clone, Copy)]
pub struct YieldCandidate {
    pub key: CacheKey,

    /// Operation whose input access registered the candidate
    pub node_idx: NodeIndex,

    pub lane: PipelineLane,

    /// Input operand of `node_idx` whose metadata receives the release policy
    pub input_idx: usize,

    pub requirement: RequirementDetails,
}

impl YieldCandidate {
    /// Capacity requested by the registering access
    pub fn capacity(&self) -> Capacity {
        self.requirement.capacity
    }

    fn priority(&self) -> (NodeIndex, Capacity, CacheKey) {
        (self.node_idx, self.capacity(), self.key)
    }
}

impl PartialEq for YieldCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.priority() == other.priority()
    }
}

impl Eq for YieldCandidate {}

impl PartialOrd for YieldCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for YieldCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority().cmp(&other.priority())
    }
}

/// Returns true if a candidate registered in `candidate_lane` is at least
/// `depth` lanes behind `current_lane`, so its users can no longer be in flight.
pub fn is_beyond_pipeline(
    candidate_lane: PipelineLane,
    current_lane: PipelineLane,
    depth: u32,
) -> bool {
    candidate_lane.saturating_add(depth) <= current_lane
}

/// Candidates eligible for yielding, in yield order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct YieldingOptions {
    /// Sum of the candidates' capacities
    pub capacity: Capacity,
    pub keys: Vec<CacheKey>,
    capacities: Vec<Capacity>,
}

impl YieldingOptions {
    /// Shortest prefix of the options whose capacity covers `missing`
    ///
    /// Returns `None` when even yielding every option would not be enough.
    pub fn select(&self, missing: Capacity) -> Option<&[CacheKey]> {
        if missing <= 0 {
            return Some(&[]);
        }
        if self.capacity < missing {
            return None;
        }

        let mut covered: Capacity = 0;
        for (count, capacity) in self.capacities.iter().enumerate() {
            covered += capacity;
            if covered >= missing {
                return Some(&self.keys[..=count]);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Priority queue of yield candidates, at most one per cache key
#[derive(Debug, Default)]
pub struct YieldQueue {
    ordered: BTreeSet<YieldCandidate>,
    by_key: HashMap<CacheKey, YieldCandidate>,
}

impl YieldQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the candidate for `key`
    ///
    /// Returns false, and registers nothing, when the operation's pipeline
    /// lane is unknown: without it the candidate can never be proven safe.
    pub fn add_candidate(
        &mut self,
        node_idx: NodeIndex,
        lane: Option<PipelineLane>,
        key: CacheKey,
        input_idx: usize,
        requirement: RequirementDetails,
    ) -> bool {
        let Some(lane) = lane else {
            warn!(node = node_idx, key, "operation has no pipeline lane, not registering yield candidate");
            return false;
        };

        self.erase(key);
        let candidate = YieldCandidate {
            key,
            node_idx,
            lane,
            input_idx,
            requirement,
        };
        trace!(node = node_idx, key, capacity = candidate.capacity(), "registered yield candidate");
        self.ordered.insert(candidate);
        self.by_key.insert(key, candidate);
        true
    }

    /// Candidates accepted by `capacity_of`, in yield order
    ///
    /// `capacity_of` returns the capacity a candidate currently holds, or
    /// `None` if it must not be yielded. Entries may have been resized since
    /// their candidate was registered, so options are ordered and summed by
    /// the returned capacity.
    pub fn yielding_options<F>(&self, capacity_of: F) -> YieldingOptions
    where
        F: Fn(&YieldCandidate) -> Option<Capacity>,
    {
        let mut eligible: Vec<(NodeIndex, Capacity, CacheKey)> = self
            .ordered
            .iter()
            .filter_map(|c| capacity_of(c).map(|capacity| (c.node_idx, capacity, c.key)))
            .collect();
        eligible.sort_unstable();

        let mut options = YieldingOptions::default();
        for (_, capacity, key) in eligible {
            options.capacity += capacity;
            options.keys.push(key);
            options.capacities.push(capacity);
        }
        options
    }

    /// Drop the candidate for `key`, returning it if there was one
    pub fn erase(&mut self, key: CacheKey) -> Option<YieldCandidate> {
        let candidate = self.by_key.remove(&key)?;
        self.ordered.remove(&candidate);
        Some(candidate)
    }

    pub fn get(&self, key: CacheKey) -> Option<&YieldCandidate> {
        self.by_key.get(&key)
    }

    /// All candidates in yield order
    pub fn candidates(&self) -> impl Iterator<Item = &YieldCandidate> {
        self.ordered.iter()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
