//! Cache requirement analysis
//!
//! Maps the access profile of every operand to a caching decision. The
//! decision is a pure function of the profile, the device topology and the
//! configured all-required size threshold.

use bundle_cache::{CachePlannerConfig, CacheClass, Capacity, ReleaseType, RequirementDetails};
use bundle_cache_scheduler::NodeIndex;
use tracing::{debug, trace};

use crate::bundle::{Bundle, Operand};
use crate::profile::{AccessProfileSource, AccessStats, InputAccessProfile, OutputAccessProfile};

/// Strategy deciding the caching requirement of each operand access
pub trait CacheRequirementsAnalyzer {
    fn input_requirement(&self, bundle: &Bundle, node: NodeIndex, input: usize)
        -> RequirementDetails;

    fn output_requirement(
        &self,
        bundle: &Bundle,
        node: NodeIndex,
        output: usize,
    ) -> RequirementDetails;
}

/// Cache-relevant shape of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTopology {
    /// Accelerator cores sharing the cache
    pub num_dcores: u32,
}

impl DeviceTopology {
    pub fn new(num_dcores: u32) -> Self {
        Self {
            num_dcores: num_dcores.max(1),
        }
    }
}

impl Default for DeviceTopology {
    fn default() -> Self {
        Self::new(CachePlannerConfig::default().num_dcores)
    }
}

/// Requirement analyzer driven by operand access profiles
#[derive(Debug, Clone)]
pub struct ProfileRequirementsAnalyzer<S> {
    source: S,
    topology: DeviceTopology,
    all_required_size_threshold: u64,
}

impl<S: AccessProfileSource> ProfileRequirementsAnalyzer<S> {
    pub fn new(source: S, config: &CachePlannerConfig) -> Self {
        Self {
            source,
            topology: DeviceTopology::new(config.num_dcores),
            all_required_size_threshold: config.all_required_size_threshold,
        }
    }

    pub fn with_topology(mut self, topology: DeviceTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Caching decision for an input access
    pub fn decide_input(&self, profile: &InputAccessProfile) -> RequirementDetails {
        let requirement = if profile.all_required && profile.size > self.all_required_size_threshold
        {
            RequirementDetails::no_alloc()
        } else {
            self.allocation(profile.size, &profile.access, profile.localized)
        };

        let release = if profile.boundary && !profile.retained_after_bundle {
            ReleaseType::DiscardCme
        } else if profile.num_consumers == 1 {
            ReleaseType::DegradeClass
        } else {
            ReleaseType::DegradeCme
        };

        if profile.last_consumer {
            // Released even when not cached here: an earlier access may have cached it
            requirement.releasing(release)
        } else if requirement.is_caching_required() {
            requirement.with_release(release)
        } else {
            requirement
        }
    }

    /// Caching decision for an output access
    pub fn decide_output(&self, profile: &OutputAccessProfile) -> RequirementDetails {
        if profile.rmw {
            let requirement =
                RequirementDetails::alloc_d(to_capacity(profile.size)).with_class(CacheClass::Top);
            return if profile.last_rmw_writer && !profile.has_consumer {
                requirement.releasing(ReleaseType::DegradeCme)
            } else {
                requirement
            };
        }

        if !profile.has_consumer {
            return RequirementDetails::no_alloc();
        }
        self.allocation(profile.size, &profile.consumer_access, profile.localized)
    }

    fn allocation(&self, size: u64, access: &AccessStats, localized: bool) -> RequirementDetails {
        let shared = access.is_shared();
        let capacity = to_capacity(size);

        if access.total_reads <= 1 && !shared {
            RequirementDetails::no_alloc()
        } else if localized {
            RequirementDetails::alloc_d(capacity)
        } else if shared && access.reads_per_core <= 1 {
            RequirementDetails::alloc_h(capacity)
        } else if !shared {
            RequirementDetails::alloc_d(capacity)
        } else {
            // One replica per core
            RequirementDetails::alloc_dh(capacity.saturating_mul(Capacity::from(self.topology.num_dcores)))
        }
    }
}

impl<S: AccessProfileSource> CacheRequirementsAnalyzer for ProfileRequirementsAnalyzer<S> {
    fn input_requirement(
        &self,
        bundle: &Bundle,
        node: NodeIndex,
        input: usize,
    ) -> RequirementDetails {
        match self.source.input_profile(bundle, node, input) {
            Some(mut profile) => {
                if profile.size == 0 {
                    profile.size = operand_size(bundle, node, Operand::Input(input));
                }
                let requirement = self.decide_input(&profile);
                trace!(node, input, ?requirement, "input cache requirement");
                requirement
            }
            None => {
                debug!(node, input, "no access profile for input, not caching");
                RequirementDetails::no_alloc()
            }
        }
    }

    fn output_requirement(
        &self,
        bundle: &Bundle,
        node: NodeIndex,
        output: usize,
    ) -> RequirementDetails {
        match self.source.output_profile(bundle, node, output) {
            Some(mut profile) => {
                if profile.size == 0 {
                    profile.size = operand_size(bundle, node, Operand::Output(output));
                }
                let requirement = self.decide_output(&profile);
                trace!(node, output, ?requirement, "output cache requirement");
                requirement
            }
            None => {
                debug!(node, output, "no access profile for output, not caching");
                RequirementDetails::no_alloc()
            }
        }
    }
}

/// Size of the real tensor behind an operand, which is what gets cached
fn operand_size(bundle: &Bundle, node: NodeIndex, operand: Operand) -> u64 {
    let tensor = bundle.real_tensor(bundle.operand_tensor(node, operand));
    bundle.tensor(tensor).size
}

fn to_capacity(size: u64) -> Capacity {
    Capacity::try_from(size).unwrap_or(Capacity::MAX)
}
