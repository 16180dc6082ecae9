//! Access profiles of tensor operands
//!
//! Statistical description of how a tensor is accessed across the
//! accelerator cores, produced by the dataflow analysis of the bundle and
//! consumed by the requirement analyzer.

use std::collections::HashMap;

use bundle_cache_scheduler::NodeIndex;
use serde::{Deserialize, Serialize};

use crate::bundle::Bundle;

/// Read statistics of a tensor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessStats {
    /// Chip-wide number of reads
    pub total_reads: u32,
    /// Number of reads by each reading core
    pub reads_per_core: u32,
    pub reading_cores: u32,
}

impl AccessStats {
    pub fn new(total_reads: u32, reads_per_core: u32, reading_cores: u32) -> Self {
        Self {
            total_reads,
            reads_per_core,
            reading_cores,
        }
    }

    /// Read by more than one core
    pub fn is_shared(&self) -> bool {
        self.reading_cores > 1
    }
}

/// Profile of one input access
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputAccessProfile {
    /// Size in bytes, 0 to use the size of the accessed tensor
    pub size: u64,
    pub access: AccessStats,
    /// Operations consuming the tensor
    pub num_consumers: usize,
    /// Same data-parallel partition as the producer
    pub localized: bool,
    /// This access is the tensor's last use in the bundle
    pub last_consumer: bool,
    /// Every core reads the whole tensor
    pub all_required: bool,
    /// Tensor crosses the bundle boundary
    pub boundary: bool,
    /// Still needed after the bundle completes
    pub retained_after_bundle: bool,
}

impl InputAccessProfile {
    pub fn new(size: u64, access: AccessStats) -> Self {
        Self {
            size,
            access,
            num_consumers: 1,
            ..Self::default()
        }
    }
}

/// Profile of one output access
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputAccessProfile {
    /// Size in bytes, 0 to use the size of the accessed tensor
    pub size: u64,
    /// Reads of the output by its consumers
    pub consumer_access: AccessStats,
    pub has_consumer: bool,
    /// Read-modify-write (partial accumulation) output
    pub rmw: bool,
    pub last_rmw_writer: bool,
    pub localized: bool,
}

impl OutputAccessProfile {
    pub fn new(size: u64, consumer_access: AccessStats) -> Self {
        Self {
            size,
            consumer_access,
            has_consumer: consumer_access.total_reads > 0,
            ..Self::default()
        }
    }
}

/// Source of access profiles for the operands of a bundle
pub trait AccessProfileSource {
    fn input_profile(&self, bundle: &Bundle, node: NodeIndex, input: usize)
        -> Option<InputAccessProfile>;

    fn output_profile(
        &self,
        bundle: &Bundle,
        node: NodeIndex,
        output: usize,
    ) -> Option<OutputAccessProfile>;
}

/// Precomputed profiles keyed by operand
#[derive(Debug, Clone, Default)]
pub struct ProfileTable {
    inputs: HashMap<(NodeIndex, usize), InputAccessProfile>,
    outputs: HashMap<(NodeIndex, usize), OutputAccessProfile>,
}

impl ProfileTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_input(&mut self, node: NodeIndex, input: usize, profile: InputAccessProfile) {
        self.inputs.insert((node, input), profile);
    }

    pub fn set_output(&mut self, node: NodeIndex, output: usize, profile: OutputAccessProfile) {
        self.outputs.insert((node, output), profile);
    }

    pub fn len(&self) -> usize {
        self.inputs.len() + self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }
}

impl AccessProfileSource for ProfileTable {
    fn input_profile(
        &self,
        _bundle: &Bundle,
        node: NodeIndex,
        input: usize,
    ) -> Option<InputAccessProfile> {
        self.inputs.get(&(node, input)).copied()
    }

    fn output_profile(
        &self,
        _bundle: &Bundle,
        node: NodeIndex,
        output: usize,
    ) -> Option<OutputAccessProfile> {
        self.outputs.get(&(node, output)).copied()
    }
}
