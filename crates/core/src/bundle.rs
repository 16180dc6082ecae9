//! Minimal bundle model
//!
//! A bundle is a scheduled sequence of operations sharing one cache budget.
//! Operations are identified by their schedule position. Tensors may be views
//! (aliases) of other tensors, in which case they share the cache entry of the
//! real tensor they resolve to.

use std::collections::{HashMap, HashSet, VecDeque};

use bundle_cache::{CacheKey, CacheMetaData};
use bundle_cache_scheduler::{NodeIndex, PipelineLane};
use serde::{Deserialize, Serialize};

/// Index of a tensor within its bundle
pub type TensorId = usize;

/// Execution engine of a compute operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Engine {
    Mme,
    Tpc,
    Dma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Compute(Engine),
    /// Reshapes, views and other operations that never touch memory
    Logical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tensor {
    pub name: String,
    /// Size in bytes
    pub size: u64,
    alias_of: Option<TensorId>,
}

impl Tensor {
    /// Tensor this one is a view of, if any
    pub fn alias_of(&self) -> Option<TensorId> {
        self.alias_of
    }
}

/// A scheduled operation and the cache metadata of its operands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    /// Pipeline lane, unknown until the bundle is sliced into lanes
    pub lane: Option<PipelineLane>,
    pub inputs_cache_meta: Vec<CacheMetaData>,
    pub outputs_cache_meta: Vec<CacheMetaData>,
}

impl Node {
    pub fn is_logical(&self) -> bool {
        self.kind == NodeKind::Logical
    }

    pub fn engine(&self) -> Option<Engine> {
        match self.kind {
            NodeKind::Compute(engine) => Some(engine),
            NodeKind::Logical => None,
        }
    }
}

/// Operand of a node: input or output at the given position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Input(usize),
    Output(usize),
}

/// Ordering edge added between two operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControlEdge {
    pub from: NodeIndex,
    pub to: NodeIndex,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bundle {
    tensors: Vec<Tensor>,
    nodes: Vec<Node>,
    control_edges: Vec<ControlEdge>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tensor(&mut self, name: impl Into<String>, size: u64) -> TensorId {
        self.push_tensor(name.into(), size, None)
    }

    /// Add a view of `real`, sharing its cache entry
    ///
    /// # Panics
    ///
    /// If `real` is not a tensor of this bundle.
    pub fn add_alias(&mut self, name: impl Into<String>, size: u64, real: TensorId) -> TensorId {
        assert!(real < self.tensors.len(), "alias target {real} is not a tensor of the bundle");
        self.push_tensor(name.into(), size, Some(real))
    }

    fn push_tensor(&mut self, name: String, size: u64, alias_of: Option<TensorId>) -> TensorId {
        self.tensors.push(Tensor { name, size, alias_of });
        self.tensors.len() - 1
    }

    /// Append an operation to the schedule
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> NodeIndex {
        let node = Node {
            name: name.into(),
            kind,
            inputs_cache_meta: vec![CacheMetaData::default(); inputs.len()],
            outputs_cache_meta: vec![CacheMetaData::default(); outputs.len()],
            inputs,
            outputs,
            lane: None,
        };
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn set_lane(&mut self, node: NodeIndex, lane: PipelineLane) {
        self.nodes[node].lane = Some(lane);
    }

    pub fn node(&self, node: NodeIndex) -> &Node {
        &self.nodes[node]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn tensor(&self, tensor: TensorId) -> &Tensor {
        &self.tensors[tensor]
    }

    /// Number of scheduled operations
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Tensor at the end of the alias chain of `tensor`
    pub fn real_tensor(&self, mut tensor: TensorId) -> TensorId {
        while let Some(real) = self.tensors[tensor].alias_of {
            tensor = real;
        }
        tensor
    }

    /// Cache key shared by all views of the same real tensor
    pub fn cache_key(&self, tensor: TensorId) -> CacheKey {
        self.real_tensor(tensor) as CacheKey
    }

    pub fn operand_tensor(&self, node: NodeIndex, operand: Operand) -> TensorId {
        let node = &self.nodes[node];
        match operand {
            Operand::Input(idx) => node.inputs[idx],
            Operand::Output(idx) => node.outputs[idx],
        }
    }

    pub fn cache_meta(&self, node: NodeIndex, operand: Operand) -> &CacheMetaData {
        let node = &self.nodes[node];
        match operand {
            Operand::Input(idx) => &node.inputs_cache_meta[idx],
            Operand::Output(idx) => &node.outputs_cache_meta[idx],
        }
    }

    pub fn cache_meta_mut(&mut self, node: NodeIndex, operand: Operand) -> &mut CacheMetaData {
        let node = &mut self.nodes[node];
        match operand {
            Operand::Input(idx) => &mut node.inputs_cache_meta[idx],
            Operand::Output(idx) => &mut node.outputs_cache_meta[idx],
        }
    }

    /// Restore default metadata on every operand of `node`
    pub fn reset_cache_meta(&mut self, node: NodeIndex) {
        let node = &mut self.nodes[node];
        node.inputs_cache_meta = vec![CacheMetaData::default(); node.inputs.len()];
        node.outputs_cache_meta = vec![CacheMetaData::default(); node.outputs.len()];
    }

    /// Record an ordering edge. Returns false if it already exists.
    pub fn add_control_edge(&mut self, from: NodeIndex, to: NodeIndex) -> bool {
        let edge = ControlEdge { from, to };
        if self.control_edges.contains(&edge) {
            return false;
        }
        self.control_edges.push(edge);
        true
    }

    pub fn control_edges(&self) -> &[ControlEdge] {
        &self.control_edges
    }

    /// Returns true if `descendant` is reachable from `ancestor` through data
    /// or control edges.
    pub fn is_ancestor(&self, ancestor: NodeIndex, descendant: NodeIndex) -> bool {
        self.ancestors(descendant).contains(&ancestor)
    }

    /// Every operation `node` transitively depends on
    ///
    /// A data edge leads from a node to every later node reading one of the
    /// real tensors it writes.
    pub fn ancestors(&self, node: NodeIndex) -> HashSet<NodeIndex> {
        let mut writers: HashMap<TensorId, Vec<NodeIndex>> = HashMap::new();
        for (idx, n) in self.nodes.iter().enumerate() {
            for &tensor in &n.outputs {
                writers.entry(self.real_tensor(tensor)).or_default().push(idx);
            }
        }
        let mut controllers: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for edge in &self.control_edges {
            controllers.entry(edge.to).or_default().push(edge.from);
        }

        let mut ancestors = HashSet::new();
        let mut queue = VecDeque::from([node]);
        while let Some(current) = queue.pop_front() {
            let producers = self.nodes[current]
                .inputs
                .iter()
                .filter_map(|&tensor| writers.get(&self.real_tensor(tensor)))
                .flat_map(move |nodes| nodes.iter().copied().filter(move |&w| w < current));
            let controlling = controllers.get(&current).into_iter().flatten().copied();

            for previous in producers.chain(controlling) {
                if ancestors.insert(previous) {
                    queue.push_back(previous);
                }
            }
        }
        ancestors
    }
}
