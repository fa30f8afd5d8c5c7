//! Working memory state of one partition.
//!
//! A session owns one [`PartitionMemory`] per rule base partition. It holds
//! the tuple arena, the per-node memories, the segment and path memories and
//! an outbox of signals for the scheduler. Memories are created lazily: the
//! first propagation that touches a segment creates every path through it,
//! along with those paths' segments and node memories.

use core::hash::BuildHasherDefault;
use std::collections::{BTreeMap, HashMap, VecDeque};

use roaring::RoaringTreemap;
use seahash::SeaHasher;
use tracing::trace;

use crate::accumulate::AccumulationContext;
use crate::agenda::{Activation, MatchKind};
use crate::error::{ReteError, Result};
use crate::fact::FactId;
use crate::network::Network;
use crate::node::{NetworkNode, Node, NodeId, NodeKind, PartitionId, PathId, RuleId, SegmentId};
use crate::segment::{PathMemory, SegmentMemory};
use crate::tuple::{OpKind, PropagationContext, TupleId, TupleKeeper, TupleSets};

pub(crate) type IdMap<K, V> = HashMap<K, V, BuildHasherDefault<SeaHasher>>;

/// Left and right memories of a join, not, exists or accumulate node.
#[derive(Debug, Default)]
pub struct BetaMemory {
    pub left: RoaringTreemap,
    pub right: RoaringTreemap,
    pub staged_right: TupleSets,
    /// Live right tuples, committed or staged.
    pub right_count: usize,
}

#[derive(Debug)]
pub enum NodeMemory {
    Adapter { counter: usize },
    Beta(BetaMemory),
    Accumulate {
        beta: BetaMemory,
        contexts: IdMap<u64, AccumulationContext>,
    },
    Terminal { matches: BTreeMap<u64, Activation> },
    Subnetwork { left: RoaringTreemap },
}

impl NodeMemory {
    fn for_node(node: &Node) -> Result<Self> {
        Ok(match &node.kind {
            NodeKind::Adapter => NodeMemory::Adapter { counter: 0 },
            NodeKind::Join { .. } | NodeKind::Not { .. } | NodeKind::Exists { .. } => NodeMemory::Beta(BetaMemory::default()),
            NodeKind::Accumulate(_) => NodeMemory::Accumulate {
                beta: BetaMemory::default(),
                contexts: IdMap::default(),
            },
            NodeKind::Terminal { .. } => NodeMemory::Terminal {
                matches: BTreeMap::new(),
            },
            NodeKind::SubnetworkAdapter { .. } => NodeMemory::Subnetwork {
                left: RoaringTreemap::new(),
            },
            NodeKind::ObjectType { .. } | NodeKind::Alpha { .. } => {
                return Err(ReteError::Invariant(format!("{} has no node memory", node.id)));
            }
        })
    }
    pub fn beta(&self) -> Option<&BetaMemory> {
        match self {
            NodeMemory::Beta(beta) | NodeMemory::Accumulate { beta, .. } => Some(beta),
            _ => None,
        }
    }
    pub fn beta_mut(&mut self) -> Option<&mut BetaMemory> {
        match self {
            NodeMemory::Beta(beta) | NodeMemory::Accumulate { beta, .. } => Some(beta),
            _ => None,
        }
    }
}

/// What a partition reports to the session after an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    SegmentDirty(PathId),
    PathLinked(PathId),
    PathUnlinked(PathId),
    Match {
        rule: RuleId,
        kind: MatchKind,
        activation: Activation,
        context: PropagationContext,
    },
}

/// Linked at creation: accumulate nodes and every not node, since a new
/// not node has an empty right memory.
fn starts_linked(node: &Node) -> bool {
    node.kind.always_linked() || matches!(node.kind, NodeKind::Not { .. })
}

#[derive(Debug)]
pub struct PartitionMemory {
    pub id: PartitionId,
    pub(crate) tuples: TupleKeeper,
    pub(crate) nodes: IdMap<NodeId, NodeMemory>,
    pub(crate) segments: IdMap<SegmentId, SegmentMemory>,
    pub(crate) paths: IdMap<PathId, PathMemory>,
    /// Root and right tuples created straight from a fact, by fact and node.
    pub(crate) fact_index: IdMap<FactId, Vec<(NodeId, TupleId)>>,
    pub(crate) outbox: Vec<Signal>,
    pub(crate) flush_queue: VecDeque<PathId>,
    pub(crate) evaluations: usize,
    pub(crate) max_evaluations: usize,
}

impl PartitionMemory {
    pub fn new(id: PartitionId, max_evaluations: usize) -> Self {
        Self {
            id,
            tuples: TupleKeeper::new(),
            nodes: IdMap::default(),
            segments: IdMap::default(),
            paths: IdMap::default(),
            fact_index: IdMap::default(),
            outbox: Vec::new(),
            flush_queue: VecDeque::new(),
            evaluations: 0,
            max_evaluations,
        }
    }

    pub fn tuples(&self) -> &TupleKeeper {
        &self.tuples
    }
    pub fn node_memory(&self, node: NodeId) -> Option<&NodeMemory> {
        self.nodes.get(&node)
    }
    pub fn segment_memory(&self, segment: SegmentId) -> Option<&SegmentMemory> {
        self.segments.get(&segment)
    }
    pub fn path_memory(&self, path: PathId) -> Option<&PathMemory> {
        self.paths.get(&path)
    }
    pub fn drain_signals(&mut self) -> Vec<Signal> {
        std::mem::take(&mut self.outbox)
    }
    /// Resets the per-operation evaluation budget.
    pub fn begin_operation(&mut self) {
        self.evaluations = 0;
    }

    // ------------- lazy creation -------------
    /// Creates the segment's memory if needed, plus every path through it.
    pub(crate) fn ensure_segment(&mut self, net: &Network, segment: SegmentId) -> Result<()> {
        if !self.segments.contains_key(&segment) {
            self.create_segment(net, segment)?;
        }
        for path in &net.segment(segment)?.paths {
            if !self.paths.contains_key(path) {
                self.create_path(net, *path)?;
            }
        }
        Ok(())
    }

    fn create_segment(&mut self, net: &Network, segment: SegmentId) -> Result<()> {
        let layout = net.segment(segment)?;
        let mut memory = SegmentMemory::new(segment, layout.all_linked_mask, layout.position, layout.paths.clone());
        for id in &layout.nodes {
            let node = net.node(*id)?;
            if !self.nodes.contains_key(id) {
                self.nodes.insert(*id, NodeMemory::for_node(node)?);
            }
            if node.kind.is_linkable() && starts_linked(node) {
                memory.linked_node_mask |= node.bit();
            }
        }
        trace!(partition = self.id.0, segment = segment.0, mask = memory.linked_node_mask, "created segment memory");
        self.segments.insert(segment, memory);
        Ok(())
    }

    fn create_path(&mut self, net: &Network, path: PathId) -> Result<()> {
        let layout = net.path(path)?;
        let mut memory = PathMemory::new(path, layout.all_linked_mask, layout.eager);
        for segment in &layout.segments {
            if !self.segments.contains_key(segment) {
                self.create_segment(net, *segment)?;
            }
            if let Some(existing) = self.segments.get(segment) {
                if existing.is_linked() {
                    memory.linked_segment_mask |= existing.bit();
                }
                if existing.is_dirty() {
                    memory.dirty = true;
                }
            }
        }
        if memory.is_linked() {
            self.outbox.push(Signal::PathLinked(path));
        }
        trace!(partition = self.id.0, path = path.0, mask = memory.linked_segment_mask, "created path memory");
        self.paths.insert(path, memory);
        Ok(())
    }

    pub(crate) fn segment_mut(&mut self, segment: SegmentId) -> Result<&mut SegmentMemory> {
        self.segments
            .get_mut(&segment)
            .ok_or_else(|| ReteError::Invariant(format!("segment {} has no memory", segment.0)))
    }

    pub(crate) fn node_mut(&mut self, node: NodeId) -> Result<&mut NodeMemory> {
        self.nodes
            .get_mut(&node)
            .ok_or_else(|| ReteError::Invariant(format!("{node} has no memory")))
    }

    pub(crate) fn beta_mut(&mut self, node: NodeId) -> Result<&mut BetaMemory> {
        self.node_mut(node)?
            .beta_mut()
            .ok_or_else(|| ReteError::Invariant(format!("{node} has no beta memory")))
    }

    /// Takes a node memory out of the map while the node is evaluated.
    pub(crate) fn take_node(&mut self, node: NodeId) -> Result<NodeMemory> {
        self.nodes
            .remove(&node)
            .ok_or_else(|| ReteError::Invariant(format!("{node} has no memory")))
    }

    pub(crate) fn put_node(&mut self, node: NodeId, memory: NodeMemory) {
        self.nodes.insert(node, memory);
    }

    // ------------- linking -------------
    pub(crate) fn link_node(&mut self, net: &Network, id: NodeId) -> Result<()> {
        let node = net.node(id)?;
        let segment = node.segment()?;
        self.ensure_segment(net, segment)?;
        let memory = self.segment_mut(segment)?;
        if !memory.link_node(node.bit()) {
            return Ok(());
        }
        let (bit, paths) = (memory.bit(), memory.paths.clone());
        trace!(partition = self.id.0, node = %id, segment = segment.0, "segment linked");
        for path in paths {
            let Some(path_memory) = self.paths.get_mut(&path) else {
                continue;
            };
            if path_memory.link_segment(bit) {
                trace!(partition = self.id.0, path = path.0, "path linked");
                self.outbox.push(Signal::PathLinked(path));
                if path_memory.eager {
                    self.enqueue(path);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn unlink_node(&mut self, net: &Network, id: NodeId) -> Result<()> {
        let node = net.node(id)?;
        let segment = node.segment()?;
        self.ensure_segment(net, segment)?;
        let memory = self.segment_mut(segment)?;
        if !memory.unlink_node(node.bit()) {
            return Ok(());
        }
        let (bit, paths) = (memory.bit(), memory.paths.clone());
        trace!(partition = self.id.0, node = %id, segment = segment.0, "segment unlinked");
        for path in paths {
            let Some(path_memory) = self.paths.get_mut(&path) else {
                continue;
            };
            if path_memory.unlink_segment(bit) {
                trace!(partition = self.id.0, path = path.0, "path unlinked");
                self.outbox.push(Signal::PathUnlinked(path));
            }
        }
        Ok(())
    }

    /// Records that a node of the segment has staged work. Paths turning
    /// dirty are reported; eager paths are queued for a forced flush.
    pub(crate) fn mark_dirty(&mut self, segment: SegmentId, bit: u64) -> Result<()> {
        let memory = self.segment_mut(segment)?;
        memory.dirty_node_mask |= bit;
        for path in memory.paths.clone() {
            let Some(path_memory) = self.paths.get_mut(&path) else {
                continue;
            };
            let eager = path_memory.eager;
            if !path_memory.dirty {
                path_memory.dirty = true;
                self.outbox.push(Signal::SegmentDirty(path));
            }
            if eager {
                self.enqueue(path);
            }
        }
        Ok(())
    }

    pub(crate) fn enqueue(&mut self, path: PathId) {
        if !self.flush_queue.contains(&path) {
            self.flush_queue.push_back(path);
        }
    }

    // ------------- staging -------------
    pub(crate) fn stage_left(&mut self, net: &Network, segment: SegmentId, tuple: TupleId, kind: OpKind) -> Result<()> {
        self.ensure_segment(net, segment)?;
        let memory = self
            .segments
            .get_mut(&segment)
            .ok_or_else(|| ReteError::Invariant(format!("segment {} has no memory", segment.0)))?;
        let was_empty = match kind {
            OpKind::Insert => memory.staged_left.add_insert(&mut self.tuples, tuple)?,
            OpKind::Update => memory.staged_left.add_update(&mut self.tuples, tuple)?,
            OpKind::Delete => memory.staged_left.add_delete(&mut self.tuples, tuple)?,
        };
        if was_empty {
            self.mark_dirty(segment, 1)?;
        }
        Ok(())
    }

    pub(crate) fn stage_right(&mut self, net: &Network, id: NodeId, tuple: TupleId, kind: OpKind) -> Result<()> {
        let node = net.node(id)?;
        let segment = node.segment()?;
        self.ensure_segment(net, segment)?;
        let memory = self
            .nodes
            .get_mut(&id)
            .and_then(NodeMemory::beta_mut)
            .ok_or_else(|| ReteError::Invariant(format!("{id} has no beta memory")))?;
        let was_empty = match kind {
            OpKind::Insert => memory.staged_right.add_insert(&mut self.tuples, tuple)?,
            OpKind::Update => memory.staged_right.add_update(&mut self.tuples, tuple)?,
            OpKind::Delete => memory.staged_right.add_delete(&mut self.tuples, tuple)?,
        };
        if was_empty {
            self.mark_dirty(segment, node.bit())?;
        }
        Ok(())
    }

    // ------------- fact index -------------
    pub(crate) fn index(&mut self, fact: FactId, node: NodeId, tuple: TupleId) {
        self.fact_index.entry(fact).or_default().push((node, tuple));
    }

    pub(crate) fn unindex(&mut self, fact: FactId, node: NodeId) -> Option<TupleId> {
        let entries = self.fact_index.get_mut(&fact)?;
        let pos = entries.iter().position(|(held, _)| *held == node)?;
        let (_, tuple) = entries.remove(pos);
        if entries.is_empty() {
            self.fact_index.remove(&fact);
        }
        Some(tuple)
    }

    pub fn holds(&self, fact: FactId, node: NodeId) -> Option<TupleId> {
        self.fact_index
            .get(&fact)
            .and_then(|entries| entries.iter().find(|(held, _)| *held == node))
            .map(|(_, tuple)| *tuple)
    }

    pub(crate) fn indexed_nodes(&self, fact: FactId) -> Vec<NodeId> {
        self.fact_index
            .get(&fact)
            .map(|entries| entries.iter().map(|(node, _)| *node).collect())
            .unwrap_or_default()
    }

    // ------------- introspection -------------
    /// Live tuples built on `fact`, leaving out those already staged for
    /// deletion.
    pub fn tuples_derived_from(&self, fact: FactId) -> usize {
        self.tuples
            .iter()
            .filter(|(id, tuple)| {
                tuple.staged != crate::tuple::StagedType::Delete && self.tuples.derives_from(*id, fact)
            })
            .count()
    }

    pub fn matches(&self, terminal: NodeId) -> Vec<Activation> {
        match self.nodes.get(&terminal) {
            Some(NodeMemory::Terminal { matches }) => matches.values().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn right_len(&self, node: NodeId) -> usize {
        self.nodes
            .get(&node)
            .and_then(NodeMemory::beta)
            .map(|beta| beta.right.len() as usize)
            .unwrap_or(0)
    }

    pub fn left_len(&self, node: NodeId) -> usize {
        self.nodes
            .get(&node)
            .and_then(NodeMemory::beta)
            .map(|beta| beta.left.len() as usize)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{Condition, Pattern, RuleDefinition};

    fn two_way() -> Network {
        let mut network = Network::new(1);
        network
            .add_rule(
                RuleDefinition::new("ab")
                    .when(Condition::pattern(Pattern::new("A")))
                    .when(Condition::pattern(Pattern::new("B"))),
            )
            .unwrap();
        network
    }

    #[test]
    fn first_touch_creates_the_whole_path() {
        let network = two_way();
        let mut memory = PartitionMemory::new(PartitionId(0), 100);
        assert!(memory.segments.is_empty());
        let segment = network.segments()[0].id;
        memory.ensure_segment(&network, segment).unwrap();
        assert_eq!(memory.paths.len(), 1);
        assert_eq!(memory.nodes.len(), 3);
        let path = memory.paths.values().next().unwrap();
        assert_eq!(path.linked_segment_mask, 0);
    }

    #[test]
    fn linking_every_node_links_the_path() {
        let network = two_way();
        let mut memory = PartitionMemory::new(PartitionId(0), 100);
        let nodes = network.segments()[0].nodes.clone();
        memory.link_node(&network, nodes[0]).unwrap();
        assert!(memory.drain_signals().is_empty());
        memory.link_node(&network, nodes[1]).unwrap();
        assert_eq!(memory.drain_signals(), vec![Signal::PathLinked(PathId(0))]);
        memory.link_node(&network, nodes[1]).unwrap();
        assert!(memory.drain_signals().is_empty());
        memory.unlink_node(&network, nodes[0]).unwrap();
        assert_eq!(memory.drain_signals(), vec![Signal::PathUnlinked(PathId(0))]);
    }
}
