//! The node graph and its static layout.
//!
//! Nodes live in an arena addressed by [`NodeId`]. After every structural
//! change the network recomputes which nodes form segments, which segments
//! form the path of each terminal, and which partition every beta component
//! belongs to. Runtime state lives elsewhere (see `memory`), so the network
//! itself is immutable while sessions are alive.

use core::hash::BuildHasherDefault;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bimap::BiMap;
use seahash::SeaHasher;
use serde_json::Value;
use tracing::{debug, info};

use crate::builder::RuleDefinition;
use crate::config::EngineConfig;
use crate::error::{ReteError, Result};
use crate::node::{NetworkNode, Node, NodeId, NodeKind, PartitionId, PathId, RuleId, SegmentId};

/// Most nodes a segment may hold, and most segments a path may span.
pub const MASK_BITS: usize = 64;

pub fn full_mask(bits: usize) -> u64 {
    if bits >= MASK_BITS { u64::MAX } else { (1u64 << bits) - 1 }
}

#[derive(Debug, Clone)]
pub struct SegmentLayout {
    pub id: SegmentId,
    pub nodes: Vec<NodeId>,
    pub parent: Option<SegmentId>,
    /// Ordered like the tuple sinks of the tip node.
    pub children: Vec<SegmentId>,
    /// Bit of this segment in every path through it.
    pub position: u32,
    pub paths: Vec<PathId>,
    pub all_linked_mask: u64,
}

impl SegmentLayout {
    pub fn root(&self) -> NodeId {
        self.nodes[0]
    }
    pub fn tip(&self) -> NodeId {
        self.nodes[self.nodes.len() - 1]
    }
    pub fn bit(&self) -> u64 {
        1 << self.position
    }
}

#[derive(Debug, Clone)]
pub struct PathLayout {
    pub id: PathId,
    /// A rule terminal or a subnetwork adapter.
    pub terminal: NodeId,
    pub rule: Option<RuleId>,
    pub segments: Vec<SegmentId>,
    /// Evaluated as soon as anything is staged on it.
    pub eager: bool,
    pub all_linked_mask: u64,
    pub partition: PartitionId,
}

#[derive(Debug, Clone)]
pub struct RuleEntry {
    pub name: String,
    pub terminal: NodeId,
    pub data_driven: bool,
    pub nodes: BTreeSet<NodeId>,
}

// ------------- Network -------------
#[derive(Debug, Default)]
pub struct Network {
    nodes: Vec<Option<Node>>,
    object_types: HashMap<String, NodeId, BuildHasherDefault<SeaHasher>>,
    rule_names: BiMap<String, RuleId>,
    rules: BTreeMap<RuleId, RuleEntry>,
    next_rule: u32,
    segments: Vec<SegmentLayout>,
    paths: Vec<PathLayout>,
    path_of_terminal: HashMap<NodeId, PathId, BuildHasherDefault<SeaHasher>>,
    partitions: u16,
}

impl Network {
    pub fn new(partitions: u16) -> Self {
        Self {
            partitions: partitions.max(1),
            ..Default::default()
        }
    }

    // ------------- nodes -------------
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(ReteError::UnknownNode(id.0))
    }
    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(ReteError::UnknownNode(id.0))
    }
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flatten()
    }
    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }
    pub fn object_type_node(&self, fact_type: &str) -> Option<NodeId> {
        self.object_types.get(fact_type).copied()
    }
    pub(crate) fn add_node(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        if let NodeKind::ObjectType { fact_type } = &kind {
            self.object_types.insert(fact_type.clone(), id);
        }
        debug!(node = %id, kind = kind.label(), "created node");
        self.nodes.push(Some(Node::new(id, kind)));
        id
    }
    /// True when the right input of `node` is a subnetwork adapter.
    pub fn is_subnetwork_fed(&self, node: &Node) -> bool {
        node.right_source
            .and_then(|right| self.node(right).ok())
            .is_some_and(|right| matches!(right.kind, NodeKind::SubnetworkAdapter { .. }))
    }

    // ------------- rules -------------
    pub fn rule_id(&self, name: &str) -> Result<RuleId> {
        self.rule_names
            .get_by_left(name)
            .copied()
            .ok_or_else(|| ReteError::UnknownRule(name.to_owned()))
    }
    pub fn rule_name(&self, rule: RuleId) -> Option<&str> {
        self.rule_names.get_by_right(&rule).map(String::as_str)
    }
    pub fn rule(&self, rule: RuleId) -> Result<&RuleEntry> {
        self.rules
            .get(&rule)
            .ok_or_else(|| ReteError::UnknownRule(format!("#{}", rule.0)))
    }
    pub fn rules(&self) -> impl Iterator<Item = (RuleId, &RuleEntry)> {
        self.rules.iter().map(|(id, entry)| (*id, entry))
    }
    pub(crate) fn reserve_rule(&mut self, name: &str) -> Result<RuleId> {
        if self.rule_names.contains_left(name) {
            return Err(ReteError::Build(format!("rule {name} already exists")));
        }
        let rule = RuleId(self.next_rule);
        self.next_rule += 1;
        Ok(rule)
    }
    pub(crate) fn register_rule(&mut self, rule: RuleId, entry: RuleEntry) {
        self.rule_names.insert(entry.name.clone(), rule);
        self.rules.insert(rule, entry);
    }

    pub fn add_rule(&mut self, definition: RuleDefinition) -> Result<RuleId> {
        let name = definition.name().to_owned();
        let rule = self.reserve_rule(&name)?;
        let outcome = self.build_rule(rule, definition).and_then(|_| self.relayout());
        if let Err(e) = outcome {
            self.rule_names.remove_by_right(&rule);
            self.rules.remove(&rule);
            self.purge(rule);
            self.relayout()?;
            return Err(e);
        }
        info!(rule = %name, nodes = self.node_count(), segments = self.segments.len(), "added rule");
        Ok(rule)
    }

    pub fn remove_rule(&mut self, name: &str) -> Result<()> {
        let rule = self.rule_id(name)?;
        self.rule_names.remove_by_left(name);
        self.rules.remove(&rule);
        let removed = self.purge(rule);
        self.relayout()?;
        info!(rule = %name, removed, "removed rule");
        Ok(())
    }

    /// Drops `rule` from every node, deleting the nodes no rule uses any
    /// more. Returns the number of deleted nodes.
    fn purge(&mut self, rule: RuleId) -> usize {
        let mut doomed = BTreeSet::new();
        for node in self.nodes.iter_mut().flatten() {
            if node.rules.remove(&rule) && node.rules.is_empty() {
                doomed.insert(node.id);
            }
        }
        for node in self.nodes.iter_mut().flatten() {
            node.object_sinks.retain(|sink| !doomed.contains(sink));
            node.tuple_sinks.retain(|sink| !doomed.contains(sink));
        }
        for id in &doomed {
            if let Some(Node {
                kind: NodeKind::ObjectType { fact_type },
                ..
            }) = self.nodes[id.0 as usize].take()
            {
                self.object_types.remove(&fact_type);
            }
        }
        doomed.len()
    }

    // ------------- layout -------------
    pub fn segment(&self, id: SegmentId) -> Result<&SegmentLayout> {
        self.segments
            .get(id.0 as usize)
            .ok_or_else(|| ReteError::Invariant(format!("no segment {}", id.0)))
    }
    pub fn segments(&self) -> &[SegmentLayout] {
        &self.segments
    }
    pub fn path(&self, id: PathId) -> Result<&PathLayout> {
        self.paths
            .get(id.0 as usize)
            .ok_or_else(|| ReteError::Invariant(format!("no path {}", id.0)))
    }
    pub fn paths(&self) -> &[PathLayout] {
        &self.paths
    }
    pub fn path_of_terminal(&self, terminal: NodeId) -> Result<PathId> {
        self.path_of_terminal
            .get(&terminal)
            .copied()
            .ok_or_else(|| ReteError::Invariant(format!("{terminal} terminates no path")))
    }
    pub fn path_of_rule(&self, rule: RuleId) -> Result<PathId> {
        self.path_of_terminal(self.rule(rule)?.terminal)
    }
    pub fn partitions(&self) -> u16 {
        self.partitions
    }

    fn starts_segment(&self, node: &Node) -> Result<bool> {
        if matches!(node.kind, NodeKind::Adapter) {
            return Ok(true);
        }
        match node.left_source {
            Some(left) => Ok(self.node(left)?.tuple_sinks.len() > 1),
            None => Ok(false),
        }
    }

    /// Recomputes segments, paths and partitions from the node graph.
    pub(crate) fn relayout(&mut self) -> Result<()> {
        self.segments.clear();
        self.paths.clear();
        self.path_of_terminal.clear();
        for node in self.nodes.iter_mut().flatten() {
            node.segment = None;
            node.segment_pos = 0;
        }
        let roots = self
            .nodes()
            .filter(|node| node.kind.is_tuple_source() || node.kind.is_tuple_sink())
            .map(|node| self.starts_segment(node).map(|starts| starts.then_some(node.id)))
            .collect::<Result<Vec<_>>>()?;
        for root in roots.into_iter().flatten() {
            self.lay_segment(root)?;
        }
        // parents and children
        for index in 0..self.segments.len() {
            let root = self.segments[index].root();
            let parent = match self.node(root)?.left_source {
                Some(left) => Some(self.node(left)?.segment()?),
                None => None,
            };
            self.segments[index].parent = parent;
        }
        for index in 0..self.segments.len() {
            let tip = self.node(self.segments[index].tip())?;
            let children = tip
                .tuple_sinks
                .iter()
                .map(|sink| self.node(*sink).and_then(Node::segment))
                .collect::<Result<Vec<_>>>()?;
            self.segments[index].children = children;
        }
        for index in 0..self.segments.len() {
            let mut depth = 0;
            let mut parent = self.segments[index].parent;
            while let Some(up) = parent {
                depth += 1;
                parent = self.segment(up)?.parent;
            }
            if depth >= MASK_BITS {
                return Err(ReteError::Build(format!("path deeper than {MASK_BITS} segments")));
            }
            self.segments[index].position = depth as u32;
        }
        self.assign_partitions();
        let terminals: Vec<NodeId> = self
            .nodes()
            .filter(|node| matches!(node.kind, NodeKind::Terminal { .. } | NodeKind::SubnetworkAdapter { .. }))
            .map(|node| node.id)
            .collect();
        for terminal in terminals {
            self.lay_path(terminal)?;
        }
        debug!(segments = self.segments.len(), paths = self.paths.len(), "network laid out");
        Ok(())
    }

    fn lay_segment(&mut self, root: NodeId) -> Result<()> {
        let id = SegmentId(self.segments.len() as u32);
        let mut nodes = Vec::new();
        let mut all_linked_mask = 0;
        let mut current = root;
        loop {
            if nodes.len() == MASK_BITS {
                return Err(ReteError::Build(format!("segment at {root} exceeds {MASK_BITS} nodes")));
            }
            let position = nodes.len() as u32;
            let node = self.node_mut(current)?;
            node.segment = Some(id);
            node.segment_pos = position;
            if node.kind.is_linkable() {
                all_linked_mask |= node.bit();
            }
            nodes.push(current);
            let ends = matches!(node.kind, NodeKind::Terminal { .. } | NodeKind::SubnetworkAdapter { .. })
                || node.tuple_sinks.len() != 1;
            if ends {
                break;
            }
            current = node.tuple_sinks[0];
        }
        self.segments.push(SegmentLayout {
            id,
            nodes,
            parent: None,
            children: Vec::new(),
            position: 0,
            paths: Vec::new(),
            all_linked_mask,
        });
        Ok(())
    }

    fn lay_path(&mut self, terminal: NodeId) -> Result<()> {
        let id = PathId(self.paths.len() as u32);
        let node = self.node(terminal)?;
        let (rule, eager) = match node.kind {
            NodeKind::Terminal { rule } => (Some(rule), self.rule(rule).map(|entry| entry.data_driven).unwrap_or(false)),
            _ => (None, true),
        };
        let partition = node.partition;
        let mut segments = vec![node.segment()?];
        while let Some(parent) = self.segment(segments[segments.len() - 1])?.parent {
            segments.push(parent);
        }
        segments.reverse();
        for segment in &segments {
            self.segments[segment.0 as usize].paths.push(id);
        }
        self.paths.push(PathLayout {
            id,
            terminal,
            rule,
            all_linked_mask: full_mask(segments.len()),
            segments,
            eager,
            partition,
        });
        self.path_of_terminal.insert(terminal, id);
        Ok(())
    }

    // ------------- partitions -------------
    /// Connected beta components are dealt to partitions round-robin, in
    /// order of their smallest node id. Object type and alpha nodes keep no
    /// memory and stay in partition zero.
    fn assign_partitions(&mut self) {
        let mut parent: Vec<usize> = (0..self.nodes.len()).collect();
        fn find(parent: &mut [usize], mut x: usize) -> usize {
            while parent[x] != x {
                parent[x] = parent[parent[x]];
                x = parent[x];
            }
            x
        }
        let mut edges = Vec::new();
        for node in self.nodes() {
            if let Some(left) = node.left_source {
                edges.push((node.id.0 as usize, left.0 as usize));
            }
            if let NodeKind::SubnetworkAdapter { outer } = node.kind {
                edges.push((node.id.0 as usize, outer.0 as usize));
            }
        }
        for (a, b) in edges {
            let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
            if ra != rb {
                parent[ra.max(rb)] = ra.min(rb);
            }
        }
        let mut components: BTreeMap<usize, u16> = BTreeMap::new();
        let partitions = self.partitions;
        for index in 0..self.nodes.len() {
            let Some(node) = &self.nodes[index] else {
                continue;
            };
            if node.kind.is_object_source() {
                continue;
            }
            let root = find(&mut parent, index);
            let next = components.len() as u16;
            let assigned = *components.entry(root).or_insert(next % partitions);
            if let Some(node) = self.nodes[index].as_mut() {
                node.partition = PartitionId(assigned);
            }
        }
    }

    pub(crate) fn set_partitions(&mut self, partitions: u16) -> Result<()> {
        self.partitions = partitions.max(1);
        self.relayout()
    }

    // ------------- alpha traversal -------------
    /// Every adapter and beta right input reachable from the object type
    /// node of `fact_type`, flagged with whether `value` passes the alpha
    /// filters on the way.
    pub fn object_sinks(&self, fact_type: &str, value: &Value) -> Result<Vec<(NodeId, bool)>> {
        let mut found = Vec::new();
        if let Some(otn) = self.object_type_node(fact_type) {
            self.collect_sinks(otn, value, true, &mut found)?;
        }
        Ok(found)
    }

    fn collect_sinks(&self, source: NodeId, value: &Value, passes: bool, found: &mut Vec<(NodeId, bool)>) -> Result<()> {
        for sink in &self.node(source)?.object_sinks {
            let node = self.node(*sink)?;
            match &node.kind {
                NodeKind::Alpha { constraint } => {
                    let passes = passes && constraint.evaluate(value)?;
                    self.collect_sinks(*sink, value, passes, found)?;
                }
                _ => found.push((*sink, passes)),
            }
        }
        Ok(())
    }
}

// ------------- KnowledgeBase -------------
/// The shared rule base. Sessions read the network concurrently; structural
/// changes need the write lock and no live session.
#[derive(Debug, Clone)]
pub struct KnowledgeBase {
    network: Arc<RwLock<Network>>,
    sessions: Arc<AtomicUsize>,
    config: EngineConfig,
}

/// Counts a live session until dropped.
#[derive(Debug)]
pub(crate) struct SessionGuard(Arc<AtomicUsize>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl KnowledgeBase {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            network: Arc::new(RwLock::new(Network::new(config.partitions))),
            sessions: Arc::new(AtomicUsize::new(0)),
            config,
        }
    }
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
    pub fn network(&self) -> Result<RwLockReadGuard<'_, Network>> {
        Ok(self.network.read()?)
    }
    pub fn live_sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
    fn exclusive(&self) -> Result<RwLockWriteGuard<'_, Network>> {
        let network = self.network.write()?;
        match self.live_sessions() {
            0 => Ok(network),
            live => Err(ReteError::NetworkInUse(live)),
        }
    }
    pub(crate) fn register_session(&self) -> Result<SessionGuard> {
        // taking the read lock waits out any structural change in flight
        let _network = self.network.read()?;
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(SessionGuard(Arc::clone(&self.sessions)))
    }
    pub(crate) fn shared(&self) -> Arc<RwLock<Network>> {
        Arc::clone(&self.network)
    }

    pub fn add_rule(&self, definition: RuleDefinition) -> Result<RuleId> {
        self.exclusive()?.add_rule(definition)
    }
    pub fn remove_rule(&self, name: &str) -> Result<()> {
        self.exclusive()?.remove_rule(name)
    }
    pub fn repartition(&self, partitions: u16) -> Result<()> {
        self.exclusive()?.set_partitions(partitions)
    }

    pub fn rule_names(&self) -> Result<Vec<String>> {
        let network = self.network()?;
        Ok(network.rules().map(|(_, entry)| entry.name.clone()).collect())
    }
    pub fn nodes_of_rule(&self, name: &str) -> Result<Vec<NodeId>> {
        let network = self.network()?;
        let rule = network.rule_id(name)?;
        Ok(network.rule(rule)?.nodes.iter().copied().collect())
    }
    /// Node ids of each segment on the rule's path, root segment first.
    pub fn segments_of_rule(&self, name: &str) -> Result<Vec<Vec<NodeId>>> {
        let network = self.network()?;
        let path = network.path(network.path_of_rule(network.rule_id(name)?)?)?;
        path.segments
            .iter()
            .map(|segment| network.segment(*segment).map(|layout| layout.nodes.clone()))
            .collect()
    }
    pub fn partition_of_rule(&self, name: &str) -> Result<PartitionId> {
        let network = self.network()?;
        let rule = network.rule_id(name)?;
        Ok(network.node(network.rule(rule)?.terminal)?.partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_cover_the_requested_bits() {
        assert_eq!(full_mask(0), 0);
        assert_eq!(full_mask(3), 0b111);
        assert_eq!(full_mask(64), u64::MAX);
    }
}
