//! Entry of fact changes into a partition.
//!
//! Facts reach beta memory through two doors: an adapter, which turns a
//! fact into the root left tuple of its segment, and the right input of a
//! beta node, which wraps the fact in a right tuple. Either way the change
//! is only staged here. Linking is adjusted eagerly; evaluation waits for a
//! flush or an explicit rule evaluation.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{ReteError, Result};
use crate::fact::{FactHandle, FactId};
use crate::memory::{NodeMemory, PartitionMemory};
use crate::network::Network;
use crate::node::{NetworkNode, Node, NodeId, NodeKind, SegmentId};
use crate::tuple::{OpKind, PropagationContext, TupleId, TupleValue};

impl PartitionMemory {
    // ------------- fact entry points -------------
    pub fn insert_fact(&mut self, net: &Network, sink: NodeId, handle: Arc<FactHandle>, context: PropagationContext) -> Result<()> {
        let node = net.node(sink)?;
        match &node.kind {
            NodeKind::Adapter => self.adapter_insert(net, node, handle, context),
            kind if kind.is_beta() => {
                let fact = handle.id();
                let right = self.tuples.create_right(TupleValue::Fact(handle), sink, context);
                self.index(fact, sink, right);
                self.right_insert(net, sink, right)
            }
            other => Err(ReteError::Invariant(format!("{} node {sink} cannot take facts", other.label()))),
        }
    }

    /// Re-propagates a fact already held by `sink`.
    pub fn update_fact(&mut self, net: &Network, sink: NodeId, handle: Arc<FactHandle>, context: PropagationContext) -> Result<()> {
        let fact = handle.id();
        let Some(tuple) = self.holds(fact, sink) else {
            return self.insert_fact(net, sink, handle, context);
        };
        let node = net.node(sink)?;
        match &node.kind {
            NodeKind::Adapter => self.adapter_update(net, node, tuple, context),
            kind if kind.supports_right_update() => {
                self.tuples.get_mut(tuple)?.context = context;
                self.modify_right_tuple(net, sink, tuple)
            }
            _ => {
                // not and exists re-assert instead
                self.delete_fact(net, sink, fact, context)?;
                self.insert_fact(net, sink, handle, context)
            }
        }
    }

    pub fn delete_fact(&mut self, net: &Network, sink: NodeId, fact: FactId, context: PropagationContext) -> Result<()> {
        let Some(tuple) = self.unindex(fact, sink) else {
            return Ok(());
        };
        let node = net.node(sink)?;
        match &node.kind {
            NodeKind::Adapter => self.adapter_delete(net, node, tuple, context),
            _ => {
                self.tuples.get_mut(tuple)?.context = context;
                self.right_delete(net, sink, tuple, true)
            }
        }
    }

    /// Deletes every tuple this partition built straight from `fact`.
    pub fn delete_fact_everywhere(&mut self, net: &Network, fact: FactId, context: PropagationContext) -> Result<usize> {
        let nodes = self.indexed_nodes(fact);
        for sink in &nodes {
            self.delete_fact(net, *sink, fact, context)?;
        }
        Ok(nodes.len())
    }

    // ------------- adapters -------------
    fn adapter_counter(&mut self, adapter: NodeId, delta: isize) -> Result<usize> {
        match self.node_mut(adapter)? {
            NodeMemory::Adapter { counter } => {
                *counter = counter.saturating_add_signed(delta);
                Ok(*counter)
            }
            _ => Err(ReteError::Invariant(format!("{adapter} has no adapter memory"))),
        }
    }

    /// Segments the adapter stages into: its own, or, when the adapter is
    /// alone in its segment, every child segment.
    fn adapter_targets(net: &Network, adapter: &Node) -> Result<Vec<SegmentId>> {
        let layout = net.segment(adapter.segment()?)?;
        if layout.nodes.len() == 1 && !layout.children.is_empty() {
            Ok(layout.children.clone())
        } else {
            Ok(vec![layout.id])
        }
    }

    fn adapter_insert(&mut self, net: &Network, adapter: &Node, handle: Arc<FactHandle>, context: PropagationContext) -> Result<()> {
        let segment = adapter.segment()?;
        self.ensure_segment(net, segment)?;
        let fact = handle.id();
        let sink = adapter.tuple_sinks.first().copied().unwrap_or(adapter.id);
        let root = self.tuples.create_root(handle, adapter.id, sink, context);
        self.index(fact, adapter.id, root);
        if self.adapter_counter(adapter.id, 1)? == 1 {
            self.link_node(net, adapter.id)?;
        }
        let targets = Self::adapter_targets(net, adapter)?;
        let chain = if targets.len() > 1 || targets[0] != segment {
            self.build_peers(net, root, &targets)?
        } else {
            vec![root]
        };
        trace!(partition = self.id.0, adapter = %adapter.id, fact = %fact, tuples = chain.len(), "adapter insert");
        for (target, tuple) in targets.into_iter().zip(chain) {
            self.stage_left(net, target, tuple, OpKind::Insert)?;
        }
        Ok(())
    }

    fn adapter_update(&mut self, net: &Network, adapter: &Node, root: TupleId, context: PropagationContext) -> Result<()> {
        let chain = self.tuples.peer_chain(root)?;
        for tuple in &chain {
            self.tuples.get_mut(*tuple)?.context = context;
        }
        let targets = Self::adapter_targets(net, adapter)?;
        for (target, tuple) in targets.into_iter().zip(chain) {
            self.stage_left(net, target, tuple, OpKind::Update)?;
        }
        Ok(())
    }

    fn adapter_delete(&mut self, net: &Network, adapter: &Node, root: TupleId, context: PropagationContext) -> Result<()> {
        let chain = self.tuples.peer_chain(root)?;
        for tuple in &chain {
            self.tuples.get_mut(*tuple)?.context = context;
        }
        let targets = Self::adapter_targets(net, adapter)?;
        for (target, tuple) in targets.into_iter().zip(chain) {
            self.stage_left(net, target, tuple, OpKind::Delete)?;
        }
        if self.adapter_counter(adapter.id, -1)? == 0 {
            // pending work must reach the rules before the segment unlinks
            self.flush(net)?;
            self.unlink_node(net, adapter.id)?;
        }
        Ok(())
    }

    /// Gives every target segment after the first its own peer of
    /// `original`, re-pointing the sinks at the segment roots.
    pub(crate) fn build_peers(&mut self, net: &Network, original: TupleId, targets: &[SegmentId]) -> Result<Vec<TupleId>> {
        let origin = self.tuples.get(original)?.origin;
        if targets.len() > 1 && !net.node(origin)?.kind.creates_peer() {
            return Err(ReteError::Invariant(format!("{origin} cannot fan out into {} segments", targets.len())));
        }
        let mut chain = vec![original];
        for (index, target) in targets.iter().enumerate() {
            let root = net.segment(*target)?.root();
            if index == 0 {
                self.tuples.get_mut(original)?.sink = root;
                continue;
            }
            let previous = chain[index - 1];
            chain.push(self.tuples.create_peer(previous, root)?);
        }
        Ok(chain)
    }

    // ------------- right inputs -------------
    pub(crate) fn right_insert(&mut self, net: &Network, id: NodeId, right: TupleId) -> Result<()> {
        let node = net.node(id)?;
        self.ensure_segment(net, node.segment()?)?;
        let count = {
            let beta = self.beta_mut(id)?;
            beta.right_count += 1;
            beta.right_count
        };
        self.stage_right(net, id, right, OpKind::Insert)?;
        if count == 1 {
            match &node.kind {
                NodeKind::Join { .. } | NodeKind::Exists { .. } => self.link_node(net, id)?,
                // an empty not node stays linked so the arriving blocker is
                // evaluated, after which the node unlinks
                NodeKind::Not { .. } if node.is_unconstrained_not(net.is_subnetwork_fed(node)) => {
                    self.link_node(net, id)?
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Stages the retraction of a right tuple. `flush_first` runs pending
    /// work before the node unlinks; it is off while a path is evaluated.
    pub(crate) fn right_delete(&mut self, net: &Network, id: NodeId, right: TupleId, flush_first: bool) -> Result<()> {
        let node = net.node(id)?;
        self.ensure_segment(net, node.segment()?)?;
        let count = {
            let beta = self.beta_mut(id)?;
            beta.right_count = beta.right_count.saturating_sub(1);
            beta.right_count
        };
        self.stage_right(net, id, right, OpKind::Delete)?;
        if count == 0 {
            match &node.kind {
                NodeKind::Join { .. } | NodeKind::Exists { .. } => {
                    if flush_first {
                        self.flush(net)?;
                    }
                    self.unlink_node(net, id)?;
                }
                NodeKind::Not { .. } if node.is_unconstrained_not(net.is_subnetwork_fed(node)) => {
                    self.link_node(net, id)?
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// In-place update of a right tuple. Only joins and accumulates accept
    /// one; not and exists nodes report an unsupported operation.
    pub fn modify_right_tuple(&mut self, net: &Network, id: NodeId, right: TupleId) -> Result<()> {
        net.node(id)?.kind.check_right_update()?;
        self.stage_right(net, id, right, OpKind::Update)
    }

    // ------------- flushing -------------
    /// Evaluates queued eager paths until none is left.
    pub fn flush(&mut self, net: &Network) -> Result<()> {
        while let Some(path) = self.flush_queue.pop_front() {
            if self.should_evaluate(net, path)? {
                debug!(partition = self.id.0, path = path.0, "forced flush");
                self.evaluate_path(net, path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{Condition, Pattern, RuleDefinition};
    use crate::fact::FactKeeper;
    use crate::node::PartitionId;
    use serde_json::json;

    fn ctx(number: u64, fact: FactId, kind: OpKind) -> PropagationContext {
        PropagationContext::new(number, fact, kind)
    }

    #[test]
    fn not_node_refuses_in_place_right_update() {
        let mut network = Network::new(1);
        network
            .add_rule(
                RuleDefinition::new("lonely")
                    .when(Condition::pattern(Pattern::new("A")))
                    .when(Condition::not(Pattern::new("B"), vec![])),
            )
            .unwrap();
        let not = network
            .nodes()
            .find(|node| matches!(node.kind, NodeKind::Not { .. }))
            .map(|node| node.id)
            .unwrap();
        let mut facts = FactKeeper::new();
        let mut memory = PartitionMemory::new(PartitionId(0), 100);
        let b = facts.keep("B", json!({}));
        memory.insert_fact(&network, not, Arc::clone(&b), ctx(1, b.id(), OpKind::Insert)).unwrap();
        let right = memory.holds(b.id(), not).unwrap();
        let outcome = memory.modify_right_tuple(&network, not, right);
        assert!(matches!(outcome, Err(ReteError::UnsupportedOperation(_))));
    }

    #[test]
    fn adapter_counter_tracks_linking() {
        let mut network = Network::new(1);
        network
            .add_rule(
                RuleDefinition::new("ab")
                    .when(Condition::pattern(Pattern::new("A")))
                    .when(Condition::pattern(Pattern::new("B"))),
            )
            .unwrap();
        let adapter = network.segments()[0].root();
        let mut facts = FactKeeper::new();
        let mut memory = PartitionMemory::new(PartitionId(0), 100);
        let a = facts.keep("A", json!(1));
        memory.insert_fact(&network, adapter, Arc::clone(&a), ctx(1, a.id(), OpKind::Insert)).unwrap();
        let segment = network.segments()[0].id;
        assert_eq!(memory.segment_memory(segment).unwrap().linked_node_mask, 0b01);
        memory.delete_fact(&network, adapter, a.id(), ctx(2, a.id(), OpKind::Delete)).unwrap();
        assert_eq!(memory.segment_memory(segment).unwrap().linked_node_mask, 0);
        assert!(memory.holds(a.id(), adapter).is_none());
    }
}
