//! Path evaluation.
//!
//! Evaluating a path walks its segments from the root. In each dirty
//! segment the staged left tuples run through the nodes in order: every
//! node consumes its input set together with its own staged right tuples
//! and hands an output set to the next node. The tip's output is staged on
//! the child segments, with one peer per extra child. Within a node the
//! phases run as left deletes, right deletes, left updates, right updates,
//! left inserts and finally right inserts.

use std::collections::BTreeMap;
use std::sync::Arc;

use roaring::RoaringTreemap;
use serde_json::Value;
use tracing::{debug, trace};

use crate::accumulate::{AccumulateSpec, AccumulationContext, GroupContext};
use crate::agenda::{Activation, MatchKind};
use crate::constraint::{all_allowed, BetaConstraint, Bindings};
use crate::error::{ReteError, Result};
use crate::memory::{BetaMemory, IdMap, NodeMemory, PartitionMemory, Signal};
use crate::network::{Network, PathLayout, SegmentLayout};
use crate::node::{NetworkNode, Node, NodeId, NodeKind, PathId, RuleId, SegmentId};
use crate::tuple::{OpKind, PropagationContext, StagedType, TupleId, TupleSets, TupleValue};

type Contexts = IdMap<u64, AccumulationContext>;

fn ids(bitmap: &RoaringTreemap) -> Vec<TupleId> {
    bitmap.iter().map(TupleId::from_raw).collect()
}

impl PartitionMemory {
    // ------------- policy -------------
    /// A path is evaluated when it is dirty and either linked or holding
    /// retractions, or when a subnetwork feeding it has work.
    pub fn should_evaluate(&self, net: &Network, path: PathId) -> Result<bool> {
        let layout = net.path(path)?;
        if self.feeder_pending(net, layout)? {
            return Ok(true);
        }
        let Some(memory) = self.paths.get(&path) else {
            return Ok(false);
        };
        Ok(memory.dirty && (memory.is_linked() || self.has_retractions(net, layout)?))
    }

    fn feeder_pending(&self, net: &Network, layout: &PathLayout) -> Result<bool> {
        for segment in &layout.segments {
            for id in &net.segment(*segment)?.nodes {
                if let Some(feeder) = Self::feeding_path(net, net.node(*id)?)? {
                    if self.should_evaluate(net, feeder)? {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    fn feeding_path(net: &Network, node: &Node) -> Result<Option<PathId>> {
        match node.right_source {
            Some(right) if matches!(net.node(right)?.kind, NodeKind::SubnetworkAdapter { .. }) => {
                Ok(Some(net.path_of_terminal(right)?))
            }
            _ => Ok(None),
        }
    }

    fn has_retractions(&self, net: &Network, layout: &PathLayout) -> Result<bool> {
        for segment in &layout.segments {
            if self
                .segments
                .get(segment)
                .is_some_and(|memory| memory.staged_left.has_retractions())
            {
                return Ok(true);
            }
            for id in &net.segment(*segment)?.nodes {
                if self
                    .nodes
                    .get(id)
                    .and_then(NodeMemory::beta)
                    .is_some_and(|beta| beta.staged_right.has_retractions())
                {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    // ------------- drivers -------------
    /// Flushes queued eager paths, then evaluates `path` if it is due.
    pub fn evaluate_rule_path(&mut self, net: &Network, path: PathId) -> Result<bool> {
        self.flush(net)?;
        if !self.should_evaluate(net, path)? {
            return Ok(false);
        }
        self.evaluate_path(net, path)?;
        Ok(true)
    }

    /// Evaluates every due path of the partition until none is left.
    pub fn evaluate_all(&mut self, net: &Network) -> Result<usize> {
        self.flush(net)?;
        let paths: Vec<PathId> = net
            .paths()
            .iter()
            .filter(|layout| layout.partition == self.id)
            .map(|layout| layout.id)
            .collect();
        let mut evaluated = 0;
        loop {
            let mut progressed = false;
            for path in &paths {
                if self.should_evaluate(net, *path)? {
                    self.evaluate_path(net, *path)?;
                    evaluated += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        debug!(partition = self.id.0, evaluated, "partition settled");
        Ok(evaluated)
    }

    pub(crate) fn evaluate_path(&mut self, net: &Network, path: PathId) -> Result<()> {
        self.evaluations += 1;
        if self.evaluations > self.max_evaluations {
            return Err(ReteError::Invariant(format!(
                "evaluation did not settle after {} path evaluations",
                self.max_evaluations
            )));
        }
        let layout = net.path(path)?;
        trace!(partition = self.id.0, path = path.0, segments = layout.segments.len(), "evaluating path");
        for segment in &layout.segments {
            self.evaluate_segment(net, *segment)?;
        }
        if let Some(memory) = self.paths.get_mut(&path) {
            memory.dirty = false;
            memory.evaluated = true;
        }
        Ok(())
    }

    fn evaluate_segment(&mut self, net: &Network, segment: SegmentId) -> Result<()> {
        let layout = net.segment(segment)?;
        // subnetworks must deliver before their outer nodes run
        for id in &layout.nodes {
            if let Some(feeder) = Self::feeding_path(net, net.node(*id)?)? {
                if self.should_evaluate(net, feeder)? {
                    self.evaluate_path(net, feeder)?;
                }
            }
        }
        let Some(memory) = self.segments.get_mut(&segment) else {
            return Ok(());
        };
        if !memory.is_dirty() {
            return Ok(());
        }
        let mut src = memory.staged_left.take();
        memory.dirty_node_mask = 0;
        let skip = usize::from(matches!(net.node(layout.root())?.kind, NodeKind::Adapter));
        for id in &layout.nodes[skip..] {
            let node = net.node(*id)?;
            let mut trg = TupleSets::new();
            match &node.kind {
                NodeKind::Join { constraints } => self.evaluate_join(node, constraints, src, &mut trg)?,
                NodeKind::Not { constraints } => self.evaluate_negation(net, node, constraints, false, src, &mut trg)?,
                NodeKind::Exists { constraints } => self.evaluate_negation(net, node, constraints, true, src, &mut trg)?,
                NodeKind::Accumulate(spec) => self.evaluate_accumulate(node, spec, src, &mut trg)?,
                NodeKind::Terminal { rule } => self.evaluate_terminal(node, *rule, src)?,
                NodeKind::SubnetworkAdapter { outer } => self.evaluate_subnetwork(net, node, *outer, src)?,
                other => {
                    return Err(ReteError::Invariant(format!("{} node {} inside segment {}", other.label(), node.id, segment.0)));
                }
            }
            src = trg;
        }
        self.propagate_to_children(net, layout, src)
    }

    fn propagate_to_children(&mut self, net: &Network, layout: &SegmentLayout, output: TupleSets) -> Result<()> {
        if output.is_empty() {
            return Ok(());
        }
        if layout.children.is_empty() {
            return Err(ReteError::Invariant(format!("segment {} has output but no child", layout.id.0)));
        }
        let (inserts, updates, deletes) = output.into_parts();
        for tuple in deletes {
            let chain = self.tuples.peer_chain(tuple)?;
            for (child, member) in layout.children.iter().zip(chain) {
                self.stage_left(net, *child, member, OpKind::Delete)?;
            }
        }
        for tuple in updates {
            let chain = self.tuples.peer_chain(tuple)?;
            let context = self.tuples.get(tuple)?.context;
            for (child, member) in layout.children.iter().zip(chain) {
                let held = self
                    .segments
                    .get(child)
                    .is_some_and(|memory| memory.staged_left.contains(member));
                let entry = self.tuples.get_mut(member)?;
                entry.context = context;
                if !held {
                    // the flag belonged to the consumed output set
                    entry.staged = StagedType::None;
                }
                self.stage_left(net, *child, member, OpKind::Update)?;
            }
        }
        for tuple in inserts {
            self.tuples.get_mut(tuple)?.staged = StagedType::None;
            let chain = self.build_peers(net, tuple, &layout.children)?;
            for (child, member) in layout.children.iter().zip(chain) {
                self.stage_left(net, *child, member, OpKind::Insert)?;
            }
        }
        Ok(())
    }

    // ------------- shared helpers -------------
    fn left_bindings(&self, left: TupleId) -> Result<Bindings> {
        Ok(Bindings::new(self.tuples.chain_values(left)?))
    }

    /// A fact right tuple binds its fact; a subnetwork right tuple binds
    /// the whole subnetwork chain.
    fn right_bindings(&self, right: TupleId) -> Result<Bindings> {
        let tuple = self.tuples.get(right)?;
        match tuple.subnetwork {
            Some(chain) => Ok(Bindings::new(self.tuples.chain_values(chain)?)),
            None => Ok(Bindings::new(tuple.value.to_value().into_iter().collect())),
        }
    }

    /// Two tuples stand for the same partial match when they are the same
    /// tuple or peers of each other.
    fn same_match(&self, a: TupleId, b: TupleId) -> Result<bool> {
        if a == b {
            return Ok(true);
        }
        let (x, y) = (self.tuples.get(a)?, self.tuples.get(b)?);
        let same_value = match (&x.value, &y.value) {
            (TupleValue::Empty, TupleValue::Empty) => true,
            (TupleValue::Fact(p), TupleValue::Fact(q)) => p.id() == q.id(),
            (TupleValue::Result(p), TupleValue::Result(q)) => p == q && x.group == y.group,
            _ => false,
        };
        Ok(same_value && x.origin == y.origin && x.parent == y.parent && x.right_parent == y.right_parent)
    }

    /// A subnetwork right tuple only pairs with the left tuple its chain
    /// grew from.
    fn correlated(&self, left: TupleId, right: TupleId) -> Result<bool> {
        let Some(chain) = self.tuples.get(right)?.subnetwork else {
            return Ok(true);
        };
        let mut current = Some(chain);
        while let Some(link) = current {
            if self.same_match(link, left)? {
                return Ok(true);
            }
            current = self.tuples.get(link)?.parent;
        }
        Ok(false)
    }

    fn allowed(&self, constraints: &[Arc<dyn BetaConstraint>], left: TupleId, bindings: &Bindings, right: TupleId) -> Result<bool> {
        if !self.correlated(left, right)? {
            return Ok(false);
        }
        all_allowed(constraints, bindings, &self.right_bindings(right)?)
    }

    fn live_children(&self, id: TupleId) -> Result<Vec<TupleId>> {
        let tuple = self.tuples.get(id)?;
        Ok(tuple
            .children
            .iter()
            .copied()
            .filter(|child| self.tuples.get(*child).is_ok_and(|c| c.staged != StagedType::Delete))
            .collect())
    }

    /// Live children keyed by their other parent.
    fn children_by(&self, id: TupleId, right_side: bool) -> Result<BTreeMap<TupleId, TupleId>> {
        let mut keyed = BTreeMap::new();
        for child in self.live_children(id)? {
            let tuple = self.tuples.get(child)?;
            let other = if right_side { tuple.parent } else { tuple.right_parent };
            if let Some(other) = other {
                keyed.insert(other, child);
            }
        }
        Ok(keyed)
    }

    fn begin(&mut self, id: TupleId) -> Result<PropagationContext> {
        let tuple = self.tuples.get_mut(id)?;
        tuple.staged = StagedType::None;
        Ok(tuple.context)
    }

    fn emit_insert(
        &mut self,
        trg: &mut TupleSets,
        node: &Node,
        parent: TupleId,
        right_parent: Option<TupleId>,
        value: TupleValue,
        context: PropagationContext,
    ) -> Result<TupleId> {
        let sink = node.tuple_sinks.first().copied().unwrap_or(node.id);
        let child = self.tuples.create_child(parent, right_parent, value, node.id, sink, context)?;
        trg.add_insert(&mut self.tuples, child)?;
        Ok(child)
    }

    fn emit_update(&mut self, trg: &mut TupleSets, child: TupleId, context: PropagationContext) -> Result<()> {
        self.tuples.get_mut(child)?.context = context;
        trg.add_update(&mut self.tuples, child)?;
        Ok(())
    }

    fn emit_delete(&mut self, trg: &mut TupleSets, child: TupleId, context: PropagationContext) -> Result<()> {
        self.tuples.get_mut(child)?.context = context;
        trg.add_delete(&mut self.tuples, child)?;
        Ok(())
    }

    fn retract_children(&mut self, trg: &mut TupleSets, id: TupleId) -> Result<()> {
        let tuple = self.tuples.get(id)?;
        let (context, children) = (tuple.context, tuple.children.clone());
        for child in children {
            self.emit_delete(trg, child, context)?;
        }
        Ok(())
    }

    fn take_beta(&mut self, id: NodeId) -> Result<BetaMemory> {
        match self.take_node(id)? {
            NodeMemory::Beta(beta) => Ok(beta),
            other => {
                self.put_node(id, other);
                Err(ReteError::Invariant(format!("{id} has no beta memory")))
            }
        }
    }

    // ------------- join -------------
    fn evaluate_join(&mut self, node: &Node, constraints: &[Arc<dyn BetaConstraint>], src: TupleSets, trg: &mut TupleSets) -> Result<()> {
        let mut memory = self.take_beta(node.id)?;
        let outcome = self.join(node, constraints, &mut memory, src, trg);
        self.put_node(node.id, NodeMemory::Beta(memory));
        outcome
    }

    fn join(
        &mut self,
        node: &Node,
        constraints: &[Arc<dyn BetaConstraint>],
        memory: &mut BetaMemory,
        src: TupleSets,
        trg: &mut TupleSets,
    ) -> Result<()> {
        let (left_inserts, left_updates, left_deletes) = src.into_parts();
        let (right_inserts, right_updates, right_deletes) = memory.staged_right.take().into_parts();

        for left in left_deletes {
            memory.left.remove(left.raw());
            self.retract_children(trg, left)?;
            self.tuples.detach_and_release(left)?;
        }
        for right in right_deletes {
            memory.right.remove(right.raw());
            self.retract_children(trg, right)?;
            self.tuples.detach_and_release(right)?;
        }

        let rights = ids(&memory.right);
        for left in left_updates {
            let context = self.begin(left)?;
            let bindings = self.left_bindings(left)?;
            let mut existing = self.children_by(left, false)?;
            for right in &rights {
                let allowed = self.allowed(constraints, left, &bindings, *right)?;
                match (allowed, existing.remove(right)) {
                    (true, Some(child)) => self.emit_update(trg, child, context)?,
                    (true, None) => {
                        let value = self.tuples.get(*right)?.value.clone();
                        self.emit_insert(trg, node, left, Some(*right), value, context)?;
                    }
                    (false, Some(child)) => self.emit_delete(trg, child, context)?,
                    (false, None) => {}
                }
            }
        }

        let lefts = ids(&memory.left);
        for right in right_updates {
            let context = self.begin(right)?;
            let mut existing = self.children_by(right, true)?;
            for left in &lefts {
                let bindings = self.left_bindings(*left)?;
                let allowed = self.allowed(constraints, *left, &bindings, right)?;
                match (allowed, existing.remove(left)) {
                    (true, Some(child)) => self.emit_update(trg, child, context)?,
                    (true, None) => {
                        let value = self.tuples.get(right)?.value.clone();
                        self.emit_insert(trg, node, *left, Some(right), value, context)?;
                    }
                    (false, Some(child)) => self.emit_delete(trg, child, context)?,
                    (false, None) => {}
                }
            }
        }

        for left in left_inserts {
            let context = self.begin(left)?;
            memory.left.insert(left.raw());
            let bindings = self.left_bindings(left)?;
            for right in &rights {
                if self.allowed(constraints, left, &bindings, *right)? {
                    let value = self.tuples.get(*right)?.value.clone();
                    self.emit_insert(trg, node, left, Some(*right), value, context)?;
                }
            }
        }

        for right in right_inserts {
            let context = self.begin(right)?;
            memory.right.insert(right.raw());
            for left in ids(&memory.left) {
                let bindings = self.left_bindings(left)?;
                if self.allowed(constraints, left, &bindings, right)? {
                    let value = self.tuples.get(right)?.value.clone();
                    self.emit_insert(trg, node, left, Some(right), value, context)?;
                }
            }
        }
        Ok(())
    }

    // ------------- not / exists -------------
    fn evaluate_negation(
        &mut self,
        net: &Network,
        node: &Node,
        constraints: &[Arc<dyn BetaConstraint>],
        exists: bool,
        src: TupleSets,
        trg: &mut TupleSets,
    ) -> Result<()> {
        let mut memory = self.take_beta(node.id)?;
        let outcome = self.negate(node, constraints, exists, &mut memory, src, trg);
        let right_empty = memory.right.is_empty();
        self.put_node(node.id, NodeMemory::Beta(memory));
        outcome?;
        if !exists && node.is_unconstrained_not(net.is_subnetwork_fed(node)) {
            if right_empty {
                self.link_node(net, node.id)?;
            } else {
                self.unlink_node(net, node.id)?;
            }
        }
        Ok(())
    }

    fn block(&mut self, left: TupleId, right: TupleId) -> Result<()> {
        self.tuples.get_mut(left)?.blockers.insert(right.raw());
        self.tuples.get_mut(right)?.blockers.insert(left.raw());
        Ok(())
    }

    fn unhook_blockers(&mut self, left: TupleId) -> Result<()> {
        let blockers = std::mem::take(&mut self.tuples.get_mut(left)?.blockers);
        for raw in blockers.iter() {
            if let Ok(right) = self.tuples.get_mut(TupleId::from_raw(raw)) {
                right.blockers.remove(left.raw());
            }
        }
        Ok(())
    }

    /// A not node passes unblocked left tuples, an exists node blocked ones.
    fn negate(
        &mut self,
        node: &Node,
        constraints: &[Arc<dyn BetaConstraint>],
        exists: bool,
        memory: &mut BetaMemory,
        src: TupleSets,
        trg: &mut TupleSets,
    ) -> Result<()> {
        let staged = memory.staged_right.take();
        if !staged.updates().is_empty() {
            node.kind.check_right_update()?;
        }
        let (left_inserts, left_updates, left_deletes) = src.into_parts();
        let (right_inserts, _, right_deletes) = staged.into_parts();

        for left in left_deletes {
            memory.left.remove(left.raw());
            self.unhook_blockers(left)?;
            self.retract_children(trg, left)?;
            self.tuples.detach_and_release(left)?;
        }
        for right in right_deletes {
            memory.right.remove(right.raw());
            let tuple = self.tuples.get(right)?;
            let (context, blocked) = (tuple.context, tuple.blockers.clone());
            for raw in blocked.iter() {
                let left = TupleId::from_raw(raw);
                let Ok(entry) = self.tuples.get_mut(left) else {
                    continue;
                };
                entry.blockers.remove(right.raw());
                if !entry.blockers.is_empty() {
                    continue;
                }
                let children = self.live_children(left)?;
                if exists {
                    for child in children {
                        self.emit_delete(trg, child, context)?;
                    }
                } else if children.is_empty() {
                    self.emit_insert(trg, node, left, None, TupleValue::Empty, context)?;
                }
            }
            self.tuples.detach_and_release(right)?;
        }

        let rights = ids(&memory.right);
        for left in left_updates {
            let context = self.begin(left)?;
            let bindings = self.left_bindings(left)?;
            self.unhook_blockers(left)?;
            for right in &rights {
                if self.allowed(constraints, left, &bindings, *right)? {
                    self.block(left, *right)?;
                }
            }
            let blocked = !self.tuples.get(left)?.blockers.is_empty();
            let child = self.live_children(left)?.first().copied();
            match (blocked == exists, child) {
                (true, Some(child)) => self.emit_update(trg, child, context)?,
                (true, None) => {
                    self.emit_insert(trg, node, left, None, TupleValue::Empty, context)?;
                }
                (false, Some(child)) => self.emit_delete(trg, child, context)?,
                (false, None) => {}
            }
        }

        for left in left_inserts {
            let context = self.begin(left)?;
            memory.left.insert(left.raw());
            let bindings = self.left_bindings(left)?;
            for right in &rights {
                if self.allowed(constraints, left, &bindings, *right)? {
                    self.block(left, *right)?;
                }
            }
            let blocked = !self.tuples.get(left)?.blockers.is_empty();
            if blocked == exists {
                self.emit_insert(trg, node, left, None, TupleValue::Empty, context)?;
            }
        }

        for right in right_inserts {
            let context = self.begin(right)?;
            memory.right.insert(right.raw());
            for left in ids(&memory.left) {
                let bindings = self.left_bindings(left)?;
                if !self.allowed(constraints, left, &bindings, right)? {
                    continue;
                }
                let was_blocked = !self.tuples.get(left)?.blockers.is_empty();
                self.block(left, right)?;
                if was_blocked {
                    continue;
                }
                if exists {
                    self.emit_insert(trg, node, left, None, TupleValue::Empty, context)?;
                } else {
                    for child in self.live_children(left)? {
                        self.emit_delete(trg, child, context)?;
                    }
                }
            }
        }
        Ok(())
    }

    // ------------- accumulate -------------
    fn evaluate_accumulate(&mut self, node: &Node, spec: &AccumulateSpec, src: TupleSets, trg: &mut TupleSets) -> Result<()> {
        let (mut memory, mut contexts) = match self.take_node(node.id)? {
            NodeMemory::Accumulate { beta, contexts } => (beta, contexts),
            other => {
                self.put_node(node.id, other);
                return Err(ReteError::Invariant(format!("{} has no accumulate memory", node.id)));
            }
        };
        let outcome = self.accumulate(node, spec, &mut memory, &mut contexts, src, trg);
        self.put_node(node.id, NodeMemory::Accumulate { beta: memory, contexts });
        outcome
    }

    fn contribute(&self, spec: &AccumulateSpec, context: &mut AccumulationContext, left: &Bindings, right: TupleId) -> Result<()> {
        let bindings = self.right_bindings(right)?;
        let key = match &spec.grouping {
            Some(grouping) => grouping.apply(left, &bindings)?,
            None => Value::Null,
        };
        let input = match &spec.extractor {
            Some(extractor) => extractor.apply(left, &bindings)?,
            None => bindings.last().cloned().unwrap_or(Value::Null),
        };
        context.add(spec, right, key, input)
    }

    /// Brings the result tuples of `left` in line with its groups. Retired
    /// groups hand their result tuple to a group recreated under the same
    /// key, otherwise it is deleted. `force` updates every surviving result.
    #[allow(clippy::too_many_arguments)]
    fn refresh_groups(
        &mut self,
        node: &Node,
        spec: &AccumulateSpec,
        left: TupleId,
        context: &mut AccumulationContext,
        retired: Vec<GroupContext>,
        trg: &mut TupleSets,
        stamp: PropagationContext,
        force: bool,
    ) -> Result<()> {
        for group in retired {
            let Some(result) = group.result_tuple() else {
                continue;
            };
            match context.groups().get(group.key()) {
                Some(current) if current.result_tuple().is_none() => {
                    context.set_result_tuple(group.key(), Some(result));
                }
                _ => self.emit_delete(trg, result, stamp)?,
            }
        }
        let mut keys = context.take_dirty();
        if force {
            keys = context.groups().iter().map(|group| group.key().to_owned()).collect();
        }
        for key in keys {
            let output = context.output(spec, &key, left)?;
            let current = context.groups().get(&key).and_then(GroupContext::result_tuple);
            match (output, current) {
                (Some(value), Some(result)) => {
                    let tuple = self.tuples.get_mut(result)?;
                    let unchanged = matches!(&tuple.value, TupleValue::Result(old) if *old == value);
                    if force || !unchanged {
                        tuple.value = TupleValue::Result(value);
                        self.emit_update(trg, result, stamp)?;
                    }
                }
                (Some(value), None) => {
                    let result = self.emit_insert(trg, node, left, None, TupleValue::Result(value), stamp)?;
                    self.tuples.get_mut(result)?.group = Some(key.clone());
                    context.set_result_tuple(&key, Some(result));
                }
                (None, Some(result)) => {
                    self.emit_delete(trg, result, stamp)?;
                    context.set_result_tuple(&key, None);
                }
                (None, None) => {}
            }
        }
        Ok(())
    }

    fn accumulate(
        &mut self,
        node: &Node,
        spec: &AccumulateSpec,
        memory: &mut BetaMemory,
        contexts: &mut Contexts,
        src: TupleSets,
        trg: &mut TupleSets,
    ) -> Result<()> {
        let constraints = &spec.constraints;
        let (left_inserts, left_updates, left_deletes) = src.into_parts();
        let (right_inserts, right_updates, right_deletes) = memory.staged_right.take().into_parts();

        for left in left_deletes {
            memory.left.remove(left.raw());
            if let Some(context) = contexts.remove(&left.raw()) {
                for right in context.matched() {
                    if let Ok(tuple) = self.tuples.get_mut(right) {
                        tuple.blockers.remove(left.raw());
                    }
                }
            }
            self.retract_children(trg, left)?;
            self.tuples.detach_and_release(left)?;
        }
        for right in right_deletes {
            memory.right.remove(right.raw());
            let tuple = self.tuples.get(right)?;
            let (stamp, lefts) = (tuple.context, tuple.blockers.clone());
            for raw in lefts.iter() {
                let Some(context) = contexts.get_mut(&raw) else {
                    continue;
                };
                let retired = context.remove(spec, right)?;
                self.refresh_groups(node, spec, TupleId::from_raw(raw), context, retired.into_iter().collect(), trg, stamp, false)?;
            }
            self.tuples.detach_and_release(right)?;
        }

        let rights = ids(&memory.right);
        for left in left_updates {
            let stamp = self.begin(left)?;
            let bindings = self.left_bindings(left)?;
            let old = contexts.remove(&left.raw()).unwrap_or_else(|| AccumulationContext::new(spec));
            for right in old.matched() {
                if let Ok(tuple) = self.tuples.get_mut(right) {
                    tuple.blockers.remove(left.raw());
                }
            }
            let mut context = AccumulationContext::new(spec);
            for right in &rights {
                if self.allowed(constraints, left, &bindings, *right)? {
                    self.contribute(spec, &mut context, &bindings, *right)?;
                    self.tuples.get_mut(*right)?.blockers.insert(left.raw());
                }
            }
            let retired: Vec<GroupContext> = old.groups().iter().cloned().collect();
            self.refresh_groups(node, spec, left, &mut context, retired, trg, stamp, true)?;
            contexts.insert(left.raw(), context);
        }

        let lefts = ids(&memory.left);
        for right in right_updates {
            let stamp = self.begin(right)?;
            for left in &lefts {
                let Some(context) = contexts.get_mut(&left.raw()) else {
                    continue;
                };
                let bindings = self.left_bindings(*left)?;
                let was_member = context.contains(right);
                let retired = if was_member { context.remove(spec, right)? } else { None };
                if self.allowed(constraints, *left, &bindings, right)? {
                    self.contribute(spec, context, &bindings, right)?;
                    self.tuples.get_mut(right)?.blockers.insert(left.raw());
                } else {
                    self.tuples.get_mut(right)?.blockers.remove(left.raw());
                }
                if was_member || context.contains(right) {
                    self.refresh_groups(node, spec, *left, context, retired.into_iter().collect(), trg, stamp, false)?;
                }
            }
        }

        for left in left_inserts {
            let stamp = self.begin(left)?;
            memory.left.insert(left.raw());
            let bindings = self.left_bindings(left)?;
            let mut context = AccumulationContext::new(spec);
            for right in &rights {
                if self.allowed(constraints, left, &bindings, *right)? {
                    self.contribute(spec, &mut context, &bindings, *right)?;
                    self.tuples.get_mut(*right)?.blockers.insert(left.raw());
                }
            }
            self.refresh_groups(node, spec, left, &mut context, Vec::new(), trg, stamp, false)?;
            contexts.insert(left.raw(), context);
        }

        for right in right_inserts {
            let stamp = self.begin(right)?;
            memory.right.insert(right.raw());
            for left in ids(&memory.left) {
                let Some(context) = contexts.get_mut(&left.raw()) else {
                    continue;
                };
                let bindings = self.left_bindings(left)?;
                if self.allowed(constraints, left, &bindings, right)? {
                    self.contribute(spec, context, &bindings, right)?;
                    self.tuples.get_mut(right)?.blockers.insert(left.raw());
                    self.refresh_groups(node, spec, left, context, Vec::new(), trg, stamp, false)?;
                }
            }
        }
        Ok(())
    }

    // ------------- terminal -------------
    fn evaluate_terminal(&mut self, node: &Node, rule: RuleId, src: TupleSets) -> Result<()> {
        let mut matches = match self.take_node(node.id)? {
            NodeMemory::Terminal { matches } => matches,
            other => {
                self.put_node(node.id, other);
                return Err(ReteError::Invariant(format!("{} has no terminal memory", node.id)));
            }
        };
        let outcome = self.fire(rule, &mut matches, src);
        self.put_node(node.id, NodeMemory::Terminal { matches });
        outcome
    }

    fn activation(&self, tuple: TupleId) -> Result<Activation> {
        Ok(Activation {
            id: tuple.raw(),
            facts: self.tuples.chain_facts(tuple)?,
            values: self.tuples.chain_values(tuple)?,
        })
    }

    fn fire(&mut self, rule: RuleId, matches: &mut BTreeMap<u64, Activation>, src: TupleSets) -> Result<()> {
        let (inserts, updates, deletes) = src.into_parts();
        for tuple in deletes {
            let context = self.tuples.get(tuple)?.context;
            if let Some(activation) = matches.remove(&tuple.raw()) {
                self.outbox.push(Signal::Match {
                    rule,
                    kind: MatchKind::Cancelled,
                    activation,
                    context,
                });
            }
            self.tuples.detach_and_release(tuple)?;
        }
        for (kind, batch) in [(MatchKind::Updated, updates), (MatchKind::Created, inserts)] {
            for tuple in batch {
                let context = self.begin(tuple)?;
                let activation = self.activation(tuple)?;
                matches.insert(tuple.raw(), activation.clone());
                self.outbox.push(Signal::Match {
                    rule,
                    kind,
                    activation,
                    context,
                });
            }
        }
        Ok(())
    }

    // ------------- subnetwork adapter -------------
    fn evaluate_subnetwork(&mut self, net: &Network, node: &Node, outer: NodeId, src: TupleSets) -> Result<()> {
        let mut left = match self.take_node(node.id)? {
            NodeMemory::Subnetwork { left } => left,
            other => {
                self.put_node(node.id, other);
                return Err(ReteError::Invariant(format!("{} has no subnetwork memory", node.id)));
            }
        };
        let outcome = self.feed_outer(net, outer, &mut left, src);
        self.put_node(node.id, NodeMemory::Subnetwork { left });
        outcome
    }

    fn feed_outer(&mut self, net: &Network, outer: NodeId, memory: &mut RoaringTreemap, src: TupleSets) -> Result<()> {
        let (inserts, updates, deletes) = src.into_parts();
        for left in deletes {
            memory.remove(left.raw());
            let tuple = self.tuples.get(left)?;
            let (context, right) = (tuple.context, tuple.subnetwork);
            if let Some(right) = right.filter(|right| self.tuples.contains(*right)) {
                self.tuples.get_mut(right)?.context = context;
                self.right_delete(net, outer, right, false)?;
            }
            self.tuples.detach_and_release(left)?;
        }
        let in_place = net.node(outer)?.kind.supports_right_update();
        for left in updates {
            let context = self.begin(left)?;
            let right = self.tuples.get(left)?.subnetwork;
            match right.filter(|right| self.tuples.contains(*right)) {
                Some(right) if in_place => {
                    self.tuples.get_mut(right)?.context = context;
                    self.modify_right_tuple(net, outer, right)?;
                }
                Some(right) => {
                    self.tuples.get_mut(right)?.context = context;
                    self.right_delete(net, outer, right, false)?;
                    self.assert_subnetwork_match(net, outer, left, context)?;
                }
                None => self.assert_subnetwork_match(net, outer, left, context)?,
            }
        }
        for left in inserts {
            let context = self.begin(left)?;
            memory.insert(left.raw());
            self.assert_subnetwork_match(net, outer, left, context)?;
        }
        Ok(())
    }

    fn assert_subnetwork_match(&mut self, net: &Network, outer: NodeId, left: TupleId, context: PropagationContext) -> Result<()> {
        let right = self.tuples.create_right(TupleValue::Empty, outer, context);
        self.tuples.get_mut(right)?.subnetwork = Some(left);
        self.tuples.get_mut(left)?.subnetwork = Some(right);
        self.right_insert(net, outer, right)
    }
}
