//! Sessions: one working memory over a shared knowledge base.
//!
//! A session owns the facts and one [`PartitionMemory`] per partition of the
//! rule base. Inserts, updates and deletes are propagated synchronously and
//! leave the network staged; rules are evaluated when pulled through
//! [`Session::evaluate_rule`] or [`Session::evaluate_all`], except for eager
//! paths, which are flushed inside the triggering call. Any failure during a
//! propagation poisons the session.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::agenda::{Activation, Agenda, MatchEvent, Notification, OperationBoundary, OperationKind, OperationListener, Scheduler};
use crate::config::EngineConfig;
use crate::error::{ReteError, Result};
use crate::fact::{FactHandle, FactId, FactKeeper};
use crate::memory::{NodeMemory, PartitionMemory, Signal};
use crate::network::{KnowledgeBase, Network, SessionGuard};
use crate::node::{NodeId, NodeKind, PartitionId, PathId};
use crate::tuple::{OpKind, PropagationContext, StagedType, TupleId, TupleKeeper, TupleKind};

/// A left tuple as seen from outside.
#[derive(Debug, Clone, PartialEq)]
pub struct TupleInfo {
    pub facts: Vec<FactId>,
    pub values: Vec<Value>,
    /// Fact-carrying links on the parent chain.
    pub objects: usize,
    pub context: PropagationContext,
    pub staged: StagedType,
    pub origin: NodeId,
    pub sink: NodeId,
}

/// One group of an accumulate node, as seen from outside.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupInfo {
    pub key: String,
    pub serial: u64,
    pub members: u64,
    pub state: Value,
}

impl KnowledgeBase {
    pub fn new_session(&self) -> Result<Session<Agenda>> {
        self.new_session_with(Agenda::new())
    }

    pub fn new_session_with<S: Scheduler>(&self, scheduler: S) -> Result<Session<S>> {
        let guard = self.register_session()?;
        let partitions = self.network()?.partitions();
        let config = self.config().clone();
        info!(partitions, sessions = self.live_sessions(), "session opened");
        Ok(Session {
            network: self.shared(),
            _guard: guard,
            facts: FactKeeper::new(),
            partitions: (0..partitions)
                .map(|p| PartitionMemory::new(PartitionId(p), config.max_path_evaluations))
                .collect(),
            scheduler,
            listeners: Vec::new(),
            propagations: 0,
            poisoned: None,
            config,
        })
    }
}

pub struct Session<S: Scheduler = Agenda> {
    network: Arc<RwLock<Network>>,
    _guard: SessionGuard,
    facts: FactKeeper,
    partitions: Vec<PartitionMemory>,
    scheduler: S,
    listeners: Vec<Box<dyn OperationListener>>,
    propagations: u64,
    poisoned: Option<String>,
    config: EngineConfig,
}

impl<S: Scheduler> Session<S> {
    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }
    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }
    pub fn add_listener(&mut self, listener: Box<dyn OperationListener>) {
        self.listeners.push(listener);
    }
    pub fn fact(&self, id: FactId) -> Result<Arc<FactHandle>> {
        self.facts.get(id)
    }
    pub fn fact_count(&self) -> usize {
        self.facts.len()
    }
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    fn check(&self) -> Result<()> {
        match &self.poisoned {
            Some(reason) => Err(ReteError::SessionPoisoned(reason.clone())),
            None => Ok(()),
        }
    }

    fn next_context(&mut self, fact: FactId, kind: OpKind) -> PropagationContext {
        self.propagations += 1;
        PropagationContext::new(self.propagations, fact, kind)
    }

    fn start(&mut self, kind: OperationKind, fact: Option<FactId>) -> OperationBoundary {
        let boundary = OperationBoundary::now(kind, fact);
        for listener in self.listeners.iter_mut() {
            listener.operation_started(&boundary);
        }
        for memory in self.partitions.iter_mut() {
            memory.begin_operation();
        }
        boundary
    }

    fn finish<T>(&mut self, net: &Network, boundary: OperationBoundary, outcome: Result<T>) -> Result<T> {
        if let Err(e) = &outcome {
            warn!(error = %e, operation = ?boundary.kind, fact = ?boundary.fact, "propagation failed, session poisoned");
            self.poisoned = Some(e.to_string());
        }
        self.dispatch(net);
        let error = outcome.as_ref().err();
        for listener in self.listeners.iter_mut() {
            listener.operation_ended(&boundary, error);
        }
        outcome
    }

    fn partition_of(&self, net: &Network, node: NodeId) -> Result<usize> {
        let partition = net.node(node)?.partition.0 as usize;
        if partition < self.partitions.len() {
            Ok(partition)
        } else {
            Err(ReteError::Invariant(format!("{node} sits in unknown partition {partition}")))
        }
    }

    fn flush(&mut self, net: &Network, touched: BTreeSet<usize>) -> Result<()> {
        for partition in touched {
            self.partitions[partition].flush(net)?;
        }
        Ok(())
    }

    // ------------- fact changes -------------
    pub fn insert(&mut self, fact_type: &str, value: Value) -> Result<FactId> {
        self.check()?;
        let network = Arc::clone(&self.network);
        let net = network.read()?;
        let handle = self.facts.keep(fact_type, value);
        let id = handle.id();
        let boundary = self.start(OperationKind::Insert, Some(id));
        let context = self.next_context(id, OpKind::Insert);
        let outcome = self.propagate_insert(&net, &handle, context);
        debug!(fact = %id, fact_type, "inserted");
        self.finish(&net, boundary, outcome).map(|_| id)
    }

    fn propagate_insert(&mut self, net: &Network, handle: &Arc<FactHandle>, context: PropagationContext) -> Result<()> {
        let mut touched = BTreeSet::new();
        for (sink, passes) in net.object_sinks(handle.fact_type(), &handle.value())? {
            if !passes {
                continue;
            }
            let partition = self.partition_of(net, sink)?;
            self.partitions[partition].insert_fact(net, sink, Arc::clone(handle), context)?;
            touched.insert(partition);
        }
        self.flush(net, touched)
    }

    pub fn update(&mut self, id: FactId, value: Value) -> Result<()> {
        self.check()?;
        let network = Arc::clone(&self.network);
        let net = network.read()?;
        let handle = self.facts.get(id)?;
        let boundary = self.start(OperationKind::Update, Some(id));
        let context = self.next_context(id, OpKind::Update);
        let outcome = handle
            .swap(value)
            .and_then(|_| self.propagate_update(&net, &handle, context));
        debug!(fact = %id, version = handle.version(), "updated");
        self.finish(&net, boundary, outcome)
    }

    fn propagate_update(&mut self, net: &Network, handle: &Arc<FactHandle>, context: PropagationContext) -> Result<()> {
        let id = handle.id();
        let mut touched = BTreeSet::new();
        for (sink, passes) in net.object_sinks(handle.fact_type(), &handle.value())? {
            let partition = self.partition_of(net, sink)?;
            let memory = &mut self.partitions[partition];
            match (passes, memory.holds(id, sink).is_some()) {
                (true, true) => memory.update_fact(net, sink, Arc::clone(handle), context)?,
                (true, false) => memory.insert_fact(net, sink, Arc::clone(handle), context)?,
                (false, true) => memory.delete_fact(net, sink, id, context)?,
                (false, false) => continue,
            }
            touched.insert(partition);
        }
        self.flush(net, touched)
    }

    pub fn delete(&mut self, id: FactId) -> Result<()> {
        self.check()?;
        let network = Arc::clone(&self.network);
        let net = network.read()?;
        self.facts.get(id)?;
        let boundary = self.start(OperationKind::Delete, Some(id));
        let context = self.next_context(id, OpKind::Delete);
        let outcome = self.propagate_delete(&net, id, context);
        debug!(fact = %id, "deleted");
        self.finish(&net, boundary, outcome)
    }

    fn propagate_delete(&mut self, net: &Network, id: FactId, context: PropagationContext) -> Result<()> {
        for memory in self.partitions.iter_mut() {
            if memory.delete_fact_everywhere(net, id, context)? > 0 {
                memory.flush(net)?;
            }
        }
        self.facts.release(id)?;
        Ok(())
    }

    // ------------- evaluation -------------
    /// Brings one rule up to date and returns its live matches.
    pub fn evaluate_rule(&mut self, rule: &str) -> Result<Vec<Activation>> {
        self.check()?;
        let network = Arc::clone(&self.network);
        let net = network.read()?;
        let rule_id = net.rule_id(rule)?;
        let terminal = net.rule(rule_id)?.terminal;
        let path = net.path_of_rule(rule_id)?;
        let partition = self.partition_of(&net, terminal)?;
        let boundary = self.start(OperationKind::Evaluate, None);
        let outcome = self.partitions[partition].evaluate_rule_path(&net, path);
        let evaluated = self.finish(&net, boundary, outcome)?;
        debug!(rule, evaluated, "rule evaluated");
        self.scheduler.evaluated(rule);
        Ok(self.partitions[partition].matches(terminal))
    }

    /// Evaluates every due path of every partition. Returns the number of
    /// path evaluations performed.
    pub fn evaluate_all(&mut self) -> Result<usize> {
        self.check()?;
        let network = Arc::clone(&self.network);
        let net = network.read()?;
        let boundary = self.start(OperationKind::Evaluate, None);
        let outcome = if self.config.parallel_evaluation && self.partitions.len() > 1 {
            let shared: &Network = &net;
            std::thread::scope(|scope| {
                let workers: Vec<_> = self
                    .partitions
                    .iter_mut()
                    .map(|memory| scope.spawn(move || memory.evaluate_all(shared)))
                    .collect();
                workers
                    .into_iter()
                    .map(|worker| {
                        worker
                            .join()
                            .map_err(|_| ReteError::Invariant("partition worker panicked".into()))
                            .and_then(|evaluated| evaluated)
                    })
                    .sum::<Result<usize>>()
            })
        } else {
            let mut total = 0;
            let mut outcome = Ok(());
            for memory in self.partitions.iter_mut() {
                match memory.evaluate_all(&net) {
                    Ok(evaluated) => total += evaluated,
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                }
            }
            outcome.map(|_| total)
        };
        let evaluated = self.finish(&net, boundary, outcome)?;
        for (_, entry) in net.rules() {
            self.scheduler.evaluated(&entry.name);
        }
        info!(evaluated, "all partitions evaluated");
        Ok(evaluated)
    }

    /// Ends the session, releasing its working memory.
    pub fn dispose(mut self) {
        let boundary = self.start(OperationKind::Dispose, None);
        let (facts, tuples) = (self.facts.len(), self.live_tuples());
        self.partitions.clear();
        for listener in self.listeners.iter_mut() {
            listener.operation_ended(&boundary, None);
        }
        info!(facts, tuples, "session disposed");
    }

    // ------------- notifications -------------
    fn dispatch(&mut self, net: &Network) {
        for memory in self.partitions.iter_mut() {
            for signal in memory.drain_signals() {
                for notification in translate(net, signal) {
                    self.scheduler.notify(&notification);
                }
            }
        }
    }

    // ------------- introspection -------------
    fn rule_path(&self, net: &Network, rule: &str) -> Result<(PathId, usize)> {
        let rule_id = net.rule_id(rule)?;
        let partition = self.partition_of(net, net.rule(rule_id)?.terminal)?;
        Ok((net.path_of_rule(rule_id)?, partition))
    }

    /// True when every segment on the rule's path is linked.
    pub fn path_linked(&self, rule: &str) -> Result<bool> {
        let net = self.network.read()?;
        let (path, partition) = self.rule_path(&net, rule)?;
        Ok(self.partitions[partition]
            .path_memory(path)
            .is_some_and(|memory| memory.is_linked()))
    }

    pub fn path_mask(&self, rule: &str) -> Result<u64> {
        let net = self.network.read()?;
        let (path, partition) = self.rule_path(&net, rule)?;
        Ok(self.partitions[partition]
            .path_memory(path)
            .map(|memory| memory.linked_segment_mask)
            .unwrap_or(0))
    }

    /// Linked node mask of the rule's `index`-th segment, root first. A
    /// segment without memory reports zero.
    pub fn segment_mask(&self, rule: &str, index: usize) -> Result<u64> {
        let net = self.network.read()?;
        let (path, partition) = self.rule_path(&net, rule)?;
        let segment = nth_segment(&net, path, rule, index)?;
        Ok(self.partitions[partition]
            .segment_memory(segment)
            .map(|memory| memory.linked_node_mask)
            .unwrap_or(0))
    }

    /// Left tuples staged on the rule's `index`-th segment.
    pub fn staged_left(&self, rule: &str, index: usize) -> Result<Vec<TupleInfo>> {
        let net = self.network.read()?;
        let (path, partition) = self.rule_path(&net, rule)?;
        let segment = nth_segment(&net, path, rule, index)?;
        let memory = &self.partitions[partition];
        let Some(staged) = memory.segment_memory(segment).map(|segment| &segment.staged_left) else {
            return Ok(Vec::new());
        };
        let tuples = memory.tuples();
        staged
            .inserts()
            .iter()
            .chain(staged.updates())
            .chain(staged.deletes())
            .map(|id| describe(tuples, *id))
            .collect()
    }

    /// Every live left tuple, in all partitions.
    pub fn left_tuples(&self) -> Result<Vec<TupleInfo>> {
        let mut infos = Vec::new();
        for memory in &self.partitions {
            let tuples = memory.tuples();
            for (id, tuple) in tuples.iter() {
                if tuple.kind == TupleKind::Left {
                    infos.push(describe(tuples, id)?);
                }
            }
        }
        Ok(infos)
    }

    /// Live matches held by the rule's terminal, without evaluating.
    pub fn matches(&self, rule: &str) -> Result<Vec<Activation>> {
        let net = self.network.read()?;
        let rule_id = net.rule_id(rule)?;
        let terminal = net.rule(rule_id)?.terminal;
        let partition = self.partition_of(&net, terminal)?;
        Ok(self.partitions[partition].matches(terminal))
    }

    /// Live tuples, in any memory, derived from `fact`.
    pub fn tuples_derived_from(&self, fact: FactId) -> usize {
        self.partitions.iter().map(|memory| memory.tuples_derived_from(fact)).sum()
    }

    pub fn live_tuples(&self) -> usize {
        self.partitions.iter().map(|memory| memory.tuples().len()).sum()
    }

    pub fn right_memory_len(&self, node: NodeId) -> Result<usize> {
        let net = self.network.read()?;
        let partition = self.partition_of(&net, node)?;
        Ok(self.partitions[partition].right_len(node))
    }

    pub fn left_memory_len(&self, node: NodeId) -> Result<usize> {
        let net = self.network.read()?;
        let partition = self.partition_of(&net, node)?;
        Ok(self.partitions[partition].left_len(node))
    }

    /// Groups of an accumulate node across all its left tuples.
    pub fn groups(&self, node: NodeId) -> Result<Vec<GroupInfo>> {
        let net = self.network.read()?;
        let partition = self.partition_of(&net, node)?;
        let Some(NodeMemory::Accumulate { contexts, .. }) = self.partitions[partition].node_memory(node) else {
            return Ok(Vec::new());
        };
        Ok(contexts
            .values()
            .flat_map(|context| context.groups().iter())
            .map(|group| GroupInfo {
                key: group.key().to_owned(),
                serial: group.serial(),
                members: group.members().len(),
                state: group.state().clone(),
            })
            .collect())
    }
}

fn describe(tuples: &TupleKeeper, id: TupleId) -> Result<TupleInfo> {
    let tuple = tuples.get(id)?;
    Ok(TupleInfo {
        facts: tuples.chain_facts(id)?,
        values: tuples.chain_values(id)?,
        objects: tuples.object_count(id)?,
        context: tuple.context,
        staged: tuple.staged,
        origin: tuple.origin,
        sink: tuple.sink,
    })
}

fn nth_segment(net: &Network, path: PathId, rule: &str, index: usize) -> Result<crate::node::SegmentId> {
    net.path(path)?
        .segments
        .get(index)
        .copied()
        .ok_or_else(|| ReteError::Invariant(format!("rule {rule} has no segment {index}")))
}

fn own_rule(net: &Network, path: PathId) -> Option<String> {
    let rule = net.path(path).ok()?.rule?;
    net.rule_name(rule).map(str::to_owned)
}

/// Rules affected by work on `path`: its own rule, or, for a subnetwork
/// path, the rules of the node it feeds.
fn rules_of_path(net: &Network, path: PathId) -> Vec<String> {
    if let Some(name) = own_rule(net, path) {
        return vec![name];
    }
    let outer = net
        .path(path)
        .and_then(|layout| net.node(layout.terminal))
        .ok()
        .and_then(|node| match node.kind {
            NodeKind::SubnetworkAdapter { outer } => net.node(outer).ok(),
            _ => None,
        });
    outer
        .map(|node| {
            node.rules
                .iter()
                .filter_map(|rule| net.rule_name(*rule).map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

fn translate(net: &Network, signal: Signal) -> Vec<Notification> {
    match signal {
        Signal::SegmentDirty(path) => rules_of_path(net, path)
            .into_iter()
            .map(|rule| Notification::SegmentDirty { rule })
            .collect(),
        Signal::PathLinked(path) => own_rule(net, path)
            .map(|rule| Notification::PathLinked { rule })
            .into_iter()
            .collect(),
        Signal::PathUnlinked(path) => own_rule(net, path)
            .map(|rule| Notification::PathUnlinked { rule })
            .into_iter()
            .collect(),
        Signal::Match {
            rule,
            kind,
            activation,
            context,
        } => net
            .rule_name(rule)
            .map(|name| {
                Notification::Match(MatchEvent {
                    rule: name.to_owned(),
                    kind,
                    activation,
                    context,
                })
            })
            .into_iter()
            .collect(),
    }
}
