//! Rule definitions and their compilation into network nodes.
//!
//! A rule is an ordered list of conditions over typed facts. Compilation walks
//! the conditions left to right, reusing any node an earlier rule already
//! built for the same input and the same constraint objects, and closes the
//! chain with a terminal node of its own.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::accumulate::AccumulateSpec;
use crate::constraint::{AlphaConstraint, BetaConstraint, Constraints, same_constraints};
use crate::error::{ReteError, Result};
use crate::network::{Network, RuleEntry};
use crate::node::{NetworkNode, NodeId, NodeKind, RuleId};

#[derive(Debug, Clone)]
pub struct Pattern {
    pub fact_type: String,
    pub filters: Vec<Arc<AlphaConstraint>>,
}

impl Pattern {
    pub fn new(fact_type: impl Into<String>) -> Self {
        Self {
            fact_type: fact_type.into(),
            filters: Vec::new(),
        }
    }
    pub fn filter(mut self, filter: Arc<AlphaConstraint>) -> Self {
        self.filters.push(filter);
        self
    }
}

/// Right input of a not, exists or accumulate condition.
pub enum Source {
    Pattern(Pattern),
    /// Conditions evaluated in the context of the enclosing left tuple. Their
    /// matches feed the outer node through a subnetwork adapter.
    Subnetwork(Vec<Condition>),
}

impl From<Pattern> for Source {
    fn from(pattern: Pattern) -> Self {
        Source::Pattern(pattern)
    }
}

pub enum Condition {
    Pattern(Pattern),
    Join { pattern: Pattern, constraints: Constraints },
    Not { source: Source, constraints: Constraints },
    Exists { source: Source, constraints: Constraints },
    Accumulate { source: Source, spec: Arc<AccumulateSpec> },
}

impl Condition {
    pub fn pattern(pattern: Pattern) -> Self {
        Condition::Pattern(pattern)
    }
    pub fn join(pattern: Pattern, constraints: Constraints) -> Self {
        Condition::Join { pattern, constraints }
    }
    pub fn not(source: impl Into<Source>, constraints: Constraints) -> Self {
        Condition::Not {
            source: source.into(),
            constraints,
        }
    }
    pub fn exists(source: impl Into<Source>, constraints: Constraints) -> Self {
        Condition::Exists {
            source: source.into(),
            constraints,
        }
    }
    pub fn accumulate(source: impl Into<Source>, spec: Arc<AccumulateSpec>) -> Self {
        Condition::Accumulate {
            source: source.into(),
            spec,
        }
    }
}

pub struct RuleDefinition {
    name: String,
    conditions: Vec<Condition>,
    data_driven: bool,
}

impl RuleDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            conditions: Vec::new(),
            data_driven: false,
        }
    }
    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }
    /// Evaluate the rule's path on every change instead of on demand.
    pub fn data_driven(mut self) -> Self {
        self.data_driven = true;
        self
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }
}

fn validate(constraints: &[Arc<dyn BetaConstraint>], bound: usize) -> Result<()> {
    for constraint in constraints {
        for declaration in constraint.declarations() {
            if declaration.index >= bound {
                return Err(ReteError::Build(format!(
                    "{} declares {} at index {} but only {} facts are bound",
                    constraint.description(),
                    declaration.name,
                    declaration.index,
                    bound
                )));
            }
        }
    }
    Ok(())
}

fn same_beta(a: &NodeKind, b: &NodeKind) -> bool {
    match (a, b) {
        (NodeKind::Join { constraints: x }, NodeKind::Join { constraints: y })
        | (NodeKind::Not { constraints: x }, NodeKind::Not { constraints: y })
        | (NodeKind::Exists { constraints: x }, NodeKind::Exists { constraints: y }) => same_constraints(x, y),
        (NodeKind::Accumulate(x), NodeKind::Accumulate(y)) => Arc::ptr_eq(x, y),
        _ => false,
    }
}

/// Per-rule compilation state.
struct Compilation {
    rule: RuleId,
    nodes: BTreeSet<NodeId>,
}

impl Network {
    pub(crate) fn build_rule(&mut self, rule: RuleId, definition: RuleDefinition) -> Result<()> {
        let RuleDefinition {
            name,
            conditions,
            data_driven,
        } = definition;
        let mut compilation = Compilation {
            rule,
            nodes: BTreeSet::new(),
        };
        let mut conditions = conditions.into_iter();
        let first = match conditions.next() {
            Some(Condition::Pattern(pattern)) => pattern,
            Some(Condition::Join { pattern, constraints }) if constraints.is_empty() => pattern,
            _ => return Err(ReteError::Build(format!("rule {name} must start with a pattern"))),
        };
        let object = self.pattern_tip(&first, &mut compilation)?;
        let mut tip = self.adapter(object, &mut compilation)?;
        let mut bound = self.node(tip)?.object_count;
        for condition in conditions {
            (tip, bound) = self.condition(tip, bound, condition, &mut compilation)?;
        }
        let terminal = self.add_node(NodeKind::Terminal { rule });
        self.claim(terminal, &mut compilation)?;
        let node = self.node_mut(terminal)?;
        node.left_source = Some(tip);
        node.object_count = bound;
        self.node_mut(tip)?.tuple_sinks.push(terminal);
        self.register_rule(
            rule,
            RuleEntry {
                name,
                terminal,
                data_driven,
                nodes: compilation.nodes,
            },
        );
        Ok(())
    }

    fn claim(&mut self, id: NodeId, compilation: &mut Compilation) -> Result<()> {
        self.node_mut(id)?.rules.insert(compilation.rule);
        compilation.nodes.insert(id);
        Ok(())
    }

    fn pattern_tip(&mut self, pattern: &Pattern, compilation: &mut Compilation) -> Result<NodeId> {
        let mut tip = match self.object_type_node(&pattern.fact_type) {
            Some(otn) => otn,
            None => self.add_node(NodeKind::ObjectType {
                fact_type: pattern.fact_type.clone(),
            }),
        };
        self.claim(tip, compilation)?;
        for filter in &pattern.filters {
            let shared = self.node(tip)?.object_sinks.iter().copied().find(|sink| {
                self.node(*sink)
                    .is_ok_and(|node| matches!(&node.kind, NodeKind::Alpha { constraint } if Arc::ptr_eq(constraint, filter)))
            });
            tip = match shared {
                Some(alpha) => alpha,
                None => {
                    let alpha = self.add_node(NodeKind::Alpha {
                        constraint: Arc::clone(filter),
                    });
                    self.node_mut(alpha)?.object_source = Some(tip);
                    self.node_mut(tip)?.object_sinks.push(alpha);
                    alpha
                }
            };
            self.claim(tip, compilation)?;
        }
        Ok(tip)
    }

    fn adapter(&mut self, object: NodeId, compilation: &mut Compilation) -> Result<NodeId> {
        let shared = self
            .node(object)?
            .object_sinks
            .iter()
            .copied()
            .find(|sink| self.node(*sink).is_ok_and(|node| matches!(node.kind, NodeKind::Adapter)));
        let adapter = match shared {
            Some(adapter) => adapter,
            None => {
                let kind = NodeKind::Adapter;
                let object_count = usize::from(kind.adds_object());
                let adapter = self.add_node(kind);
                let node = self.node_mut(adapter)?;
                node.object_source = Some(object);
                node.object_count = object_count;
                self.node_mut(object)?.object_sinks.push(adapter);
                adapter
            }
        };
        self.claim(adapter, compilation)?;
        Ok(adapter)
    }

    /// Compiles one condition onto `tip`, returning the new tip and the
    /// number of facts bound after it.
    fn condition(
        &mut self,
        tip: NodeId,
        bound: usize,
        condition: Condition,
        compilation: &mut Compilation,
    ) -> Result<(NodeId, usize)> {
        match condition {
            Condition::Pattern(pattern) => {
                let right = self.pattern_tip(&pattern, compilation)?;
                self.beta(NodeKind::Join { constraints: Vec::new() }, tip, right, bound, compilation)
            }
            Condition::Join { pattern, constraints } => {
                validate(&constraints, bound)?;
                let right = self.pattern_tip(&pattern, compilation)?;
                self.beta(NodeKind::Join { constraints }, tip, right, bound, compilation)
            }
            Condition::Not { source, constraints } => {
                validate(&constraints, bound)?;
                let right = self.right_input(tip, bound, source, compilation)?;
                self.beta(NodeKind::Not { constraints }, tip, right, bound, compilation)
            }
            Condition::Exists { source, constraints } => {
                validate(&constraints, bound)?;
                let right = self.right_input(tip, bound, source, compilation)?;
                self.beta(NodeKind::Exists { constraints }, tip, right, bound, compilation)
            }
            Condition::Accumulate { source, spec } => {
                validate(&spec.constraints, bound)?;
                let right = self.right_input(tip, bound, source, compilation)?;
                self.beta(NodeKind::Accumulate(spec), tip, right, bound, compilation)
            }
        }
    }

    fn right_input(&mut self, tip: NodeId, bound: usize, source: Source, compilation: &mut Compilation) -> Result<NodeId> {
        match source {
            Source::Pattern(pattern) => self.pattern_tip(&pattern, compilation),
            Source::Subnetwork(conditions) => {
                if conditions.is_empty() {
                    return Err(ReteError::Build("empty subnetwork".into()));
                }
                let (mut sub_tip, mut sub_bound) = (tip, bound);
                for condition in conditions {
                    (sub_tip, sub_bound) = self.condition(sub_tip, sub_bound, condition, compilation)?;
                }
                // the outer node is patched in once it exists
                let adapter = self.add_node(NodeKind::SubnetworkAdapter { outer: sub_tip });
                self.claim(adapter, compilation)?;
                let node = self.node_mut(adapter)?;
                node.left_source = Some(sub_tip);
                node.object_count = sub_bound;
                self.node_mut(sub_tip)?.tuple_sinks.push(adapter);
                Ok(adapter)
            }
        }
    }

    /// Places a beta node after `left`, returning it with the number of
    /// facts bound once its output leaves.
    fn beta(
        &mut self,
        kind: NodeKind,
        left: NodeId,
        right: NodeId,
        bound: usize,
        compilation: &mut Compilation,
    ) -> Result<(NodeId, usize)> {
        let object_count = bound + usize::from(kind.adds_object());
        let subnetwork = matches!(self.node(right)?.kind, NodeKind::SubnetworkAdapter { .. });
        let shared = if subnetwork {
            None
        } else {
            self.node(left)?.tuple_sinks.iter().copied().find(|sink| {
                self.node(*sink)
                    .is_ok_and(|node| node.right_source == Some(right) && same_beta(&node.kind, &kind))
            })
        };
        let id = match shared {
            Some(id) => id,
            None => {
                let id = self.add_node(kind);
                let node = self.node_mut(id)?;
                node.left_source = Some(left);
                node.right_source = Some(right);
                node.object_count = object_count;
                self.node_mut(left)?.tuple_sinks.push(id);
                let right_node = self.node_mut(right)?;
                if right_node.kind.is_object_source() {
                    right_node.object_sinks.push(id);
                } else if let NodeKind::SubnetworkAdapter { outer } = &mut right_node.kind {
                    *outer = id;
                }
                id
            }
        };
        self.claim(id, compilation)?;
        Ok((id, object_count))
    }
}
