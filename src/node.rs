use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::accumulate::AccumulateSpec;
use crate::constraint::{AlphaConstraint, Constraints};
use crate::error::{ReteError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PartitionId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathId(pub u32);

// ------------- NodeKind -------------
#[derive(Debug, Clone)]
pub enum NodeKind {
    ObjectType { fact_type: String },
    Alpha { constraint: Arc<AlphaConstraint> },
    /// Turns a fact into the root left tuple of a path.
    Adapter,
    Join { constraints: Constraints },
    Not { constraints: Constraints },
    Exists { constraints: Constraints },
    Accumulate(Arc<AccumulateSpec>),
    Terminal { rule: RuleId },
    /// Tip of a subnetwork: feeds its left tuples into the right input of
    /// the `outer` node.
    SubnetworkAdapter { outer: NodeId },
}

/// What a node can do, answered per variant.
pub trait NetworkNode {
    fn is_tuple_source(&self) -> bool;
    fn is_tuple_sink(&self) -> bool;
    fn is_object_source(&self) -> bool;
    /// Owns a bit in its segment's linking mask.
    fn is_linkable(&self) -> bool;
    fn always_linked(&self) -> bool;
    fn supports_right_update(&self) -> bool;
    /// Outputs extend the left chain by one fact-carrying link.
    fn adds_object(&self) -> bool;
    /// Outputs may be cloned into peers when the node fans out.
    fn creates_peer(&self) -> bool;
}

impl NetworkNode for NodeKind {
    fn is_tuple_source(&self) -> bool {
        matches!(
            self,
            NodeKind::Adapter | NodeKind::Join { .. } | NodeKind::Not { .. } | NodeKind::Exists { .. } | NodeKind::Accumulate(_)
        )
    }
    fn is_tuple_sink(&self) -> bool {
        matches!(
            self,
            NodeKind::Join { .. }
                | NodeKind::Not { .. }
                | NodeKind::Exists { .. }
                | NodeKind::Accumulate(_)
                | NodeKind::Terminal { .. }
                | NodeKind::SubnetworkAdapter { .. }
        )
    }
    fn is_object_source(&self) -> bool {
        matches!(self, NodeKind::ObjectType { .. } | NodeKind::Alpha { .. })
    }
    fn is_linkable(&self) -> bool {
        self.is_tuple_source()
    }
    fn always_linked(&self) -> bool {
        match self {
            NodeKind::Not { constraints } => !constraints.is_empty(),
            NodeKind::Accumulate(_) => true,
            _ => false,
        }
    }
    fn supports_right_update(&self) -> bool {
        matches!(self, NodeKind::Join { .. } | NodeKind::Accumulate(_))
    }
    fn adds_object(&self) -> bool {
        matches!(self, NodeKind::Adapter | NodeKind::Join { .. } | NodeKind::Accumulate(_))
    }
    fn creates_peer(&self) -> bool {
        self.is_tuple_source()
    }
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::ObjectType { .. } => "object-type",
            NodeKind::Alpha { .. } => "alpha",
            NodeKind::Adapter => "adapter",
            NodeKind::Join { .. } => "join",
            NodeKind::Not { .. } => "not",
            NodeKind::Exists { .. } => "exists",
            NodeKind::Accumulate(_) => "accumulate",
            NodeKind::Terminal { .. } => "terminal",
            NodeKind::SubnetworkAdapter { .. } => "subnetwork",
        }
    }
    pub fn constraints(&self) -> &[Arc<dyn crate::constraint::BetaConstraint>] {
        match self {
            NodeKind::Join { constraints } | NodeKind::Not { constraints } | NodeKind::Exists { constraints } => constraints,
            NodeKind::Accumulate(spec) => &spec.constraints,
            _ => &[],
        }
    }
    pub fn is_beta(&self) -> bool {
        matches!(
            self,
            NodeKind::Join { .. } | NodeKind::Not { .. } | NodeKind::Exists { .. } | NodeKind::Accumulate(_)
        )
    }
    /// Not and exists nodes decide on blocker sets, so a right tuple has to
    /// be retracted and asserted again instead.
    pub fn check_right_update(&self) -> Result<()> {
        if self.supports_right_update() {
            Ok(())
        } else {
            Err(ReteError::UnsupportedOperation(format!(
                "in-place right tuple update on a {} node",
                self.label()
            )))
        }
    }
}

// ------------- Node -------------
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub partition: PartitionId,
    pub kind: NodeKind,
    /// Object type or alpha node feeding an alpha node or an adapter.
    pub object_source: Option<NodeId>,
    pub left_source: Option<NodeId>,
    pub right_source: Option<NodeId>,
    pub object_sinks: Vec<NodeId>,
    pub tuple_sinks: Vec<NodeId>,
    /// Fact-carrying links on the chains this node outputs.
    pub object_count: usize,
    pub segment: Option<SegmentId>,
    pub segment_pos: u32,
    pub rules: BTreeSet<RuleId>,
}

impl Node {
    pub fn new(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            partition: PartitionId::default(),
            kind,
            object_source: None,
            left_source: None,
            right_source: None,
            object_sinks: Vec::new(),
            tuple_sinks: Vec::new(),
            object_count: 0,
            segment: None,
            segment_pos: 0,
            rules: BTreeSet::new(),
        }
    }
    pub fn bit(&self) -> u64 {
        1 << self.segment_pos
    }
    /// A not node without constraints whose right input is plain facts. Its
    /// verdict is global, so its linking follows the right memory.
    pub fn is_unconstrained_not(&self, subnetwork_fed: bool) -> bool {
        matches!(&self.kind, NodeKind::Not { constraints } if constraints.is_empty()) && !subnetwork_fed
    }
    /// Segment the node sits in; asking before layout is a wiring defect.
    pub fn segment(&self) -> Result<SegmentId> {
        self.segment
            .ok_or_else(|| ReteError::Invariant(format!("{} {} is not attached to a segment", self.kind.label(), self.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulate::{AccumulateSpec, Count};

    #[test]
    fn negations_reject_in_place_right_updates() {
        let not = NodeKind::Not { constraints: vec![] };
        let exists = NodeKind::Exists { constraints: vec![] };
        let join = NodeKind::Join { constraints: vec![] };
        let accumulate = NodeKind::Accumulate(Arc::new(AccumulateSpec::new(Arc::new(Count))));
        assert!(matches!(not.check_right_update(), Err(ReteError::UnsupportedOperation(_))));
        assert!(matches!(exists.check_right_update(), Err(ReteError::UnsupportedOperation(_))));
        assert!(join.check_right_update().is_ok());
        assert!(accumulate.check_right_update().is_ok());
    }

    #[test]
    fn linkable_nodes_are_tuple_sources() {
        assert!(NodeKind::Adapter.is_linkable());
        assert!(!NodeKind::Terminal { rule: RuleId(0) }.is_linkable());
        assert!(!NodeKind::SubnetworkAdapter { outer: NodeId(1) }.is_linkable());
        assert!(NodeKind::Accumulate(Arc::new(AccumulateSpec::new(Arc::new(Count)))).always_linked());
        assert!(!NodeKind::Not { constraints: vec![] }.always_linked());
    }
}
