//! Segment and path memories with their linking bitmasks.
//!
//! A segment memory has one bit per member node, set while the node has
//! enough data to produce output. A path memory has one bit per segment, set
//! while that segment is fully linked. A rule is eligible exactly when its
//! path mask is all ones, which makes eligibility an integer comparison.

use crate::node::{PathId, SegmentId};
use crate::tuple::TupleSets;

#[derive(Debug, Clone)]
pub struct SegmentMemory {
    pub id: SegmentId,
    pub linked_node_mask: u64,
    pub dirty_node_mask: u64,
    pub all_linked_mask: u64,
    /// The segment's bit in its path masks.
    pub position: u32,
    /// Left tuples entering the segment's first beta node.
    pub staged_left: TupleSets,
    pub paths: Vec<PathId>,
}

impl SegmentMemory {
    pub fn new(id: SegmentId, all_linked_mask: u64, position: u32, paths: Vec<PathId>) -> Self {
        Self {
            id,
            linked_node_mask: 0,
            dirty_node_mask: 0,
            all_linked_mask,
            position,
            staged_left: TupleSets::new(),
            paths,
        }
    }
    pub fn is_linked(&self) -> bool {
        self.linked_node_mask & self.all_linked_mask == self.all_linked_mask
    }
    pub fn bit(&self) -> u64 {
        1 << self.position
    }
    /// Sets a node bit; true when this completes the segment.
    pub fn link_node(&mut self, bit: u64) -> bool {
        let before = self.is_linked();
        self.linked_node_mask |= bit;
        !before && self.is_linked()
    }
    /// Clears a node bit; true when the segment was complete before.
    pub fn unlink_node(&mut self, bit: u64) -> bool {
        let before = self.is_linked();
        self.linked_node_mask &= !bit;
        before && !self.is_linked()
    }
    pub fn is_dirty(&self) -> bool {
        self.dirty_node_mask != 0 || !self.staged_left.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PathMemory {
    pub id: PathId,
    pub linked_segment_mask: u64,
    pub all_linked_mask: u64,
    pub dirty: bool,
    pub eager: bool,
    /// Evaluated at least once.
    pub evaluated: bool,
}

impl PathMemory {
    pub fn new(id: PathId, all_linked_mask: u64, eager: bool) -> Self {
        Self {
            id,
            linked_segment_mask: 0,
            all_linked_mask,
            dirty: false,
            eager,
            evaluated: false,
        }
    }
    pub fn is_linked(&self) -> bool {
        self.linked_segment_mask == self.all_linked_mask
    }
    /// True when the path became fully linked.
    pub fn link_segment(&mut self, bit: u64) -> bool {
        let before = self.is_linked();
        self.linked_segment_mask |= bit;
        !before && self.is_linked()
    }
    /// True when the path stopped being fully linked.
    pub fn unlink_segment(&mut self, bit: u64) -> bool {
        let before = self.is_linked();
        self.linked_segment_mask &= !bit;
        before && !self.is_linked()
    }
}
