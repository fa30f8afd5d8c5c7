//! Tuples, the tuple arena and staged change sets.
//!
//! A left tuple is a chain of fact handles, one link per pattern, that
//! represents a partial match for the node it sits in. A right tuple wraps a
//! single fact (or a subnetwork match) waiting on the right input of a beta
//! node. Tuples reference each other (parent, right parent, peer, children)
//! through generation-checked [`TupleId`]s into a [`TupleKeeper`] arena, so
//! the cyclic relations never turn into ownership cycles.

use std::fmt;
use std::sync::Arc;

use roaring::RoaringTreemap;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ReteError, Result};
use crate::fact::{FactHandle, FactId};
use crate::node::NodeId;

// ------------- TupleId -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TupleId {
    index: u32,
    generation: u32,
}

impl TupleId {
    /// Raw form used as the key in roaring bitmaps. The slot index sits in
    /// the high half so that bitmap iteration follows slot order.
    pub fn raw(&self) -> u64 {
        ((self.index as u64) << 32) | self.generation as u64
    }
    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: (raw >> 32) as u32,
            generation: raw as u32,
        }
    }
}

impl fmt::Display for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "t{}.{}", self.index, self.generation)
    }
}

// ------------- PropagationContext -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

/// Stamp carried by every tuple touched by one external fact change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PropagationContext {
    pub number: u64,
    pub fact: FactId,
    pub kind: OpKind,
}

impl PropagationContext {
    pub fn new(number: u64, fact: FactId, kind: OpKind) -> Self {
        Self { number, fact, kind }
    }
}

// ------------- Tuple -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleKind {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedType {
    None,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub enum TupleValue {
    /// Not/exists outputs contribute no fact to the chain.
    Empty,
    Fact(Arc<FactHandle>),
    /// Accumulate outputs carry the aggregate instead of a fact.
    Result(Value),
}

impl TupleValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, TupleValue::Empty)
    }
    pub fn to_value(&self) -> Option<Value> {
        match self {
            TupleValue::Empty => None,
            TupleValue::Fact(handle) => Some(handle.value()),
            TupleValue::Result(value) => Some(value.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tuple {
    pub kind: TupleKind,
    pub value: TupleValue,
    pub parent: Option<TupleId>,
    pub right_parent: Option<TupleId>,
    /// Node that created the tuple.
    pub origin: NodeId,
    /// Node whose memory the tuple enters.
    pub sink: NodeId,
    pub peer: Option<TupleId>,
    pub children: Vec<TupleId>,
    pub context: PropagationContext,
    pub staged: StagedType,
    /// Not/exists: right tuples blocking this left tuple, or, on a right
    /// tuple, the left tuples it blocks.
    pub blockers: RoaringTreemap,
    /// Links a subnetwork adapter's left tuple and the right tuple it feeds.
    pub subnetwork: Option<TupleId>,
    /// Accumulate outputs: the key of the group they report.
    pub group: Option<String>,
}

impl Tuple {
    fn new(kind: TupleKind, value: TupleValue, origin: NodeId, sink: NodeId, context: PropagationContext) -> Self {
        Self {
            kind,
            value,
            parent: None,
            right_parent: None,
            origin,
            sink,
            peer: None,
            children: Vec::new(),
            context,
            staged: StagedType::None,
            blockers: RoaringTreemap::new(),
            subnetwork: None,
            group: None,
        }
    }
    pub fn fact_id(&self) -> Option<FactId> {
        match &self.value {
            TupleValue::Fact(handle) => Some(handle.id()),
            _ => None,
        }
    }
}

// ------------- TupleKeeper -------------
#[derive(Debug)]
struct Slot {
    generation: u32,
    tuple: Option<Tuple>,
}

#[derive(Debug, Default)]
pub struct TupleKeeper {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl TupleKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    fn keep(&mut self, tuple: Tuple) -> TupleId {
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.tuple = Some(tuple);
                TupleId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    tuple: Some(tuple),
                });
                TupleId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    pub fn get(&self, id: TupleId) -> Result<&Tuple> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.tuple.as_ref())
            .ok_or_else(|| ReteError::Invariant(format!("stale tuple {id}")))
    }

    pub fn get_mut(&mut self, id: TupleId) -> Result<&mut Tuple> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.tuple.as_mut())
            .ok_or_else(|| ReteError::Invariant(format!("stale tuple {id}")))
    }

    pub fn contains(&self, id: TupleId) -> bool {
        self.get(id).is_ok()
    }

    pub fn release(&mut self, id: TupleId) -> Result<Tuple> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or_else(|| ReteError::Invariant(format!("release of stale tuple {id}")))?;
        let tuple = slot
            .tuple
            .take()
            .ok_or_else(|| ReteError::Invariant(format!("double release of tuple {id}")))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Ok(tuple)
    }

    /// Unhooks a tuple from its parents' child lists, then releases it.
    pub fn detach_and_release(&mut self, id: TupleId) -> Result<Tuple> {
        let tuple = self.release(id)?;
        for parent in [tuple.parent, tuple.right_parent].into_iter().flatten() {
            if let Ok(parent) = self.get_mut(parent) {
                parent.children.retain(|child| *child != id);
            }
        }
        Ok(tuple)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (TupleId, &Tuple)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.tuple.as_ref().map(|tuple| {
                (
                    TupleId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    tuple,
                )
            })
        })
    }

    pub fn create_root(
        &mut self,
        handle: Arc<FactHandle>,
        origin: NodeId,
        sink: NodeId,
        context: PropagationContext,
    ) -> TupleId {
        self.keep(Tuple::new(TupleKind::Left, TupleValue::Fact(handle), origin, sink, context))
    }

    pub fn create_right(
        &mut self,
        value: TupleValue,
        origin: NodeId,
        context: PropagationContext,
    ) -> TupleId {
        self.keep(Tuple::new(TupleKind::Right, value, origin, origin, context))
    }

    /// Creates a left child of `parent` (and of `right_parent` for joins),
    /// registering it in their child lists.
    pub fn create_child(
        &mut self,
        parent: TupleId,
        right_parent: Option<TupleId>,
        value: TupleValue,
        origin: NodeId,
        sink: NodeId,
        context: PropagationContext,
    ) -> Result<TupleId> {
        let mut tuple = Tuple::new(TupleKind::Left, value, origin, sink, context);
        tuple.parent = Some(parent);
        tuple.right_parent = right_parent;
        let id = self.keep(tuple);
        self.get_mut(parent)?.children.push(id);
        if let Some(right) = right_parent {
            self.get_mut(right)?.children.push(id);
        }
        Ok(id)
    }

    /// Clones `original` for a sibling segment rooted at `sink`. The peer is
    /// not registered as a child; it is only reachable through the peer link.
    pub fn create_peer(&mut self, original: TupleId, sink: NodeId) -> Result<TupleId> {
        let source = self.get(original)?;
        let mut peer = Tuple::new(TupleKind::Left, source.value.clone(), source.origin, sink, source.context);
        peer.parent = source.parent;
        peer.right_parent = source.right_parent;
        peer.group = source.group.clone();
        let id = self.keep(peer);
        self.get_mut(original)?.peer = Some(id);
        Ok(id)
    }

    /// The tuple followed by its peers, in sibling segment order.
    pub fn peer_chain(&self, id: TupleId) -> Result<Vec<TupleId>> {
        let mut chain = vec![id];
        let mut current = self.get(id)?.peer;
        while let Some(peer) = current {
            match self.get(peer) {
                Ok(tuple) => {
                    chain.push(peer);
                    current = tuple.peer;
                }
                Err(_) => break,
            }
        }
        Ok(chain)
    }

    /// Values of a left chain ordered from the root, skipping links that
    /// carry no fact.
    pub fn chain_values(&self, id: TupleId) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        let mut current = Some(id);
        while let Some(link) = current {
            let tuple = self.get(link)?;
            if let Some(value) = tuple.value.to_value() {
                values.push(value);
            }
            current = tuple.parent;
        }
        values.reverse();
        Ok(values)
    }

    /// Fact ids of a left chain ordered from the root.
    pub fn chain_facts(&self, id: TupleId) -> Result<Vec<FactId>> {
        let mut facts = Vec::new();
        let mut current = Some(id);
        while let Some(link) = current {
            let tuple = self.get(link)?;
            if let Some(fact) = tuple.fact_id() {
                facts.push(fact);
            }
            current = tuple.parent;
        }
        facts.reverse();
        Ok(facts)
    }

    /// Number of fact-carrying links on the chain.
    pub fn object_count(&self, id: TupleId) -> Result<usize> {
        let mut count = 0;
        let mut current = Some(id);
        while let Some(link) = current {
            let tuple = self.get(link)?;
            if !tuple.value.is_empty() {
                count += 1;
            }
            current = tuple.parent;
        }
        Ok(count)
    }

    /// True when the tuple, or any tuple it was derived from, is `fact`.
    pub fn derives_from(&self, id: TupleId, fact: FactId) -> bool {
        let mut current = Some(id);
        while let Some(link) = current {
            let Ok(tuple) = self.get(link) else {
                return false;
            };
            if tuple.fact_id() == Some(fact) {
                return true;
            }
            if let Some(right) = tuple.right_parent {
                if self.derives_from(right, fact) {
                    return true;
                }
            }
            if let Some(sub) = tuple.subnetwork {
                if tuple.kind == TupleKind::Right && self.derives_from(sub, fact) {
                    return true;
                }
            }
            current = tuple.parent;
        }
        false
    }
}

// ------------- TupleSets -------------
/// Pending inserts, updates and deletes, not yet evaluated.
#[derive(Debug, Default, Clone)]
pub struct TupleSets {
    inserts: Vec<TupleId>,
    updates: Vec<TupleId>,
    deletes: Vec<TupleId>,
}

impl TupleSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn has_retractions(&self) -> bool {
        !self.updates.is_empty() || !self.deletes.is_empty()
    }

    pub fn inserts(&self) -> &[TupleId] {
        &self.inserts
    }
    pub fn updates(&self) -> &[TupleId] {
        &self.updates
    }
    pub fn deletes(&self) -> &[TupleId] {
        &self.deletes
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    pub fn take(&mut self) -> TupleSets {
        std::mem::take(self)
    }

    pub fn into_parts(self) -> (Vec<TupleId>, Vec<TupleId>, Vec<TupleId>) {
        (self.inserts, self.updates, self.deletes)
    }

    /// Returns whether the set was empty before the call.
    pub fn add_insert(&mut self, keeper: &mut TupleKeeper, id: TupleId) -> Result<bool> {
        let was_empty = self.is_empty();
        keeper.get_mut(id)?.staged = StagedType::Insert;
        self.inserts.push(id);
        Ok(was_empty)
    }

    /// A tuple already staged in this set stays where it is. One staged in
    /// another set is recorded without touching its flag, so the update
    /// still reaches that tuple's peers.
    pub fn add_update(&mut self, keeper: &mut TupleKeeper, id: TupleId) -> Result<bool> {
        let was_empty = self.is_empty();
        let tuple = keeper.get_mut(id)?;
        match tuple.staged {
            StagedType::None => tuple.staged = StagedType::Update,
            _ if self.contains(id) => return Ok(false),
            _ => {}
        }
        self.updates.push(id);
        Ok(was_empty)
    }

    /// A delete cancels a pending insert held by this set (the tuple is
    /// released on the spot) and supersedes a pending update. A tuple staged
    /// in some other set keeps its flag; that set normalizes it once the
    /// delete reaches it.
    pub fn add_delete(&mut self, keeper: &mut TupleKeeper, id: TupleId) -> Result<bool> {
        let was_empty = self.is_empty();
        let staged = keeper.get(id)?.staged;
        match staged {
            StagedType::Insert => {
                if let Some(pos) = self.inserts.iter().position(|t| *t == id) {
                    self.inserts.remove(pos);
                    keeper.detach_and_release(id)?;
                    return Ok(false);
                }
            }
            StagedType::Update => {
                if let Some(pos) = self.updates.iter().position(|t| *t == id) {
                    self.updates.remove(pos);
                    keeper.get_mut(id)?.staged = StagedType::Delete;
                    self.deletes.push(id);
                    return Ok(false);
                }
            }
            StagedType::Delete => {
                if self.deletes.contains(&id) {
                    return Ok(false);
                }
            }
            StagedType::None => {
                keeper.get_mut(id)?.staged = StagedType::Delete;
            }
        }
        self.deletes.push(id);
        Ok(was_empty)
    }

    pub fn contains(&self, id: TupleId) -> bool {
        self.inserts.contains(&id) || self.updates.contains(&id) || self.deletes.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::FactKeeper;
    use serde_json::json;

    fn ctx(kind: OpKind) -> PropagationContext {
        PropagationContext::new(1, FactId(1), kind)
    }

    #[test]
    fn released_ids_are_stale() {
        let mut facts = FactKeeper::new();
        let mut keeper = TupleKeeper::new();
        let handle = facts.keep("A", json!(1));
        let id = keeper.create_root(handle, NodeId(1), NodeId(2), ctx(OpKind::Insert));
        keeper.release(id).unwrap();
        assert!(keeper.get(id).is_err());
        let reused = keeper.create_right(TupleValue::Empty, NodeId(3), ctx(OpKind::Insert));
        assert_ne!(reused, id);
        assert!(keeper.get(id).is_err());
        assert_eq!(TupleId::from_raw(reused.raw()), reused);
    }

    #[test]
    fn delete_cancels_staged_insert() {
        let mut facts = FactKeeper::new();
        let mut keeper = TupleKeeper::new();
        let mut staged = TupleSets::new();
        let handle = facts.keep("A", json!(1));
        let id = keeper.create_root(handle, NodeId(1), NodeId(2), ctx(OpKind::Insert));
        assert!(staged.add_insert(&mut keeper, id).unwrap());
        assert!(!staged.add_update(&mut keeper, id).unwrap());
        assert!(!staged.add_delete(&mut keeper, id).unwrap());
        assert!(staged.is_empty());
        assert!(keeper.is_empty());
    }

    #[test]
    fn delete_supersedes_staged_update() {
        let mut facts = FactKeeper::new();
        let mut keeper = TupleKeeper::new();
        let mut staged = TupleSets::new();
        let handle = facts.keep("A", json!(1));
        let id = keeper.create_root(handle, NodeId(1), NodeId(2), ctx(OpKind::Insert));
        staged.add_update(&mut keeper, id).unwrap();
        staged.add_delete(&mut keeper, id).unwrap();
        assert_eq!(staged.deletes(), &[id]);
        assert!(staged.updates().is_empty());
        assert!(staged.has_retractions());
    }

    #[test]
    fn children_and_peers_share_a_parent() {
        let mut facts = FactKeeper::new();
        let mut keeper = TupleKeeper::new();
        let a = keeper.create_root(facts.keep("A", json!("a")), NodeId(1), NodeId(2), ctx(OpKind::Insert));
        let b = keeper.create_right(TupleValue::Fact(facts.keep("B", json!("b"))), NodeId(2), ctx(OpKind::Insert));
        let ab = keeper
            .create_child(a, Some(b), TupleValue::Empty, NodeId(2), NodeId(3), ctx(OpKind::Insert))
            .unwrap();
        let peer = keeper.create_peer(ab, NodeId(4)).unwrap();
        assert_eq!(keeper.peer_chain(ab).unwrap(), vec![ab, peer]);
        assert_eq!(keeper.get(a).unwrap().children, vec![ab]);
        assert_eq!(keeper.chain_values(peer).unwrap(), vec![json!("a")]);
        keeper.detach_and_release(ab).unwrap();
        assert!(keeper.get(a).unwrap().children.is_empty());
        assert!(keeper.get(b).unwrap().children.is_empty());
    }
}
