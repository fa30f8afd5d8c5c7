//! Notifications from the network to the scheduling layer.
//!
//! The network never fires rules itself. It reports which rules became
//! dirty, linked or unlinked, and which matches were created, updated or
//! cancelled. A [`Scheduler`] decides what to do with that; [`Agenda`] is the
//! bundled implementation and simply keeps the current matches per rule.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use crate::error::ReteError;
use crate::fact::FactId;
use crate::tuple::PropagationContext;

/// A complete match held by a terminal node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Activation {
    /// Stable while the match lives.
    pub id: u64,
    pub facts: Vec<FactId>,
    /// Bound values, facts and accumulate results, root first.
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchKind {
    Created,
    Updated,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchEvent {
    pub rule: String,
    pub kind: MatchKind,
    pub activation: Activation,
    pub context: PropagationContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Notification {
    SegmentDirty { rule: String },
    PathLinked { rule: String },
    PathUnlinked { rule: String },
    Match(MatchEvent),
}

pub trait Scheduler: Send {
    fn notify(&mut self, notification: &Notification);
    /// Called after a rule's path was evaluated on request.
    fn evaluated(&mut self, _rule: &str) {}
}

// ------------- Agenda -------------
#[derive(Debug, Default)]
pub struct Agenda {
    eligible: BTreeSet<String>,
    dirty: BTreeSet<String>,
    activations: BTreeMap<String, Vec<Activation>>,
    log: Vec<Notification>,
}

impl Agenda {
    pub fn new() -> Self {
        Self::default()
    }
    /// Rules whose path is fully linked.
    pub fn is_eligible(&self, rule: &str) -> bool {
        self.eligible.contains(rule)
    }
    pub fn is_dirty(&self, rule: &str) -> bool {
        self.dirty.contains(rule)
    }
    pub fn dirty_rules(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }
    /// Live matches of a rule, oldest first.
    pub fn activations(&self, rule: &str) -> &[Activation] {
        self.activations.get(rule).map(Vec::as_slice).unwrap_or(&[])
    }
    pub fn total_activations(&self) -> usize {
        self.activations.values().map(Vec::len).sum()
    }
    pub fn log(&self) -> &[Notification] {
        &self.log
    }
    pub fn drain_log(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.log)
    }
}

impl Scheduler for Agenda {
    fn notify(&mut self, notification: &Notification) {
        match notification {
            Notification::SegmentDirty { rule } => {
                self.dirty.insert(rule.clone());
            }
            Notification::PathLinked { rule } => {
                self.eligible.insert(rule.clone());
            }
            Notification::PathUnlinked { rule } => {
                self.eligible.remove(rule);
            }
            Notification::Match(event) => {
                let held = self.activations.entry(event.rule.clone()).or_default();
                let pos = held.iter().position(|a| a.id == event.activation.id);
                match (event.kind, pos) {
                    (MatchKind::Created, _) | (MatchKind::Updated, None) => held.push(event.activation.clone()),
                    (MatchKind::Updated, Some(pos)) => held[pos] = event.activation.clone(),
                    (MatchKind::Cancelled, Some(pos)) => {
                        held.remove(pos);
                    }
                    (MatchKind::Cancelled, None) => {}
                }
                trace!(rule = %event.rule, kind = ?event.kind, id = event.activation.id, "match");
            }
        }
        self.log.push(notification.clone());
    }
    fn evaluated(&mut self, rule: &str) {
        self.dirty.remove(rule);
    }
}

// ------------- operation listeners -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Evaluate,
    Dispose,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationBoundary {
    pub kind: OperationKind,
    pub fact: Option<FactId>,
    pub at: DateTime<Utc>,
}

impl OperationBoundary {
    pub fn now(kind: OperationKind, fact: Option<FactId>) -> Self {
        Self {
            kind,
            fact,
            at: Utc::now(),
        }
    }
}

/// Observes the start and end of every session operation.
pub trait OperationListener: Send {
    fn operation_started(&mut self, boundary: &OperationBoundary);
    fn operation_ended(&mut self, boundary: &OperationBoundary, error: Option<&ReteError>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::OpKind;

    fn event(kind: MatchKind, id: u64) -> Notification {
        Notification::Match(MatchEvent {
            rule: "r".into(),
            kind,
            activation: Activation {
                id,
                facts: vec![FactId(id)],
                values: vec![],
            },
            context: PropagationContext::new(1, FactId(id), OpKind::Insert),
        })
    }

    #[test]
    fn matches_are_kept_in_creation_order() {
        let mut agenda = Agenda::new();
        agenda.notify(&event(MatchKind::Created, 2));
        agenda.notify(&event(MatchKind::Created, 1));
        agenda.notify(&event(MatchKind::Updated, 2));
        let ids: Vec<u64> = agenda.activations("r").iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![2, 1]);
        agenda.notify(&event(MatchKind::Cancelled, 2));
        assert_eq!(agenda.activations("r").len(), 1);
        assert_eq!(agenda.drain_log().len(), 4);
    }

    #[test]
    fn eligibility_follows_linking() {
        let mut agenda = Agenda::new();
        agenda.notify(&Notification::PathLinked { rule: "r".into() });
        assert!(agenda.is_eligible("r"));
        agenda.notify(&Notification::PathUnlinked { rule: "r".into() });
        assert!(!agenda.is_eligible("r"));
        agenda.notify(&Notification::SegmentDirty { rule: "r".into() });
        assert!(agenda.is_dirty("r"));
        agenda.evaluated("r");
        assert!(!agenda.is_dirty("r"));
    }
}
